mod kubeconfig;

pub use self::kubeconfig::{KubeConfig, KubeConfigError};

use lazy_static::lazy_static;
use regex::Regex;

use std::fmt::{self, Display};
use std::io;
use std::path::Path;

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_SERVER_HOSTNAME: &str = "kubernetes.default.svc";

/// The first segment of every annotation key that this crate interprets, unless overridden
pub const DEFAULT_ANNOTATION_DOMAIN: &str = "kubesync.dev";
/// The second segment of every annotation key that this crate interprets, unless overridden
pub const DEFAULT_ANNOTATION_PACKAGE: &str = "kubesync";

pub const CONTROLLER_NAME_ENV_VAR: &str = "KUBESYNC_CONTROLLER_NAME";
pub const ANNOTATION_DOMAIN_ENV_VAR: &str = "KUBESYNC_ANNOTATION_DOMAIN";
pub const ANNOTATION_PACKAGE_ENV_VAR: &str = "KUBESYNC_ANNOTATION_PACKAGE";

lazy_static! {
    static ref CONTROLLER_NAME_REGEX: Regex =
        Regex::new("^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").unwrap();
}

/// Configuration for how a sync controller identifies itself. The controller name is
/// the process-wide identity that scopes which ignore annotations this instance honors.
/// It's read once on startup and then passed explicitly to everything that needs it.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub controller_name: String,
    pub annotation_domain: String,
    pub annotation_package: String,
}

impl SyncConfig {
    /// Creates a new `SyncConfig` using the default annotation domain and package.
    /// Returns an error if the `controller_name` cannot be used as an annotation key segment.
    pub fn new(controller_name: impl Into<String>) -> Result<SyncConfig, SyncConfigError> {
        let controller_name = controller_name.into();
        validate_controller_name(controller_name.as_str())?;
        Ok(SyncConfig {
            controller_name,
            annotation_domain: DEFAULT_ANNOTATION_DOMAIN.to_owned(),
            annotation_package: DEFAULT_ANNOTATION_PACKAGE.to_owned(),
        })
    }

    /// Loads the configuration from the `KUBESYNC_CONTROLLER_NAME`, `KUBESYNC_ANNOTATION_DOMAIN`
    /// and `KUBESYNC_ANNOTATION_PACKAGE` environment variables. Only the controller name is required.
    pub fn from_env() -> Result<SyncConfig, SyncConfigError> {
        let name = std::env::var(CONTROLLER_NAME_ENV_VAR)
            .ok()
            .filter(|n| !n.is_empty())
            .ok_or(SyncConfigError::MissingName)?;
        let mut config = SyncConfig::new(name)?;
        if let Ok(domain) = std::env::var(ANNOTATION_DOMAIN_ENV_VAR) {
            config = config.with_annotation_domain(domain);
        }
        if let Ok(package) = std::env::var(ANNOTATION_PACKAGE_ENV_VAR) {
            config = config.with_annotation_package(package);
        }
        log::debug!("Loaded sync configuration from environment: {:?}", config);
        Ok(config)
    }

    pub fn with_annotation_domain(mut self, domain: impl Into<String>) -> Self {
        self.annotation_domain = domain.into();
        self
    }

    pub fn with_annotation_package(mut self, package: impl Into<String>) -> Self {
        self.annotation_package = package.into();
        self
    }
}

fn validate_controller_name(name: &str) -> Result<(), SyncConfigError> {
    if name.is_empty() {
        Err(SyncConfigError::MissingName)
    } else if !CONTROLLER_NAME_REGEX.is_match(name) {
        Err(SyncConfigError::InvalidName(name.to_owned()))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncConfigError {
    MissingName,
    InvalidName(String),
}

impl Display for SyncConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncConfigError::MissingName => write!(
                f,
                "No controller name is configured, set the {} environment variable",
                CONTROLLER_NAME_ENV_VAR
            ),
            SyncConfigError::InvalidName(name) => write!(
                f,
                "Invalid controller name: '{}', must consist of lowercase alphanumeric characters, '-' or '.'",
                name
            ),
        }
    }
}
impl std::error::Error for SyncConfigError {}

/// Certificate authority data for validating the api server's certificate
#[derive(Debug, Clone, PartialEq)]
pub enum CAData {
    /// Path to a PEM encoded file
    File(String),
    /// Base64 encoded PEM contents, as they appear inline in a kubeconfig file
    Contents(String),
}

/// The credentials used for authenticating with the api server
#[derive(Clone, PartialEq)]
pub enum Credentials {
    /// The complete value of the `Authorization` header, which is sent with every request
    Header(String),
    /// Paths to a PEM encoded client certificate and private key
    PemPath {
        certificate_path: String,
        private_key_path: String,
    },
    /// Base64 encoded PEM client certificate and private key
    Pem {
        certificate_base64: String,
        private_key_base64: String,
    },
}

impl Credentials {
    pub fn bearer_token(token: &str) -> Credentials {
        Credentials::Header(format!("Bearer {}", token.trim()))
    }

    /// Tokens in kubeconfig files are used as-is, so this is the same as `bearer_token`. It exists
    /// only to make the call sites say where the token came from.
    pub fn base64_bearer_token(token: &str) -> Credentials {
        Credentials::bearer_token(token)
    }

    pub fn basic(username: &str, password: &str) -> Credentials {
        let encoded = base64::encode(format!("{}:{}", username, password));
        Credentials::Header(format!("Basic {}", encoded))
    }

    pub(crate) fn header_value(&self) -> Option<&str> {
        match self {
            Credentials::Header(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // never print the secrets themselves
        match self {
            Credentials::Header(_) => f.write_str("Header(<redacted>)"),
            Credentials::PemPath {
                certificate_path, ..
            } => write!(f, "PemPath {{ certificate_path: {:?} }}", certificate_path),
            Credentials::Pem { .. } => f.write_str("Pem(<redacted>)"),
        }
    }
}

/// Configuration for connecting to the Kubernetes api server
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_server_endpoint: String,
    pub credentials: Credentials,
    pub ca_data: Option<CAData>,
    pub user_agent: String,
    pub impersonate: Option<String>,
    pub impersonate_groups: Vec<String>,
    pub verify_ssl_certs: bool,
}

impl ClientConfig {
    /// Loads the configuration from the service account that's mounted into every pod
    pub fn from_service_account(user_agent: impl Into<String>) -> Result<ClientConfig, io::Error> {
        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)?;

        let ca_data = if Path::new(SERVICE_ACCOUNT_CA_PATH).exists() {
            Some(CAData::File(SERVICE_ACCOUNT_CA_PATH.to_owned()))
        } else {
            None
        };

        Ok(ClientConfig {
            api_server_endpoint: format!("https://{}", API_SERVER_HOSTNAME),
            credentials: Credentials::bearer_token(token.as_str()),
            ca_data,
            user_agent: user_agent.into(),
            impersonate: None,
            impersonate_groups: Vec::new(),
            verify_ssl_certs: true,
        })
    }

    /// Loads the configuration from the kubeconfig file, using the `KUBECONFIG` environment variable
    /// or else `~/.kube/config`
    pub fn from_kubeconfig(user_agent: impl Into<String>) -> Result<ClientConfig, KubeConfigError> {
        kubeconfig::load_from_kubeconfig(user_agent.into())
    }

    /// Tries the service account first, since that's what's used when running in a cluster, and then
    /// falls back to the kubeconfig file
    pub fn load(user_agent: impl Into<String>) -> Result<ClientConfig, KubeConfigError> {
        let user_agent = user_agent.into();
        ClientConfig::from_service_account(user_agent.as_str()).or_else(|err| {
            log::debug!(
                "Failed to load ClientConfig from service account: {}, so trying to load from kubeconfig",
                err
            );
            ClientConfig::from_kubeconfig(user_agent)
        })
    }
}
