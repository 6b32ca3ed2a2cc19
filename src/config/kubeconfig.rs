//! Loading of `ClientConfig`s from kubeconfig files. Only the parts of the format that are needed to
//! connect to a cluster are modeled here.
use super::{CAData, ClientConfig, Credentials};

use dirs::home_dir;

use std::fmt::{self, Display};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

const KUBECONFIG_ENV_VAR: &str = "KUBECONFIG";

#[cfg(unix)]
const PATH_LIST_SEPARATOR: char = ':';
#[cfg(not(unix))]
const PATH_LIST_SEPARATOR: char = ';';

#[derive(Debug)]
pub enum KubeConfigError {
    Io(io::Error),
    Format(serde_yaml::Error),
    /// The selected user has none of: token, token-file, username and password, exec,
    /// or a client certificate
    MissingCredentials,
    NoHomeDir,
    InvalidKubeconfig(String),
    ExecErr(String),
}

impl From<serde_yaml::Error> for KubeConfigError {
    fn from(err: serde_yaml::Error) -> KubeConfigError {
        KubeConfigError::Format(err)
    }
}

impl From<io::Error> for KubeConfigError {
    fn from(err: io::Error) -> KubeConfigError {
        KubeConfigError::Io(err)
    }
}

impl Display for KubeConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KubeConfigError::Io(e) => write!(f, "failed to read kubeconfig: {}", e),
            KubeConfigError::Format(e) => write!(f, "malformed kubeconfig: {}", e),
            KubeConfigError::MissingCredentials => {
                f.write_str("the kubeconfig user has no credentials that kubesync can use")
            }
            KubeConfigError::NoHomeDir => {
                f.write_str("KUBECONFIG is not set and the home directory is unknown")
            }
            KubeConfigError::InvalidKubeconfig(msg) => write!(f, "invalid kubeconfig: {}", msg),
            KubeConfigError::ExecErr(msg) => write!(f, "credential plugin failed: {}", msg),
        }
    }
}

impl std::error::Error for KubeConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KubeConfigError::Io(e) => Some(e),
            KubeConfigError::Format(e) => Some(e),
            _ => None,
        }
    }
}

fn invalid(msg: impl Into<String>) -> KubeConfigError {
    KubeConfigError::InvalidKubeconfig(msg.into())
}

/// `KUBECONFIG` may hold a list of paths, in which case the first one that exists is used.
fn find_kubeconfig(env_value: Option<String>) -> Result<PathBuf, KubeConfigError> {
    if let Some(paths) = env_value.filter(|v| !v.trim().is_empty()) {
        let candidates: Vec<PathBuf> = paths
            .split(PATH_LIST_SEPARATOR)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        return candidates
            .iter()
            .find(|p| p.is_file())
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| invalid(format!("{} does not name any files", KUBECONFIG_ENV_VAR)));
    }
    home_dir()
        .map(|home| home.join(".kube").join("config"))
        .ok_or(KubeConfigError::NoHomeDir)
}

/// Loads a `ClientConfig` for the current context of the kubeconfig at the given path
pub fn load_kubeconfig(
    user_agent: String,
    file_path: impl AsRef<Path>,
) -> Result<ClientConfig, KubeConfigError> {
    let path = file_path.as_ref();
    let kubeconfig = KubeConfig::load_file(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    kubeconfig.create_client_config(user_agent, base_dir)
}

pub fn load_from_kubeconfig(user_agent: String) -> Result<ClientConfig, KubeConfigError> {
    let path = find_kubeconfig(std::env::var(KUBECONFIG_ENV_VAR).ok())?;
    log::debug!("Loading kubeconfig from: '{}'", path.display());
    load_kubeconfig(user_agent, path)
}

/// Files referenced from a kubeconfig may be relative to the directory containing it
fn resolve_path(base_dir: &Path, path: &str) -> String {
    base_dir.join(path).to_string_lossy().into_owned()
}

/// The lists in a kubeconfig are all made of entries with a `name` and a value under a key that
/// depends on the list.
#[derive(Deserialize, Debug, Clone, PartialEq)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "user", alias = "context")]
    value: T,
}

fn find_named<'a, T>(entries: &'a [Named<T>], name: &str, what: &str) -> Result<&'a T, KubeConfigError> {
    entries
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| &entry.value)
        .ok_or_else(|| invalid(format!("no {} named '{}'", what, name)))
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    certificate_authority_data: Option<String>,
    certificate_authority: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

impl ClusterEntry {
    fn ca_data(&self, base_dir: &Path) -> Option<CAData> {
        if let Some(data) = self.certificate_authority_data.as_ref() {
            return Some(CAData::Contents(data.clone()));
        }
        self.certificate_authority.as_ref().map(|path| {
            let resolved = resolve_path(base_dir, path);
            log::debug!("Using certificate-authority file: '{}'", resolved);
            CAData::File(resolved)
        })
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
struct AuthInfo {
    token: Option<String>,
    #[serde(alias = "tokenFile")]
    token_file: Option<String>,
    username: Option<String>,
    password: Option<String>,
    client_certificate: Option<String>,
    client_key: Option<String>,
    client_certificate_data: Option<String>,
    client_key_data: Option<String>,
    exec: Option<ExecConfig>,
    #[serde(rename = "as")]
    impersonate: Option<String>,
    #[serde(default, rename = "as-groups")]
    impersonate_groups: Vec<String>,
}

impl AuthInfo {
    /// Picks the first usable kind of credentials, in the order that kubectl checks them
    fn credentials(&self, base_dir: &Path) -> Result<Credentials, KubeConfigError> {
        if let (Some(cert), Some(key)) = (&self.client_certificate_data, &self.client_key_data) {
            return Ok(Credentials::Pem {
                certificate_base64: cert.clone(),
                private_key_base64: key.clone(),
            });
        }
        if let (Some(cert), Some(key)) = (&self.client_certificate, &self.client_key) {
            return Ok(Credentials::PemPath {
                certificate_path: resolve_path(base_dir, cert),
                private_key_path: resolve_path(base_dir, key),
            });
        }
        if self.client_certificate.is_some() || self.client_certificate_data.is_some() {
            return Err(invalid("a client certificate is configured without its key"));
        }

        if let Some(token) = self.token.as_ref() {
            return Ok(Credentials::base64_bearer_token(token));
        }
        if let Some(token_file) = self.token_file.as_ref() {
            let token = std::fs::read_to_string(resolve_path(base_dir, token_file))?;
            return Ok(Credentials::bearer_token(token.as_str()));
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => return Ok(Credentials::basic(username, password)),
            (Some(_), None) => return Err(invalid("username is set without a password")),
            _ => {}
        }
        if let Some(exec) = self.exec.as_ref() {
            let token = exec.run()?;
            return Ok(Credentials::bearer_token(token.as_str()));
        }
        Err(KubeConfigError::MissingCredentials)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ExecConfig {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<EnvVar>,
    api_version: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
struct EnvVar {
    name: String,
    value: String,
}

#[derive(Deserialize, Debug)]
struct ExecCredential {
    status: ExecCredentialStatus,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    token: Option<String>,
    expiration_timestamp: Option<String>,
}

impl ExecConfig {
    /// Runs the credential plugin and returns the token from its `ExecCredential` output
    fn run(&self) -> Result<String, KubeConfigError> {
        log::debug!("Running credential plugin: '{}'", self.command);
        let output = Command::new(self.command.as_str())
            .args(self.args.iter())
            .envs(self.env.iter().map(|var| (var.name.as_str(), var.value.as_str())))
            .output()
            .map_err(|e| KubeConfigError::ExecErr(format!("could not run '{}': {}", self.command, e)))?;
        if !output.status.success() {
            return Err(KubeConfigError::ExecErr(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let credential: ExecCredential = serde_json::from_slice(&output.stdout).map_err(|e| {
            KubeConfigError::ExecErr(format!("'{}' printed an invalid ExecCredential: {}", self.command, e))
        })?;
        let token = credential.status.token.ok_or_else(|| {
            KubeConfigError::ExecErr(format!("'{}' did not return a token", self.command))
        })?;
        log::info!(
            "Got token from credential plugin '{}' ({}), expires: {:?}",
            self.command,
            self.api_version.as_deref().unwrap_or("unknown version"),
            credential.status.expiration_timestamp
        );
        Ok(token)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
struct ContextEntry {
    cluster: String,
    user: String,
}

/// A kubeconfig file that's been loaded into memory. Most callers should use
/// `ClientConfig::from_kubeconfig` instead.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct KubeConfig {
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<Named<ClusterEntry>>,
    #[serde(default)]
    users: Vec<Named<AuthInfo>>,
    #[serde(default)]
    contexts: Vec<Named<ContextEntry>>,
}

impl KubeConfig {
    /// Loads the kubeconfig named by `KUBECONFIG`, or else `~/.kube/config`. The path that it was
    /// loaded from is also returned.
    pub fn load() -> Result<(KubeConfig, PathBuf), KubeConfigError> {
        let path = find_kubeconfig(std::env::var(KUBECONFIG_ENV_VAR).ok())?;
        let conf = KubeConfig::load_file(&path)?;
        Ok((conf, path))
    }

    pub fn load_file(path: &Path) -> Result<KubeConfig, KubeConfigError> {
        let reader = File::open(path)?;
        Ok(serde_yaml::from_reader(reader)?)
    }

    pub fn current_context(&self) -> Option<&str> {
        self.current_context.as_deref().filter(|c| !c.is_empty())
    }

    /// Creates a `ClientConfig` from the current context. Relative paths in the file are resolved
    /// against `base_dir`.
    pub fn create_client_config(
        &self,
        user_agent: String,
        base_dir: &Path,
    ) -> Result<ClientConfig, KubeConfigError> {
        let context = self
            .current_context()
            .ok_or_else(|| invalid("current-context is not set"))?;
        self.create_client_config_for_context(context, user_agent, base_dir)
    }

    pub fn create_client_config_for_context(
        &self,
        context_name: &str,
        user_agent: String,
        base_dir: &Path,
    ) -> Result<ClientConfig, KubeConfigError> {
        let context = find_named(&self.contexts, context_name, "context")?;
        let cluster = find_named(&self.clusters, context.cluster.as_str(), "cluster")?;
        let user = find_named(&self.users, context.user.as_str(), "user")?;
        log::debug!(
            "Using kubeconfig context '{}' with cluster '{}' and user '{}'",
            context_name,
            context.cluster,
            context.user
        );

        Ok(ClientConfig {
            api_server_endpoint: cluster.server.clone(),
            credentials: user.credentials(base_dir)?,
            ca_data: cluster.ca_data(base_dir),
            user_agent,
            impersonate: user.impersonate.clone(),
            impersonate_groups: user.impersonate_groups.clone(),
            verify_ssl_certs: !cluster.insecure_skip_tls_verify,
        })
    }
}
