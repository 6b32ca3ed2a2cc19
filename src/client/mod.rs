//! A dynamic client for the Kubernetes api server. Nothing about a resource needs to be known in
//! advance: documents are addressed using only their `apiVersion`, `kind` and `metadata`, and the
//! REST resource that serves them is looked up through discovery when the request is made.
pub mod discovery;
pub mod metrics;
pub mod request;

use crate::config::{CAData, ClientConfig, Credentials};
use crate::resource::{ResourceDocument, ResourceJson, DEFAULT_API_VERSION, DEFAULT_NAMESPACE};

use self::discovery::{ApiDiscovery, ResolvedResource, ResourceResolver};
use self::metrics::ClientMetrics;
use self::request::{make_request, make_url, resource_path, RequestBody};

use http::{HeaderMap, Method, Request, StatusCode};
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use serde_json::Value;

use std::fmt::{self, Display};
use std::io;
use std::sync::Arc;
use std::time::Instant;

pub use self::request::{Action, DeleteOptions, PatchStrategy, PropagationPolicy};

#[derive(Debug)]
pub enum Error {
    Io(hyper::Error),
    Serde(serde_json::Error),
    Http(http::Error),
    Url(url::ParseError),
    InvalidEndpoint(String),
    MissingKind {
        value: Value,
    },
    MissingName {
        value: Value,
    },
    UnrecognizedType {
        api_version: String,
        kind: String,
    },
    Discovery {
        api_version: String,
        source: Box<Error>,
    },
    /// The api server responded with a non-2xx status. The body is decoded as json if possible,
    /// and otherwise included as a string.
    Request {
        status: StatusCode,
        body: Value,
    },
}

impl Error {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Request { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_http_status(&self, code: u16) -> bool {
        self.status().map(|s| s.as_u16() == code).unwrap_or(false)
    }

    pub fn is_not_found(&self) -> bool {
        self.is_http_status(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.is_http_status(409)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Serde(e) => Some(e),
            Error::Http(e) => Some(e),
            Error::Url(e) => Some(e),
            Error::Discovery { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "Io Error: {}", e),
            Error::Serde(e) => write!(f, "(De)Serialization error: {}", e),
            Error::Http(e) => write!(f, "Invalid request: {}", e),
            Error::Url(e) => write!(f, "Invalid url: {}", e),
            Error::InvalidEndpoint(endpoint) => {
                write!(f, "Invalid api server endpoint: '{}'", endpoint)
            }
            Error::MissingKind { value } => write!(f, "Spec does not contain kind: {}", value),
            Error::MissingName { value } => {
                write!(f, "Spec does not contain metadata.name: {}", value)
            }
            Error::UnrecognizedType { api_version, kind } => write!(
                f,
                "Unrecognized API version and kind: {} {}",
                api_version, kind
            ),
            Error::Discovery {
                api_version,
                source,
            } => write!(
                f,
                "Failed to discover resources for apiVersion: {}: {}",
                api_version, source
            ),
            Error::Request { status, body } => {
                write!(f, "Request failed with status: {}, body: {}", status, body)
            }
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Error {
        Error::Io(e)
    }
}
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Serde(e)
    }
}
impl From<http::Error> for Error {
    fn from(e: http::Error) -> Error {
        Error::Http(e)
    }
}
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Error {
        Error::Url(e)
    }
}

/// The decoded response to a successful request, along with the raw status and headers
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// The decoded json body, or `Null` if the response had no body
    pub body: Value,
}

/// The document that was prepared for a request, along with where to send it
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAddress {
    /// The document with `apiVersion`, `metadata` and, for namespaced resources, `metadata.namespace` defaulted
    pub spec: ResourceDocument,
    pub resource: ResolvedResource,
    pub path: Vec<String>,
}

/// The result of an upsert, which tells whether the object had to be created
#[derive(Debug, Clone, PartialEq)]
pub enum Upserted {
    Created(ApiResponse),
    Patched(ApiResponse),
}

impl Upserted {
    pub fn response(&self) -> &ApiResponse {
        match self {
            Upserted::Created(r) | Upserted::Patched(r) => r,
        }
    }
}

#[derive(Debug)]
struct TransportInner {
    http_client: HyperClient<HttpsConnector<HttpConnector>>,
    config: ClientConfig,
    metrics: ClientMetrics,
}

/// The connection to the api server. This knows how to send requests and decode the responses,
/// but knows nothing about resources.
#[derive(Debug, Clone)]
pub struct Transport(Arc<TransportInner>);

impl Transport {
    pub fn new(mut config: ClientConfig, metrics: ClientMetrics) -> Result<Transport, io::Error> {
        let mut http = HttpConnector::new();
        // plain http endpoints are still allowed, which is what `kubectl proxy` uses
        http.enforce_http(false);

        let mut ssl = SslConnector::builder(SslMethod::tls())?;
        // enable http2 using alpn
        ssl.set_alpn_protos(b"\x02h2\x08http/1.1")?;

        match config.ca_data.take() {
            Some(CAData::Contents(certs)) => {
                let decoded = decode_base64("certificate-authority-data", certs.as_str())?;
                let cert_store = ssl.cert_store_mut();
                for cert in X509::stack_from_pem(decoded.as_slice())? {
                    cert_store.add_cert(cert)?;
                }
            }
            Some(CAData::File(path)) => {
                ssl.set_ca_file(path.as_str())?;
            }
            None => {}
        }

        match config.credentials {
            Credentials::PemPath {
                ref certificate_path,
                ref private_key_path,
            } => {
                let cert = std::fs::read(certificate_path)?;
                let key = std::fs::read(private_key_path)?;
                set_client_certificate(&mut ssl, cert.as_slice(), key.as_slice())?;
            }
            Credentials::Pem {
                ref certificate_base64,
                ref private_key_base64,
            } => {
                let cert = decode_base64("client-certificate-data", certificate_base64)?;
                let key = decode_base64("client-key-data", private_key_base64)?;
                set_client_certificate(&mut ssl, cert.as_slice(), key.as_slice())?;
            }
            Credentials::Header(_) => {}
        }

        if config.verify_ssl_certs {
            ssl.set_verify(SslVerifyMode::PEER);
        } else {
            log::warn!("TLS Certificate verifification has been disabled! All connections to the Kubernetes api server will be insecure!");
            ssl.set_verify(SslVerifyMode::NONE);
        }

        let https = HttpsConnector::with_connector(http, ssl)?;
        let http_client = HyperClient::builder().build(https);

        Ok(Transport(Arc::new(TransportInner {
            http_client,
            config,
            metrics,
        })))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.0.config
    }

    /// Sends a GET request to the given path and returns the decoded response
    pub async fn get_json(
        &self,
        segments: &[String],
        query: &[(&str, &str)],
    ) -> Result<ApiResponse, Error> {
        let url = make_url(&self.0.config, segments, query)?;
        let req = make_request(&self.0.config, Method::GET, url, None)?;
        self.execute(req).await
    }

    /// Sends the request and decodes the response body. Any non-2xx response is returned as an
    /// `Error::Request`.
    pub async fn execute(&self, req: Request<Body>) -> Result<ApiResponse, Error> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let start_time = Instant::now();

        log::debug!("Starting {} request to: {}", method, uri);
        let timer = self.0.metrics.request_started();
        let result = self.0.http_client.request(req).await;
        timer.observe_duration();

        let response = match result {
            Ok(resp) => resp,
            Err(err) => {
                log::error!(
                    "Failed to execute {} request to: {}, err: {}",
                    method,
                    uri,
                    err
                );
                return Err(err.into());
            }
        };

        let (parts, body) = response.into_parts();
        let body = hyper::body::to_bytes(body).await?;
        log::debug!(
            "Finished {} request to: {}, status: {}, total_duration: {}ms",
            method,
            uri,
            parts.status.as_u16(),
            start_time.elapsed().as_millis()
        );
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("Got response body: {}", String::from_utf8_lossy(body.as_ref()));
        }

        if parts.status.is_success() {
            let body = if body.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(body.as_ref())?
            };
            Ok(ApiResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        } else {
            let body = serde_json::from_slice::<Value>(body.as_ref()).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(body.as_ref()).into_owned())
            });
            log::error!(
                "{} request to: {} failed with status: {}, body: {}",
                method,
                uri,
                parts.status,
                body
            );
            Err(Error::Request {
                status: parts.status,
                body,
            })
        }
    }
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>, io::Error> {
    base64::decode(value).map_err(|err| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("Invalid base64 content of {}: {}", field, err),
        )
    })
}

fn set_client_certificate(
    ssl: &mut SslConnectorBuilder,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(), io::Error> {
    let cert = X509::from_pem(cert_pem)?;
    let pkey = PKey::private_key_from_pem(key_pem)?;
    ssl.set_certificate(&*cert)?;
    ssl.set_private_key(&*pkey)?;
    // ensures that the key and certificate actually go together
    ssl.check_private_key()?;
    Ok(())
}

/// Performs operations on arbitrary resources, given only the document describing them
#[derive(Clone)]
pub struct Client {
    transport: Transport,
    resolver: Arc<dyn ResourceResolver>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport)
            .finish()
    }
}

impl Client {
    /// Creates a client that resolves resources using the api server's discovery endpoints
    pub fn new(config: ClientConfig, metrics: ClientMetrics) -> Result<Client, io::Error> {
        let transport = Transport::new(config, metrics)?;
        let resolver = Arc::new(ApiDiscovery::new(transport.clone()));
        Ok(Client {
            transport,
            resolver,
        })
    }

    /// Returns a client that uses the given resolver instead of discovery
    pub fn with_resolver<R: ResourceResolver + 'static>(self, resolver: R) -> Client {
        Client {
            transport: self.transport,
            resolver: Arc::new(resolver),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn resolver(&self) -> &dyn ResourceResolver {
        self.resolver.as_ref()
    }

    /// Forgets any previously discovered resources. Called at the start of every sync pass.
    pub fn clear_discovery_cache(&self) {
        self.resolver.clear();
    }

    /// Validates the document, fills in the fields that have defaults, and works out the request path
    /// for the given action
    pub async fn resolve_address(
        &self,
        doc: &ResourceDocument,
        action: Action,
    ) -> Result<ResolvedAddress, Error> {
        let kind = doc.kind().ok_or_else(|| Error::MissingKind {
            value: doc.as_ref().clone(),
        })?;

        let mut spec = doc.clone();
        if spec.as_ref().get_api_version().is_none() {
            spec.set_api_version(DEFAULT_API_VERSION);
        }
        if spec.as_ref().get("metadata").is_none() {
            spec.metadata_mut();
        }

        let api_version = spec.api_version();
        let resource = self
            .resolver
            .resolve(api_version, kind)
            .await?
            .ok_or_else(|| Error::UnrecognizedType {
                api_version: api_version.to_owned(),
                kind: kind.to_owned(),
            })?;

        if resource.namespaced && action != Action::List && spec.namespace().is_none() {
            spec.set_namespace(DEFAULT_NAMESPACE);
        }

        let path = resource_path(&resource, &spec, action)?;
        Ok(ResolvedAddress {
            spec,
            resource,
            path,
        })
    }

    pub async fn create(&self, doc: &ResourceDocument) -> Result<ApiResponse, Error> {
        let address = self.resolve_address(doc, Action::Create).await?;
        log::info!("Creating {}", address.spec.identity());
        let body = RequestBody::json(address.spec.as_ref())?;
        self.send(Action::Create, &address.path, &[], Some(body)).await
    }

    pub async fn read(&self, doc: &ResourceDocument) -> Result<ApiResponse, Error> {
        let address = self.resolve_address(doc, Action::Read).await?;
        self.send(Action::Read, &address.path, &[], None).await
    }

    pub async fn replace(&self, doc: &ResourceDocument) -> Result<ApiResponse, Error> {
        let address = self.resolve_address(doc, Action::Replace).await?;
        log::info!("Replacing {}", address.spec.identity());
        let body = RequestBody::json(address.spec.as_ref())?;
        self.send(Action::Replace, &address.path, &[], Some(body)).await
    }

    /// Patches the object using a strategic merge patch of the whole document
    pub async fn patch(&self, doc: &ResourceDocument) -> Result<ApiResponse, Error> {
        self.patch_with(doc, PatchStrategy::StrategicMerge).await
    }

    pub async fn patch_with(
        &self,
        doc: &ResourceDocument,
        strategy: PatchStrategy,
    ) -> Result<ApiResponse, Error> {
        let address = self.resolve_address(doc, Action::Patch).await?;
        log::info!(
            "Patching {} using {:?} patch",
            address.spec.identity(),
            strategy
        );
        let body = RequestBody::with_content_type(strategy.content_type(), address.spec.as_ref())?;
        self.send(Action::Patch, &address.path, &[], Some(body)).await
    }

    /// Deletes the object, letting the api server clean up dependents in the background
    pub async fn delete(&self, doc: &ResourceDocument) -> Result<ApiResponse, Error> {
        self.delete_with(doc, &DeleteOptions::default()).await
    }

    pub async fn delete_with(
        &self,
        doc: &ResourceDocument,
        options: &DeleteOptions,
    ) -> Result<ApiResponse, Error> {
        let address = self.resolve_address(doc, Action::Delete).await?;
        log::info!(
            "Deleting {} with propagation policy: {:?}",
            address.spec.identity(),
            options.propagation_policy
        );
        let body = RequestBody::json(&options.to_json())?;
        self.send(Action::Delete, &address.path, &[], Some(body)).await
    }

    /// Lists all objects of the document's kind, within its namespace if it has one
    pub async fn list(&self, doc: &ResourceDocument) -> Result<ApiResponse, Error> {
        let address = self.resolve_address(doc, Action::List).await?;
        self.send(Action::List, &address.path, &[], None).await
    }

    pub async fn list_with_selector(
        &self,
        doc: &ResourceDocument,
        label_selector: &str,
    ) -> Result<ApiResponse, Error> {
        let address = self.resolve_address(doc, Action::List).await?;
        let query = [("labelSelector", label_selector)];
        self.send(Action::List, &address.path, &query, None).await
    }

    /// Creates the object if it doesn't exist, and otherwise patches it
    pub async fn upsert(&self, doc: &ResourceDocument) -> Result<Upserted, Error> {
        match self.read(doc).await {
            Ok(_) => self.patch(doc).await.map(Upserted::Patched),
            Err(ref e) if e.is_not_found() => {
                log::debug!("{} does not exist yet, so it will be created", doc.identity());
                self.create(doc).await.map(Upserted::Created)
            }
            Err(e) => Err(e),
        }
    }

    async fn send(
        &self,
        action: Action,
        path: &[String],
        query: &[(&str, &str)],
        body: Option<RequestBody>,
    ) -> Result<ApiResponse, Error> {
        let config = self.transport.config();
        let url = make_url(config, path, query)?;
        let req = make_request(config, action.method(), url, body)?;
        self.transport.execute(req).await
    }
}
