//! An in-process stand-in for the Kubernetes api server. It serves discovery documents for a
//! fixed set of resources, keeps objects in memory, and records every request it receives.
#![allow(dead_code)]

use kubesync::client::metrics::Metrics;
use kubesync::client::Client;
use kubesync::config::{ClientConfig, Credentials};

use http::{HeaderMap, Method, Request, Response, StatusCode};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Server};
use serde_json::{json, Value};

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

pub const TEST_TOKEN: &str = "test-token";
pub const TEST_USER_AGENT: &str = "kubesync-tests";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

#[derive(Debug, Clone)]
pub struct MockResource {
    pub api_version: String,
    pub plural: String,
    pub kind: String,
    pub namespaced: bool,
}

impl MockResource {
    pub fn namespaced(api_version: &str, plural: &str, kind: &str) -> MockResource {
        MockResource {
            api_version: api_version.to_owned(),
            plural: plural.to_owned(),
            kind: kind.to_owned(),
            namespaced: true,
        }
    }

    pub fn cluster_scoped(api_version: &str, plural: &str, kind: &str) -> MockResource {
        MockResource {
            namespaced: false,
            ..MockResource::namespaced(api_version, plural, kind)
        }
    }
}

pub fn default_resources() -> Vec<MockResource> {
    vec![
        MockResource::namespaced("v1", "configmaps", "ConfigMap"),
        MockResource::namespaced("v1", "secrets", "Secret"),
        MockResource::namespaced("v1", "services", "Service"),
        MockResource::namespaced("v1", "pods", "Pod"),
        MockResource::namespaced("v1", "pods/log", "Pod"),
        MockResource::cluster_scoped("v1", "namespaces", "Namespace"),
        MockResource::namespaced("apps/v1", "deployments", "Deployment"),
        MockResource::namespaced("apps/v1", "daemonsets", "DaemonSet"),
        MockResource::namespaced("rbac.authorization.k8s.io/v1", "roles", "Role"),
        MockResource::cluster_scoped("rbac.authorization.k8s.io/v1", "clusterroles", "ClusterRole"),
    ]
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

impl RecordedRequest {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn is_discovery(&self) -> bool {
        let segments = self.path.trim_start_matches('/').split('/').count();
        (self.path.starts_with("/api/") && segments == 2)
            || (self.path.starts_with("/apis/") && segments == 3)
    }

    pub fn describe(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

// (apiVersion, plural, namespace, name)
type ObjectKey = (String, String, String, String);

#[derive(Debug, Default)]
struct State {
    resources: Vec<MockResource>,
    objects: BTreeMap<ObjectKey, Value>,
    requests: Vec<RecordedRequest>,
    failures: HashMap<(Method, String), StatusCode>,
}

/// A running mock api server. It lives as long as the runtime it was started on.
#[derive(Debug, Clone)]
pub struct MockApiServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl MockApiServer {
    /// Starts the server on a random local port. Must be called from within a tokio runtime.
    pub fn start() -> MockApiServer {
        MockApiServer::with_resources(default_resources())
    }

    pub fn with_resources(resources: Vec<MockResource>) -> MockApiServer {
        let state = Arc::new(Mutex::new(State {
            resources,
            ..Default::default()
        }));

        let svc_state = state.clone();
        let make_svc = make_service_fn(move |_conn| {
            let state = svc_state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| handle(state.clone(), request)))
            }
        });

        let address: SocketAddr = ([127, 0, 0, 1], 0).into();
        let server = Server::try_bind(&address)
            .expect("failed to bind mock server")
            .serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(async move {
            if let Err(err) = server.await {
                log::error!("Mock api server failed: {:?}", err);
            }
        });

        MockApiServer { addr, state }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            api_server_endpoint: self.endpoint(),
            credentials: Credentials::bearer_token(TEST_TOKEN),
            ca_data: None,
            user_agent: TEST_USER_AGENT.to_owned(),
            impersonate: None,
            impersonate_groups: Vec::new(),
            verify_ssl_certs: true,
        }
    }

    pub fn client(&self) -> Client {
        Client::new(self.client_config(), Metrics::new().client_metrics())
            .expect("failed to create client")
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Returns only the requests that weren't for discovery documents
    pub fn object_requests(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| !r.is_discovery())
            .collect()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    /// Every request with the given method and path will receive a response with the given status
    pub fn fail_requests(&self, method: Method, path: &str, status: u16) {
        let status = StatusCode::from_u16(status).unwrap();
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((method, path.to_owned()), status);
    }

    pub fn insert(&self, api_version: &str, plural: &str, namespace: &str, object: Value) {
        let name = object["metadata"]["name"]
            .as_str()
            .expect("object must have a name")
            .to_owned();
        let key = (
            api_version.to_owned(),
            plural.to_owned(),
            namespace.to_owned(),
            name,
        );
        self.state.lock().unwrap().objects.insert(key, object);
    }

    pub fn get(&self, api_version: &str, plural: &str, namespace: &str, name: &str) -> Option<Value> {
        let key = (
            api_version.to_owned(),
            plural.to_owned(),
            namespace.to_owned(),
            name.to_owned(),
        );
        self.state.lock().unwrap().objects.get(&key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }
}

fn status_body(code: u16, reason: &str, message: &str) -> Value {
    let status = if code < 300 { "Success" } else { "Failure" };
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": status,
        "message": message,
        "reason": reason,
        "code": code,
    })
}

fn respond(status: u16, body: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn not_found(message: &str) -> Response<Body> {
    respond(404, &status_body(404, "NotFound", message))
}

/// Applies a json merge patch, which is close enough to a strategic merge for these tests
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// The parts of an object request path, after the apiVersion
struct ObjectPath {
    api_version: String,
    namespace: Option<String>,
    plural: String,
    name: Option<String>,
}

enum Route {
    Discovery(String),
    Object(ObjectPath),
    Unknown,
}

fn route(path: &str) -> Route {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let (api_version, rest) = match segments.as_slice() {
        ["api", version, rest @ ..] => (version.to_string(), rest),
        ["apis", group, version, rest @ ..] => (format!("{}/{}", group, version), rest),
        _ => return Route::Unknown,
    };

    let (namespace, rest) = match rest {
        ["namespaces", ns, rest @ ..] if !rest.is_empty() => (Some(ns.to_string()), rest),
        other => (None, other),
    };

    match rest {
        [] if namespace.is_none() => Route::Discovery(api_version),
        [plural] => Route::Object(ObjectPath {
            api_version,
            namespace,
            plural: plural.to_string(),
            name: None,
        }),
        [plural, name] => Route::Object(ObjectPath {
            api_version,
            namespace,
            plural: plural.to_string(),
            name: Some(name.to_string()),
        }),
        _ => Route::Unknown,
    }
}

async fn handle(state: Arc<Mutex<State>>, request: Request<Body>) -> Result<Response<Body>, Infallible> {
    let (parts, body) = request.into_parts();
    let bytes = hyper::body::to_bytes(body).await.unwrap_or_default();
    let body = if bytes.is_empty() {
        None
    } else {
        serde_json::from_slice::<Value>(bytes.as_ref()).ok()
    };
    let path = parts.uri.path().to_owned();
    log::debug!("Mock api server got request: {} {}", parts.method, parts.uri);

    let mut state = state.lock().unwrap();
    state.requests.push(RecordedRequest {
        method: parts.method.clone(),
        path: path.clone(),
        query: parts.uri.query().map(str::to_owned),
        headers: parts.headers.clone(),
        body: body.clone(),
    });

    if let Some(status) = state.failures.get(&(parts.method.clone(), path.clone())) {
        let response = Response::builder()
            .status(*status)
            .body(Body::from("the mock server was told to fail this request"))
            .unwrap();
        return Ok(response);
    }

    let response = match route(path.as_str()) {
        Route::Discovery(api_version) => state.discovery(api_version.as_str()),
        Route::Object(object_path) => {
            state.handle_object(&parts.method, object_path, parts.uri.query(), body)
        }
        Route::Unknown => not_found("unknown path"),
    };
    Ok(response)
}

impl State {
    fn discovery(&self, api_version: &str) -> Response<Body> {
        let resources: Vec<Value> = self
            .resources
            .iter()
            .filter(|r| r.api_version == api_version)
            .map(|r| {
                json!({
                    "name": r.plural,
                    "singularName": "",
                    "namespaced": r.namespaced,
                    "kind": r.kind,
                    "verbs": ["create", "delete", "get", "list", "patch", "update"],
                })
            })
            .collect();
        if resources.is_empty() {
            return not_found("the server could not find the requested resource");
        }
        respond(
            200,
            &json!({
                "kind": "APIResourceList",
                "apiVersion": "v1",
                "groupVersion": api_version,
                "resources": resources,
            }),
        )
    }

    fn find_resource(&self, api_version: &str, plural: &str) -> Option<&MockResource> {
        self.resources
            .iter()
            .find(|r| r.api_version == api_version && r.plural == plural)
    }

    fn handle_object(
        &mut self,
        method: &Method,
        path: ObjectPath,
        query: Option<&str>,
        body: Option<Value>,
    ) -> Response<Body> {
        let resource = match self.find_resource(&path.api_version, &path.plural) {
            Some(r) => r.clone(),
            None => return not_found("the server could not find the requested resource"),
        };
        if resource.namespaced != path.namespace.is_some() && path.name.is_some() {
            return not_found("resource scope does not match the request path");
        }
        let namespace = path.namespace.clone().unwrap_or_default();

        match (method, path.name) {
            (&Method::GET, None) => self.list(&resource, path.namespace.as_deref(), query),
            (&Method::POST, None) => {
                let body = match body {
                    Some(b) => b,
                    None => return respond(400, &status_body(400, "BadRequest", "missing body")),
                };
                let name = match body["metadata"]["name"].as_str() {
                    Some(n) => n.to_owned(),
                    None => return respond(422, &status_body(422, "Invalid", "missing name")),
                };
                let key = (resource.api_version.clone(), resource.plural.clone(), namespace, name);
                if self.objects.contains_key(&key) {
                    return respond(409, &status_body(409, "AlreadyExists", "object already exists"));
                }
                self.objects.insert(key, body.clone());
                respond(201, &body)
            }
            (method, Some(name)) => {
                let key = (resource.api_version.clone(), resource.plural.clone(), namespace, name);
                let existing = match self.objects.get_mut(&key) {
                    Some(obj) => obj,
                    None => return not_found("object not found"),
                };
                match *method {
                    Method::GET => respond(200, existing),
                    Method::PUT => {
                        *existing = body.unwrap_or(Value::Null);
                        respond(200, existing)
                    }
                    Method::PATCH => {
                        if let Some(patch) = body {
                            merge(existing, &patch);
                        }
                        respond(200, existing)
                    }
                    Method::DELETE => {
                        self.objects.remove(&key);
                        respond(200, &status_body(200, "", "deleted"))
                    }
                    _ => respond(405, &status_body(405, "MethodNotAllowed", "method not allowed")),
                }
            }
            _ => respond(405, &status_body(405, "MethodNotAllowed", "method not allowed")),
        }
    }

    fn list(&self, resource: &MockResource, namespace: Option<&str>, query: Option<&str>) -> Response<Body> {
        let selector = query.and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "labelSelector")
                .map(|(_, v)| v.into_owned())
        });
        let label = selector.as_ref().and_then(|s| {
            let mut parts = s.splitn(2, '=');
            Some((parts.next()?.to_owned(), parts.next()?.to_owned()))
        });

        let items: Vec<Value> = self
            .objects
            .iter()
            .filter(|((api_version, plural, ns, _), _)| {
                api_version == &resource.api_version
                    && plural == &resource.plural
                    && namespace.map(|n| n == ns.as_str()).unwrap_or(true)
            })
            .filter(|(_, obj)| match label.as_ref() {
                Some((k, v)) => obj["metadata"]["labels"][k.as_str()].as_str() == Some(v.as_str()),
                None => true,
            })
            .map(|(_, obj)| obj.clone())
            .collect();
        respond(
            200,
            &json!({
                "kind": format!("{}List", resource.kind),
                "apiVersion": resource.api_version,
                "metadata": {"resourceVersion": "1"},
                "items": items,
            }),
        )
    }
}
