use crate::client::discovery::ResolvedResource;
use crate::client::Error;
use crate::config::ClientConfig;
use crate::resource::ResourceDocument;

use http::{header, Method, Request};
use hyper::Body;
use serde_json::Value;
use url::Url;

const IMPERSONATE_USER: &str = "Impersonate-User";
const IMPERSONATE_GROUP: &str = "Impersonate-Group";
const JSON_CONTENT_TYPE: &str = "application/json";

/// The operations that the dynamic client can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Read,
    Replace,
    Patch,
    Delete,
    List,
}

impl Action {
    pub fn method(&self) -> Method {
        match self {
            Action::Create => Method::POST,
            Action::Read | Action::List => Method::GET,
            Action::Replace => Method::PUT,
            Action::Patch => Method::PATCH,
            Action::Delete => Method::DELETE,
        }
    }

    /// whether the request path ends with the object name
    fn addresses_single_object(&self) -> bool {
        !matches!(self, Action::Create | Action::List)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PatchStrategy {
    Json,
    Merge,
    StrategicMerge,
}

impl PatchStrategy {
    pub fn content_type(&self) -> &'static str {
        match *self {
            PatchStrategy::Json => "application/json-patch+json",
            PatchStrategy::Merge => "application/merge-patch+json",
            PatchStrategy::StrategicMerge => "application/strategic-merge-patch+json",
        }
    }
}

impl Default for PatchStrategy {
    fn default() -> PatchStrategy {
        PatchStrategy::StrategicMerge
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum PropagationPolicy {
    Background,
    Foreground,
    Orphan,
}

/// The body of a delete request
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOptions {
    pub propagation_policy: PropagationPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<u64>,
}

impl Default for DeleteOptions {
    fn default() -> DeleteOptions {
        DeleteOptions {
            propagation_policy: PropagationPolicy::Background,
            grace_period_seconds: None,
        }
    }
}

impl DeleteOptions {
    pub fn to_json(&self) -> Value {
        let mut value = serde_json::json!({
            "kind": "DeleteOptions",
            "apiVersion": "v1",
        });
        if let (Value::Object(obj), Ok(Value::Object(opts))) =
            (&mut value, serde_json::to_value(self))
        {
            obj.extend(opts);
        }
        value
    }
}

/// Returns the path segments for the given document. The `apis` prefix is used for group/version
/// apiVersions and `api` for the core group. The namespace segment is included for namespaced resources
/// whenever the document has one, and the name is included for every action except create and list.
/// All segments are lower-cased.
pub fn resource_path(
    resource: &ResolvedResource,
    doc: &ResourceDocument,
    action: Action,
) -> Result<Vec<String>, Error> {
    let api_version = doc.api_version();
    let prefix = if api_version.contains('/') {
        "apis"
    } else {
        "api"
    };

    let mut segments = vec![prefix.to_owned()];
    segments.extend(api_version.split('/').map(str::to_owned));

    if resource.namespaced {
        if let Some(ns) = doc.namespace() {
            segments.push("namespaces".to_owned());
            segments.push(ns.to_owned());
        }
    }
    segments.push(resource.plural_name.clone());

    if action.addresses_single_object() {
        let name = doc.name().ok_or_else(|| Error::MissingName {
            value: doc.as_ref().clone(),
        })?;
        segments.push(name.to_owned());
    }

    for segment in segments.iter_mut() {
        *segment = segment.to_lowercase();
    }
    Ok(segments)
}

/// Returns the discovery path for the given apiVersion, `/api/v1` or `/apis/<group>/<version>`
pub fn discovery_path(api_version: &str) -> Vec<String> {
    let prefix = if api_version.contains('/') {
        "apis"
    } else {
        "api"
    };
    std::iter::once(prefix)
        .chain(api_version.split('/'))
        .map(str::to_owned)
        .collect()
}

pub fn make_url(
    client_config: &ClientConfig,
    segments: &[String],
    query: &[(&str, &str)],
) -> Result<Url, Error> {
    let mut url = Url::parse(client_config.api_server_endpoint.as_str())?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| Error::InvalidEndpoint(client_config.api_server_endpoint.clone()))?;
        path.pop_if_empty();
        path.extend(segments.iter());
    }
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// A request body along with its content type
pub struct RequestBody {
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

impl RequestBody {
    pub fn json(value: &Value) -> Result<RequestBody, Error> {
        RequestBody::with_content_type(JSON_CONTENT_TYPE, value)
    }

    pub fn with_content_type(content_type: &'static str, value: &Value) -> Result<RequestBody, Error> {
        let bytes = serde_json::to_vec(value)?;
        Ok(RequestBody {
            content_type,
            bytes,
        })
    }
}

/// Builds a request with all the headers that are common to every request to the api server
pub fn make_request(
    client_config: &ClientConfig,
    method: Method,
    url: Url,
    body: Option<RequestBody>,
) -> Result<Request<Body>, Error> {
    let mut builder = Request::builder()
        .method(method)
        .uri(url.as_str())
        .header(header::USER_AGENT, client_config.user_agent.as_str())
        .header(header::ACCEPT, JSON_CONTENT_TYPE);

    if let Some(auth) = client_config.credentials.header_value() {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    if let Some(user) = client_config.impersonate.as_ref() {
        builder = builder.header(IMPERSONATE_USER, user.as_str());
    }
    for group in client_config.impersonate_groups.iter() {
        builder = builder.header(IMPERSONATE_GROUP, group.as_str());
    }

    let req = match body {
        Some(RequestBody {
            content_type,
            bytes,
        }) => builder
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(bytes))?,
        None => builder.body(Body::empty())?,
    };
    Ok(req)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Credentials;
    use serde_json::json;

    fn config() -> ClientConfig {
        ClientConfig {
            api_server_endpoint: "https://k8s.example.com:6443".to_owned(),
            credentials: Credentials::bearer_token("my-token"),
            ca_data: None,
            user_agent: "kubesync-test".to_owned(),
            impersonate: Some("jane".to_owned()),
            impersonate_groups: vec!["devs".to_owned(), "ops".to_owned()],
            verify_ssl_certs: true,
        }
    }

    fn namespaced(plural: &str) -> ResolvedResource {
        ResolvedResource::new(plural, true)
    }

    fn doc(value: Value) -> ResourceDocument {
        ResourceDocument::from_value(value).unwrap()
    }

    fn path(segments: Vec<String>) -> String {
        segments.join("/")
    }

    #[test]
    fn core_resources_use_api_prefix() {
        let secret = doc(json!({"kind": "Secret", "apiVersion": "v1", "metadata": {"name": "creds", "namespace": "ns"}}));
        let resource = namespaced("secrets");
        assert_eq!("api/v1/namespaces/ns/secrets/creds", path(resource_path(&resource, &secret, Action::Read).unwrap()));
        assert_eq!("api/v1/namespaces/ns/secrets", path(resource_path(&resource, &secret, Action::Create).unwrap()));
    }

    #[test]
    fn group_resources_use_apis_prefix() {
        let deployment = doc(json!({
            "kind": "Deployment",
            "apiVersion": "apps/v1",
            "metadata": {"name": "app", "namespace": "ns"}
        }));
        let resource = namespaced("deployments");
        for action in &[Action::Read, Action::Replace, Action::Patch, Action::Delete] {
            assert_eq!(
                "apis/apps/v1/namespaces/ns/deployments/app",
                path(resource_path(&resource, &deployment, *action).unwrap())
            );
        }
        assert_eq!(
            "apis/apps/v1/namespaces/ns/deployments",
            path(resource_path(&resource, &deployment, Action::List).unwrap())
        );
    }

    #[test]
    fn cluster_scoped_resources_omit_namespace() {
        let role = doc(json!({
            "kind": "ClusterRole",
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "metadata": {"name": "Reader", "namespace": "ignored"}
        }));
        let resource = ResolvedResource::new("clusterroles", false);
        assert_eq!(
            "apis/rbac.authorization.k8s.io/v1/clusterroles/reader",
            path(resource_path(&resource, &role, Action::Delete).unwrap())
        );
    }

    #[test]
    fn list_without_namespace_spans_all_namespaces() {
        let pods = doc(json!({"kind": "Pod", "apiVersion": "v1"}));
        assert_eq!("api/v1/pods", path(resource_path(&namespaced("pods"), &pods, Action::List).unwrap()));
    }

    #[test]
    fn empty_namespace_is_not_a_path_segment() {
        let config_map = doc(json!({"kind": "ConfigMap", "apiVersion": "v1", "metadata": {"name": "x", "namespace": ""}}));
        let resource = namespaced("configmaps");
        assert_eq!("api/v1/configmaps", path(resource_path(&resource, &config_map, Action::List).unwrap()));
        assert_eq!("api/v1/configmaps/x", path(resource_path(&resource, &config_map, Action::Read).unwrap()));
    }

    #[test]
    fn missing_name_is_an_error_except_for_create_and_list() {
        let nameless = doc(json!({"kind": "ConfigMap", "apiVersion": "v1", "metadata": {"namespace": "ns"}}));
        let resource = namespaced("configmaps");
        assert!(resource_path(&resource, &nameless, Action::Create).is_ok());
        assert!(resource_path(&resource, &nameless, Action::List).is_ok());
        let err = resource_path(&resource, &nameless, Action::Patch).unwrap_err();
        match err {
            Error::MissingName { value } => assert_eq!(nameless.as_ref(), &value),
            other => panic!("expected MissingName, got: {:?}", other),
        }
    }

    #[test]
    fn discovery_paths() {
        assert_eq!(vec!["api", "v1"], discovery_path("v1"));
        assert_eq!(vec!["apis", "apps", "v1"], discovery_path("apps/v1"));
    }

    #[test]
    fn delete_options_default_to_background_propagation() {
        assert_eq!(
            json!({"kind": "DeleteOptions", "apiVersion": "v1", "propagationPolicy": "Background"}),
            DeleteOptions::default().to_json()
        );
        let opts = DeleteOptions {
            propagation_policy: PropagationPolicy::Foreground,
            grace_period_seconds: Some(5),
        };
        assert_eq!(
            json!({"kind": "DeleteOptions", "apiVersion": "v1", "propagationPolicy": "Foreground", "gracePeriodSeconds": 5}),
            opts.to_json()
        );
    }

    #[test]
    fn patch_defaults_to_strategic_merge() {
        assert_eq!(
            "application/strategic-merge-patch+json",
            PatchStrategy::default().content_type()
        );
    }

    #[test]
    fn request_includes_auth_and_impersonation_headers() {
        let config = config();
        let segments = vec!["api".to_owned(), "v1".to_owned(), "namespaces".to_owned()];
        let url = make_url(&config, &segments, &[("labelSelector", "app=a b")]).unwrap();
        assert_eq!(
            "https://k8s.example.com:6443/api/v1/namespaces?labelSelector=app%3Da+b",
            url.as_str()
        );

        let body = RequestBody::with_content_type(PatchStrategy::StrategicMerge.content_type(), &json!({})).unwrap();
        let req = make_request(&config, Method::PATCH, url, Some(body)).unwrap();
        let headers = req.headers();
        assert_eq!(headers[header::AUTHORIZATION], "Bearer my-token");
        assert_eq!(headers[header::USER_AGENT], "kubesync-test");
        assert_eq!(headers[header::CONTENT_TYPE], "application/strategic-merge-patch+json");
        assert_eq!(headers[IMPERSONATE_USER], "jane");
        let groups: Vec<&str> = headers
            .get_all(IMPERSONATE_GROUP)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(vec!["devs", "ops"], groups);
    }

    #[test]
    fn endpoint_path_prefix_is_preserved() {
        let mut config = config();
        config.api_server_endpoint = "http://localhost:8001/proxy/".to_owned();
        let url = make_url(&config, &discovery_path("apps/v1"), &[]).unwrap();
        assert_eq!("http://localhost:8001/proxy/apis/apps/v1", url.as_str());
    }
}
