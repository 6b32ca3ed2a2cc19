//! Resolves `apiVersion` and `kind` pairs to the REST resource that serves them. The api server
//! publishes a discovery document for every group/version, listing each resource's plural name,
//! kind and scope. Resources are never known in advance, so every document that's synced gets
//! addressed by asking the cluster what it is.
use crate::client::request::discovery_path;
use crate::client::{Error, Transport};

use futures::future::{self, BoxFuture, FutureExt};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The REST resource that serves a given kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedResource {
    /// The plural name that's used in request paths, e.g. `deployments`
    pub plural_name: String,
    pub namespaced: bool,
}

impl ResolvedResource {
    pub fn new(plural_name: impl Into<String>, namespaced: bool) -> ResolvedResource {
        ResolvedResource {
            plural_name: plural_name.into(),
            namespaced,
        }
    }
}

/// Looks up the resource for an `apiVersion` and `kind`. Returns `Ok(None)` when the cluster
/// doesn't know about the pair, which callers should turn into an error that names it.
pub trait ResourceResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        api_version: &'a str,
        kind: &'a str,
    ) -> BoxFuture<'a, Result<Option<ResolvedResource>, Error>>;

    /// Drops anything that's been cached, so the next lookup goes back to the source
    fn clear(&self) {}
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiResource {
    pub name: String,
    pub kind: String,
    pub namespaced: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceList {
    #[serde(default)]
    pub group_version: String,
    #[serde(default)]
    pub resources: Vec<ApiResource>,
}

impl ApiResourceList {
    /// Finds the resource for the given kind. Subresources such as `pods/log` report the same
    /// kind as their parent, so they're skipped.
    pub fn find_kind(&self, kind: &str) -> Option<ResolvedResource> {
        self.resources
            .iter()
            .filter(|r| !r.name.contains('/'))
            .find(|r| r.kind == kind)
            .map(|r| ResolvedResource::new(r.name.as_str(), r.namespaced))
    }
}

// `None` means that the api server returned a 404 for the group/version
type CachedDiscovery = Option<Arc<ApiResourceList>>;

/// Resolver that's backed by the api server's discovery endpoints. The discovery document for
/// each `apiVersion` is fetched at most once for the lifetime of this value, so one instance
/// should be used per sync pass.
pub struct ApiDiscovery {
    transport: Transport,
    cache: Mutex<HashMap<String, CachedDiscovery>>,
}

impl std::fmt::Debug for ApiDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ApiDiscovery")
            .field("cached_api_versions", &self.cached_api_versions())
            .finish()
    }
}

impl ApiDiscovery {
    pub fn new(transport: Transport) -> ApiDiscovery {
        ApiDiscovery {
            transport,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_api_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.lock_cache().keys().cloned().collect();
        versions.sort();
        versions
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedDiscovery>> {
        // the cache only ever holds complete entries, so a poisoned lock still has usable data
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn get_discovery(&self, api_version: &str) -> Result<CachedDiscovery, Error> {
        let cached = self.lock_cache().get(api_version).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let segments = discovery_path(api_version);
        let result = self.transport.get_json(&segments, &[]).await;
        let discovery = match result {
            Ok(response) => {
                let list: ApiResourceList = serde_json::from_value(response.body)?;
                log::debug!(
                    "Discovered {} resources for apiVersion: {}",
                    list.resources.len(),
                    api_version
                );
                Some(Arc::new(list))
            }
            Err(ref e) if e.is_not_found() => {
                log::debug!("No discovery document exists for apiVersion: {}", api_version);
                None
            }
            Err(e) => {
                return Err(Error::Discovery {
                    api_version: api_version.to_owned(),
                    source: Box::new(e),
                })
            }
        };

        self.lock_cache()
            .insert(api_version.to_owned(), discovery.clone());
        Ok(discovery)
    }
}

impl ResourceResolver for ApiDiscovery {
    fn resolve<'a>(
        &'a self,
        api_version: &'a str,
        kind: &'a str,
    ) -> BoxFuture<'a, Result<Option<ResolvedResource>, Error>> {
        async move {
            let discovery = self.get_discovery(api_version).await?;
            Ok(discovery.and_then(|list| list.find_kind(kind)))
        }
        .boxed()
    }

    fn clear(&self) {
        self.lock_cache().clear();
    }
}

/// Resolver with a fixed set of known resources, which never talks to the api server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticResolver {
    resources: HashMap<(String, String), ResolvedResource>,
}

impl StaticResolver {
    pub fn new() -> StaticResolver {
        StaticResolver::default()
    }

    pub fn with_resource(
        mut self,
        api_version: &str,
        kind: &str,
        plural_name: &str,
        namespaced: bool,
    ) -> StaticResolver {
        self.resources.insert(
            (api_version.to_owned(), kind.to_owned()),
            ResolvedResource::new(plural_name, namespaced),
        );
        self
    }
}

impl ResourceResolver for StaticResolver {
    fn resolve<'a>(
        &'a self,
        api_version: &'a str,
        kind: &'a str,
    ) -> BoxFuture<'a, Result<Option<ResolvedResource>, Error>> {
        let key = (api_version.to_owned(), kind.to_owned());
        future::ready(Ok(self.resources.get(&key).cloned())).boxed()
    }
}
