//! Annotations let operators tell one specific sync controller to keep its hands off of an object,
//! without affecting any other controller that syncs the same repository or cluster. The keys have
//! the form `<domain>/<package>/<facet>/<controller-name>`, for example:
//!
//! ```yaml
//! metadata:
//!   annotations:
//!     kubesync.dev/kubesync/sync/staging-controller: ignore
//! ```
//!
//! A controller named `staging-controller` will skip that object, while a controller named
//! `prod-controller` will manage it as usual.
use crate::config::SyncConfig;
use crate::resource::ResourceDocument;

/// The facet that controls whether an object gets synced at all
pub const SYNC_FACET: &str = "sync";
/// The annotation value that causes an object to be skipped
pub const IGNORE_VALUE: &str = "ignore";

/// Tests and produces the annotations that are scoped to this controller's own identity
#[derive(Debug, Clone, PartialEq)]
pub struct Annotations {
    identity: String,
    prefix: String,
}

impl Annotations {
    pub fn new(config: &SyncConfig) -> Annotations {
        Annotations {
            identity: config.controller_name.clone(),
            prefix: format!("{}/{}", config.annotation_domain, config.annotation_package),
        }
    }

    /// The name of the running controller, which never changes for the lifetime of this value
    pub fn identity(&self) -> &str {
        self.identity.as_str()
    }

    /// Returns the complete annotation key for the given facet, scoped to this controller
    pub fn key(&self, facet: &str) -> String {
        format!("{}/{}/{}", self.prefix, facet, self.identity)
    }

    /// Returns the key and value that will cause this controller to ignore an object
    pub fn ignore_annotation(&self, facet: &str) -> (String, &'static str) {
        (self.key(facet), IGNORE_VALUE)
    }

    /// Returns true only if the document has an annotation for the given facet that's scoped
    /// to this controller, and its value is exactly `value`
    pub fn has_annotation(&self, doc: &ResourceDocument, facet: &str, value: &str) -> bool {
        let key = self.key(facet);
        doc.annotation(key.as_str()) == Some(value)
    }

    pub fn is_ignored(&self, doc: &ResourceDocument, facet: &str) -> bool {
        self.has_annotation(doc, facet, IGNORE_VALUE)
    }

    /// Returns only the documents that are not annotated to be ignored by this controller
    pub fn filter_ignored<'a, I>(&self, docs: I, facet: &str) -> Vec<ResourceDocument>
    where
        I: IntoIterator<Item = &'a ResourceDocument>,
    {
        docs.into_iter()
            .filter(|doc| {
                let ignored = self.is_ignored(doc, facet);
                if ignored {
                    log::debug!(
                        "Filtering out {} because it's annotated to be ignored by '{}'",
                        doc.identity(),
                        self.identity
                    );
                }
                !ignored
            })
            .cloned()
            .collect()
    }
}
