//! Kubesync keeps the objects in a Kubernetes cluster converged with the spec files that are
//! tracked in a git repository. It's driven by commits rather than by polling: each push is turned
//! into a list of file level changes, and each change is applied to or deleted from the cluster.
//!
//! Nothing needs to be known about the kinds of objects being synced. The `Client` addresses any
//! document using only its `apiVersion`, `kind` and `metadata`, and asks the api server's discovery
//! endpoints how to reach it.
//!
//! Multiple sync controllers can share a cluster. Each one is configured with its own name, and a
//! spec can be annotated to be ignored by one controller without affecting the others:
//!
//! ```yaml
//! metadata:
//!   annotations:
//!     kubesync.dev/kubesync/sync/staging: ignore
//! ```
//!
//! Syncing a single commit:
//! ```no_run
//! use kubesync::prelude::*;
//!
//! let sync_config = SyncConfig::from_env().expect("invalid sync config");
//! let client_config = ClientConfig::load("kubesync").expect("failed to load client config");
//! let metrics = Metrics::new();
//! let client = Client::new(client_config, metrics.client_metrics()).expect("failed to create client");
//! let syncer = SpecSyncer::new(client, &sync_config, metrics);
//!
//! let project = GitProject::open(".").expect("failed to open repository");
//! let diffs = project.diff_commit("HEAD").expect("failed to diff commit");
//!
//! let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
//! let report = runtime.block_on(syncer.sync_push(&project, &diffs));
//! if report.is_degraded() {
//!     eprintln!("push was only partially synced:\n{}", report);
//! }
//! ```
#[macro_use]
extern crate serde_derive;

pub mod annotations;
pub mod changes;
pub mod client;
pub mod config;
pub mod project;
pub mod resource;
pub mod sync;

pub use serde;
pub use serde_json;
pub use serde_yaml;

pub mod prelude {
    pub use crate::annotations::{Annotations, SYNC_FACET};
    pub use crate::changes::{calculate_changes, Change, ChangeOperation, SyncMode};
    pub use crate::client::metrics::Metrics;
    pub use crate::client::Client;
    pub use crate::config::{ClientConfig, SyncConfig};
    pub use crate::project::{GitProject, PushDiff, SpecProject};
    pub use crate::resource::{ResourceDocument, ResourceIdentity};
    pub use crate::sync::{ChangeOutcome, PushReport, SpecSyncer, SyncError, SyncReport};
}
