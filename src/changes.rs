//! Calculates the set of operations needed to get from one set of spec documents to another.
//! This is a pure function of its inputs. Nothing here talks to the api server.
use crate::annotations::{Annotations, SYNC_FACET};
use crate::resource::{ResourceDocument, ResourceIdentity};

use std::collections::HashSet;
use std::fmt::{self, Display};
use std::str::FromStr;

/// Whether a resource should be made to exist or cease to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    Apply,
    Delete,
}

impl Change {
    pub fn as_str(&self) -> &'static str {
        match self {
            Change::Apply => "apply",
            Change::Delete => "delete",
        }
    }
}

impl Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnknownChangeError(pub String);

impl Display for UnknownChangeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown change: '{}', expected 'apply' or 'delete'", self.0)
    }
}
impl std::error::Error for UnknownChangeError {}

impl FromStr for Change {
    type Err = UnknownChangeError;

    fn from_str(s: &str) -> Result<Change, UnknownChangeError> {
        match s {
            "apply" => Ok(Change::Apply),
            "delete" => Ok(Change::Delete),
            other => Err(UnknownChangeError(other.to_owned())),
        }
    }
}

/// The mode of a whole-set calculation. `Apply` converges on the after set, while `Delete` tears down
/// everything in the before set.
pub type SyncMode = Change;

/// A single operation to perform against the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeOperation {
    pub change: Change,
    pub spec: ResourceDocument,
}

impl ChangeOperation {
    pub fn apply(spec: ResourceDocument) -> ChangeOperation {
        ChangeOperation {
            change: Change::Apply,
            spec,
        }
    }

    pub fn delete(spec: ResourceDocument) -> ChangeOperation {
        ChangeOperation {
            change: Change::Delete,
            spec,
        }
    }
}

/// Computes the operations needed to converge from `before` to `after`.
///
/// In `Delete` mode, every document in `before` is deleted and `after` is not looked at.
///
/// In `Apply` mode, every document in `after` is applied, except for those annotated to be ignored by
/// this controller, followed by a delete for every document in `before` whose identity is not present
/// in `after`. Ignored documents still count as present, so an object is never deleted just because
/// this controller has been told to ignore it. All applies come before any delete, and each group
/// keeps the order of its input.
///
/// Missing inputs are treated the same as empty ones.
pub fn calculate_changes(
    before: Option<&[ResourceDocument]>,
    after: Option<&[ResourceDocument]>,
    mode: SyncMode,
    annotations: &Annotations,
) -> Vec<ChangeOperation> {
    let before = before.unwrap_or(&[]);

    if mode == Change::Delete {
        return before.iter().cloned().map(ChangeOperation::delete).collect();
    }

    let after = after.unwrap_or(&[]);
    let mut changes: Vec<ChangeOperation> = annotations
        .filter_ignored(after, SYNC_FACET)
        .into_iter()
        .map(ChangeOperation::apply)
        .collect();

    let desired: HashSet<ResourceIdentity> = after.iter().map(ResourceDocument::identity).collect();
    let removed = before
        .iter()
        .filter(|doc| !desired.contains(&doc.identity()))
        .cloned()
        .map(ChangeOperation::delete);
    changes.extend(removed);

    log::debug!(
        "Calculated {} changes from {} existing and {} desired specs",
        changes.len(),
        before.len(),
        after.len()
    );
    changes
}
