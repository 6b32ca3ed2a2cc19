//! Executes spec changes against the cluster. `change_resource` handles a single file from a push,
//! `sync_push` drives every file in a push, and `sync_specs` converges a whole before/after set of
//! documents using `calculate_changes`.
use crate::annotations::{Annotations, SYNC_FACET};
use crate::changes::{calculate_changes, Change, ChangeOperation, SyncMode};
use crate::client::metrics::Metrics;
use crate::client::{self, Action, Client, Upserted};
use crate::config::SyncConfig;
use crate::project::{ProjectError, PushDiff, SpecProject};
use crate::resource::{ResourceDocument, ResourceIdentity, SpecParseError};

use futures::future::join_all;

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};

const FAILED_OUTCOME: &str = "failed";

#[derive(Debug)]
pub enum SyncError {
    /// An apply referred to a file that isn't in the working tree
    MissingFile { path: String },
    /// A delete referred to a file that doesn't exist at the given commit
    MissingHistoricalFile { path: String, sha: String },
    Parse {
        path: String,
        source: SpecParseError,
    },
    Project(ProjectError),
    Client(client::Error),
}

impl SyncError {
    pub fn client_error(&self) -> Option<&client::Error> {
        match self {
            SyncError::Client(e) => Some(e),
            _ => None,
        }
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncError::MissingFile { path } => {
                write!(f, "Spec file does not exist in the working tree: '{}'", path)
            }
            SyncError::MissingHistoricalFile { path, sha } => {
                write!(f, "Spec file '{}' does not exist at commit {}", path, sha)
            }
            SyncError::Parse { path, source } => {
                write!(f, "Failed to parse spec file '{}': {}", path, source)
            }
            SyncError::Project(e) => write!(f, "Failed to read from project: {}", e),
            SyncError::Client(e) => write!(f, "Cluster request failed: {}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Parse { source, .. } => Some(source),
            SyncError::Project(e) => Some(e),
            SyncError::Client(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProjectError> for SyncError {
    fn from(e: ProjectError) -> SyncError {
        SyncError::Project(e)
    }
}

impl From<client::Error> for SyncError {
    fn from(e: client::Error) -> SyncError {
        SyncError::Client(e)
    }
}

/// What happened to a single resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOutcome {
    /// The object already existed and was patched
    Applied,
    Created,
    Deleted,
    /// The spec is annotated to be ignored by this controller, so nothing was done
    Ignored,
    /// The object was to be deleted, but the cluster didn't have it
    AlreadyAbsent,
    /// The object was to be deleted, but something applied in the same pass still declares it
    Retained,
}

impl ChangeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOutcome::Applied => "applied",
            ChangeOutcome::Created => "created",
            ChangeOutcome::Deleted => "deleted",
            ChangeOutcome::Ignored => "ignored",
            ChangeOutcome::AlreadyAbsent => "absent",
            ChangeOutcome::Retained => "retained",
        }
    }
}

impl Display for ChangeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct FileFailure {
    pub diff: PushDiff,
    pub error: SyncError,
}

/// The results of every file in a push. A failure of one file never prevents the others from being
/// attempted, so a push may be partially applied.
#[derive(Debug, Default)]
pub struct PushReport {
    pub outcomes: Vec<(PushDiff, ChangeOutcome)>,
    pub failures: Vec<FileFailure>,
}

impl PushReport {
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

impl Display for PushReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (diff, outcome) in self.outcomes.iter() {
            writeln!(f, "{}: {}", diff, outcome)?;
        }
        for failure in self.failures.iter() {
            writeln!(f, "{}: failed: {}", failure.diff, failure.error)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct OperationFailure {
    pub operation: ChangeOperation,
    pub error: client::Error,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub outcomes: Vec<(ChangeOperation, ChangeOutcome)>,
    pub failures: Vec<OperationFailure>,
}

impl SyncReport {
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    fn record(
        &mut self,
        operations: Vec<ChangeOperation>,
        results: Vec<Result<ChangeOutcome, client::Error>>,
    ) {
        for (operation, result) in operations.into_iter().zip(results) {
            match result {
                Ok(outcome) => self.outcomes.push((operation, outcome)),
                Err(error) => {
                    log::error!(
                        "Failed to {} {}: {}",
                        operation.change,
                        operation.spec.identity(),
                        error
                    );
                    self.failures.push(OperationFailure { operation, error });
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpecSyncer {
    client: Client,
    annotations: Annotations,
    metrics: Metrics,
}

impl SpecSyncer {
    pub fn new(client: Client, config: &SyncConfig, metrics: Metrics) -> SpecSyncer {
        SpecSyncer {
            client,
            annotations: Annotations::new(config),
            metrics,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Converges the cluster with a single file level change. Applies read the file from the
    /// working tree and create or patch the object. Deletes read the file as it was at the diff's
    /// commit and delete the object, which is considered done if the object is already gone.
    pub async fn change_resource<P: SpecProject + ?Sized>(
        &self,
        project: &P,
        diff: &PushDiff,
    ) -> Result<ChangeOutcome, SyncError> {
        self.change_file(project, diff, &HashSet::new()).await
    }

    /// Processes every diff in order. Each one is attempted no matter what happened to the ones
    /// before it. A delete is skipped when the object it refers to is still declared by one of the
    /// applied files, which is what happens when a spec is moved to a different file.
    pub async fn sync_push<P: SpecProject + ?Sized>(
        &self,
        project: &P,
        diffs: &[PushDiff],
    ) -> PushReport {
        self.client.clear_discovery_cache();
        let declared = if diffs.iter().any(|d| d.change == Change::Delete) {
            declared_identities(project, diffs)
        } else {
            HashSet::new()
        };

        let mut report = PushReport::default();
        for diff in diffs {
            match self.change_file(project, diff, &declared).await {
                Ok(outcome) => report.outcomes.push((diff.clone(), outcome)),
                Err(error) => {
                    log::error!("Failed to {} spec file '{}': {}", diff.change, diff.path, error);
                    report.failures.push(FileFailure {
                        diff: diff.clone(),
                        error,
                    });
                }
            }
        }
        log::info!(
            "Finished syncing {} spec files with {} failures",
            diffs.len(),
            report.failures.len()
        );
        report
    }

    async fn change_file<P: SpecProject + ?Sized>(
        &self,
        project: &P,
        diff: &PushDiff,
        declared: &HashSet<ResourceIdentity>,
    ) -> Result<ChangeOutcome, SyncError> {
        let result = match diff.change {
            Change::Apply => self.apply_file(project, diff).await,
            Change::Delete => self.delete_file(project, diff, declared).await,
        };
        let outcome = match result.as_ref() {
            Ok(outcome) => outcome.as_str(),
            Err(_) => FAILED_OUTCOME,
        };
        self.metrics.operation_completed(diff.change, outcome);
        result
    }

    /// Calculates the operations needed to get from `before` to `after` and executes them. Every
    /// apply finishes before the first delete is started. Operations on different objects run
    /// concurrently, while operations on the same object run one after another. A delete of an
    /// object that was also applied in this pass is skipped, which covers documents that address
    /// the same object without having the same identity.
    pub async fn sync_specs(
        &self,
        before: Option<&[ResourceDocument]>,
        after: Option<&[ResourceDocument]>,
        mode: SyncMode,
    ) -> SyncReport {
        self.client.clear_discovery_cache();
        let operations = calculate_changes(before, after, mode, &self.annotations);
        let (applies, deletes): (Vec<ChangeOperation>, Vec<ChangeOperation>) = operations
            .into_iter()
            .partition(|op| op.change == Change::Apply);

        let mut report = SyncReport::default();
        let apply_paths = self.object_paths(&applies).await;
        let results = self.execute_batch(&applies, &apply_paths).await;
        report.record(applies, results);

        let applied: HashSet<Vec<String>> = apply_paths.into_iter().flatten().collect();
        let delete_paths = self.object_paths(&deletes).await;
        let mut remaining = Vec::with_capacity(deletes.len());
        let mut remaining_paths = Vec::with_capacity(deletes.len());
        for (operation, path) in deletes.into_iter().zip(delete_paths) {
            match path {
                Some(ref p) if applied.contains(p) => {
                    log::info!(
                        "Not deleting {} because it was applied as part of the same sync",
                        operation.spec.identity()
                    );
                    self.metrics
                        .operation_completed(Change::Delete, ChangeOutcome::Retained.as_str());
                    report.outcomes.push((operation, ChangeOutcome::Retained));
                }
                path => {
                    remaining.push(operation);
                    remaining_paths.push(path);
                }
            }
        }
        let results = self.execute_batch(&remaining, &remaining_paths).await;
        report.record(remaining, results);
        report
    }

    /// The request path of each operation's object, or `None` if it can't be addressed. Any problem
    /// resolving the path is reported when the operation itself is executed.
    async fn object_paths(&self, operations: &[ChangeOperation]) -> Vec<Option<Vec<String>>> {
        join_all(operations.iter().map(|op| async move {
            self.client
                .resolve_address(&op.spec, Action::Read)
                .await
                .ok()
                .map(|address| address.path)
        }))
        .await
    }

    /// Executes the operations, grouping those with the same object path so that they run in order.
    /// The results are returned in the same order as `operations`.
    async fn execute_batch(
        &self,
        operations: &[ChangeOperation],
        paths: &[Option<Vec<String>>],
    ) -> Vec<Result<ChangeOutcome, client::Error>> {
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut group_by_path: HashMap<&[String], usize> = HashMap::new();
        for (i, path) in paths.iter().enumerate() {
            match path {
                Some(p) => match group_by_path.get(p.as_slice()) {
                    Some(&group) => groups[group].push(i),
                    None => {
                        group_by_path.insert(p.as_slice(), groups.len());
                        groups.push(vec![i]);
                    }
                },
                None => groups.push(vec![i]),
            }
        }

        let grouped = join_all(groups.into_iter().map(|group| async move {
            let mut results = Vec::with_capacity(group.len());
            for i in group {
                results.push((i, self.execute_operation(&operations[i]).await));
            }
            results
        }))
        .await;
        let mut results: Vec<(usize, Result<ChangeOutcome, client::Error>)> =
            grouped.into_iter().flatten().collect();
        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, result)| result).collect()
    }

    async fn execute_operation(&self, operation: &ChangeOperation) -> Result<ChangeOutcome, client::Error> {
        let result = match operation.change {
            Change::Apply => self.upsert(&operation.spec).await,
            Change::Delete => self.delete(&operation.spec).await,
        };
        let outcome = match result.as_ref() {
            Ok(outcome) => outcome.as_str(),
            Err(_) => FAILED_OUTCOME,
        };
        self.metrics.operation_completed(operation.change, outcome);
        result
    }

    async fn apply_file<P: SpecProject + ?Sized>(
        &self,
        project: &P,
        diff: &PushDiff,
    ) -> Result<ChangeOutcome, SyncError> {
        let content = project
            .read_working_tree_file(diff.path.as_str())?
            .ok_or_else(|| SyncError::MissingFile {
                path: diff.path.clone(),
            })?;
        let spec = parse_spec(diff.path.as_str(), content.as_str())?;
        if self.is_ignored(&spec, diff) {
            return Ok(ChangeOutcome::Ignored);
        }
        self.upsert(&spec).await.map_err(Into::into)
    }

    async fn delete_file<P: SpecProject + ?Sized>(
        &self,
        project: &P,
        diff: &PushDiff,
        declared: &HashSet<ResourceIdentity>,
    ) -> Result<ChangeOutcome, SyncError> {
        let content = project
            .read_file_at_commit(diff.path.as_str(), diff.sha.as_str())?
            .ok_or_else(|| SyncError::MissingHistoricalFile {
                path: diff.path.clone(),
                sha: diff.sha.clone(),
            })?;
        let spec = parse_spec(diff.path.as_str(), content.as_str())?;
        if self.is_ignored(&spec, diff) {
            return Ok(ChangeOutcome::Ignored);
        }
        let identity = spec.identity();
        if declared.contains(&identity) {
            log::info!(
                "Not deleting {} for '{}' because it is still declared by an applied spec file",
                identity,
                diff.path
            );
            return Ok(ChangeOutcome::Retained);
        }
        self.delete(&spec).await.map_err(Into::into)
    }

    fn is_ignored(&self, spec: &ResourceDocument, diff: &PushDiff) -> bool {
        let ignored = self.annotations.is_ignored(spec, SYNC_FACET);
        if ignored {
            log::info!(
                "Skipping {} of '{}' because {} is annotated to be ignored by '{}'",
                diff.change,
                diff.path,
                spec.identity(),
                self.annotations.identity()
            );
        }
        ignored
    }

    async fn upsert(&self, spec: &ResourceDocument) -> Result<ChangeOutcome, client::Error> {
        match self.client.upsert(spec).await? {
            Upserted::Created(_) => Ok(ChangeOutcome::Created),
            Upserted::Patched(_) => Ok(ChangeOutcome::Applied),
        }
    }

    async fn delete(&self, spec: &ResourceDocument) -> Result<ChangeOutcome, client::Error> {
        match self.client.delete(spec).await {
            Ok(_) => Ok(ChangeOutcome::Deleted),
            Err(ref e) if e.is_not_found() => {
                log::warn!("{} was already absent from the cluster", spec.identity());
                Ok(ChangeOutcome::AlreadyAbsent)
            }
            Err(e) => Err(e),
        }
    }
}

/// The identities of every document that's applied by the diffs. Ignored documents are included, so
/// that an object is never deleted just because this controller was told to ignore it. Files that
/// can't be read or parsed are left out here and reported when they're applied.
fn declared_identities<P: SpecProject + ?Sized>(
    project: &P,
    diffs: &[PushDiff],
) -> HashSet<ResourceIdentity> {
    diffs
        .iter()
        .filter(|diff| diff.change == Change::Apply)
        .filter_map(|diff| {
            let content = project.read_working_tree_file(diff.path.as_str()).ok()??;
            ResourceDocument::parse(diff.path.as_str(), content.as_str()).ok()
        })
        .map(|spec| spec.identity())
        .collect()
}

fn parse_spec(path: &str, content: &str) -> Result<ResourceDocument, SyncError> {
    ResourceDocument::parse(path, content).map_err(|source| SyncError::Parse {
        path: path.to_owned(),
        source,
    })
}
