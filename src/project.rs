//! Access to the spec files of a project under version control. Applies read the current working
//! tree, while deletes need the content of a file as it was before it was removed, which only the
//! history can provide.
use crate::changes::Change;

use anyhow::{anyhow, Context};
use git2::{Delta, DiffFindOptions, ErrorCode, Repository};

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File extensions that are considered to be spec files
pub const SPEC_FILE_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// A single file level change from a push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushDiff {
    pub change: Change,
    pub path: String,
    /// For an apply, the commit that added or modified the file. For a delete, a commit at
    /// which the file still existed.
    pub sha: String,
}

impl PushDiff {
    pub fn apply(path: impl Into<String>, sha: impl Into<String>) -> PushDiff {
        PushDiff {
            change: Change::Apply,
            path: path.into(),
            sha: sha.into(),
        }
    }

    pub fn delete(path: impl Into<String>, sha: impl Into<String>) -> PushDiff {
        PushDiff {
            change: Change::Delete,
            path: path.into(),
            sha: sha.into(),
        }
    }
}

impl Display for PushDiff {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}@{}", self.change, self.path, self.sha)
    }
}

/// Returns true if the path has one of the spec file extensions
pub fn is_spec_file(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SPEC_FILE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

#[derive(Debug)]
pub struct ProjectError(anyhow::Error);

impl ProjectError {
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl Display for ProjectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for ProjectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for ProjectError {
    fn from(e: anyhow::Error) -> ProjectError {
        ProjectError(e)
    }
}

/// The project that spec files are read from. Both functions return `Ok(None)` when the file
/// doesn't exist, and only return an error if the lookup itself failed.
pub trait SpecProject {
    fn read_working_tree_file(&self, path: &str) -> Result<Option<String>, ProjectError>;

    fn read_file_at_commit(&self, path: &str, sha: &str) -> Result<Option<String>, ProjectError>;
}

impl<'a, T: SpecProject + ?Sized> SpecProject for &'a T {
    fn read_working_tree_file(&self, path: &str) -> Result<Option<String>, ProjectError> {
        (**self).read_working_tree_file(path)
    }

    fn read_file_at_commit(&self, path: &str, sha: &str) -> Result<Option<String>, ProjectError> {
        (**self).read_file_at_commit(path, sha)
    }
}

/// A project that's backed by a local git repository with a working tree
pub struct GitProject {
    repo: Mutex<Repository>,
    workdir: PathBuf,
}

impl fmt::Debug for GitProject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GitProject")
            .field("workdir", &self.workdir)
            .finish()
    }
}

impl GitProject {
    pub fn open(path: impl AsRef<Path>) -> Result<GitProject, ProjectError> {
        let path = path.as_ref();
        let repo = Repository::open(path)
            .with_context(|| format!("failed to open git repository at '{}'", path.display()))?;
        GitProject::from_repository(repo)
    }

    pub fn from_repository(repo: Repository) -> Result<GitProject, ProjectError> {
        let workdir = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("repository at '{}' is bare", repo.path().display()))?;
        Ok(GitProject {
            repo: Mutex::new(repo),
            workdir,
        })
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.as_path()
    }

    /// Returns the spec file changes that were made by the given commit, compared to its first
    /// parent. The first commit in a repository is compared to an empty tree. Renames are treated
    /// as a delete of the old path and an apply of the new one. All applies come before any deletes.
    /// Delete entries carry the sha of the parent commit, where the file still existed.
    pub fn diff_commit(&self, sha: &str) -> Result<Vec<PushDiff>, ProjectError> {
        let repo = self.lock_repo();
        let commit = repo
            .revparse_single(sha)
            .and_then(|obj| obj.peel_to_commit())
            .with_context(|| format!("failed to find commit '{}'", sha))?;
        let commit_id = commit.id().to_string();
        let tree = commit.tree().context("failed to read commit tree")?;

        let parent = if commit.parent_count() > 0 {
            Some(commit.parent(0).context("failed to read parent commit")?)
        } else {
            None
        };
        let parent_tree = match parent.as_ref() {
            Some(p) => Some(p.tree().context("failed to read parent tree")?),
            None => None,
        };
        let parent_id = parent.as_ref().map(|p| p.id().to_string());

        let mut diff = repo
            .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)
            .context("failed to diff commit against its parent")?;
        diff.find_similar(Some(DiffFindOptions::new().renames(true)))
            .context("failed to detect renames")?;

        let mut deletes = Vec::new();
        let mut applies = Vec::new();
        for delta in diff.deltas() {
            let old_path = delta.old_file().path().and_then(Path::to_str);
            let new_path = delta.new_file().path().and_then(Path::to_str);
            match delta.status() {
                Delta::Added | Delta::Modified | Delta::Copied | Delta::Typechange => {
                    applies.extend(new_path);
                }
                Delta::Deleted => {
                    deletes.extend(old_path);
                }
                Delta::Renamed => {
                    deletes.extend(old_path);
                    applies.extend(new_path);
                }
                other => {
                    log::trace!("Ignoring delta with status: {:?}", other);
                }
            }
        }

        let mut diffs: Vec<PushDiff> = applies
            .into_iter()
            .filter(|p| is_spec_file(p))
            .map(|p| PushDiff::apply(p, commit_id.as_str()))
            .collect();
        if let Some(parent_id) = parent_id {
            diffs.extend(
                deletes
                    .into_iter()
                    .filter(|p| is_spec_file(p))
                    .map(|p| PushDiff::delete(p, parent_id.as_str())),
            );
        }
        log::debug!("Commit {} changed {} spec files", commit_id, diffs.len());
        Ok(diffs)
    }

    fn lock_repo(&self) -> std::sync::MutexGuard<'_, Repository> {
        self.repo
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SpecProject for GitProject {
    fn read_working_tree_file(&self, path: &str) -> Result<Option<String>, ProjectError> {
        let full_path = self.workdir.join(path);
        match std::fs::read_to_string(&full_path) {
            Ok(content) => Ok(Some(content)),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("failed to read '{}'", full_path.display()))
                .into()),
        }
    }

    fn read_file_at_commit(&self, path: &str, sha: &str) -> Result<Option<String>, ProjectError> {
        let repo = self.lock_repo();
        let commit = repo
            .revparse_single(sha)
            .and_then(|obj| obj.peel_to_commit())
            .with_context(|| format!("failed to find commit '{}'", sha))?;
        let tree = commit.tree().context("failed to read commit tree")?;

        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(ref e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to look up '{}' at {}", path, sha))
                    .into())
            }
        };
        let blob = entry
            .to_object(&repo)
            .and_then(|obj| obj.peel_to_blob())
            .with_context(|| format!("'{}' at {} is not a file", path, sha))?;
        let content = std::str::from_utf8(blob.content())
            .with_context(|| format!("'{}' at {} is not valid utf-8", path, sha))?;
        Ok(Some(content.to_owned()))
    }
}

/// A project that lives entirely in memory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InMemoryProject {
    working_tree: HashMap<String, String>,
    commits: HashMap<String, HashMap<String, String>>,
}

impl InMemoryProject {
    pub fn new() -> InMemoryProject {
        InMemoryProject::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.working_tree.insert(path.into(), content.into());
        self
    }

    pub fn with_file_at_commit(
        mut self,
        sha: impl Into<String>,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        self.commits
            .entry(sha.into())
            .or_insert_with(HashMap::new)
            .insert(path.into(), content.into());
        self
    }

    pub fn remove_file(&mut self, path: &str) -> Option<String> {
        self.working_tree.remove(path)
    }
}

impl SpecProject for InMemoryProject {
    fn read_working_tree_file(&self, path: &str) -> Result<Option<String>, ProjectError> {
        Ok(self.working_tree.get(path).cloned())
    }

    fn read_file_at_commit(&self, path: &str, sha: &str) -> Result<Option<String>, ProjectError> {
        Ok(self
            .commits
            .get(sha)
            .and_then(|files| files.get(path))
            .cloned())
    }
}
