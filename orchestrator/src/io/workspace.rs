//! Per-task isolated workspaces backed by git worktrees.
//!
//! Layout: `{workspaces_dir}/{repo-name}-{hash8}/task-{id}`, where `hash8`
//! is derived from the canonical repository path so two checkouts of
//! same-named repositories never share a root.
//!
//! The tracked set lives in memory only. After a restart it is rebuilt by
//! [`WorkspaceManager::adopt_existing`] and anything left untracked is
//! removed by [`WorkspaceManager::reconcile_orphans`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::git::Git;
use crate::core::branch::workspace_dir_name;
use crate::core::types::FileChangeType;
use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Workspace {
    pub task_id: String,
    pub repo_path: PathBuf,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffFile {
    pub path: String,
    pub change: FileChangeType,
    pub insertions: u32,
    pub deletions: u32,
}

/// Changes in a workspace relative to the fork point with its base branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkspaceDiff {
    pub files: Vec<DiffFile>,
    pub insertions: u32,
    pub deletions: u32,
}

impl WorkspaceDiff {
    pub fn has_changes(&self) -> bool {
        !self.files.is_empty()
    }

    pub fn paths_with(&self, change: FileChangeType) -> Vec<String> {
        self.files
            .iter()
            .filter(|f| f.change == change)
            .map(|f| f.path.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

#[derive(Debug)]
pub struct WorkspaceManager {
    workspaces_dir: PathBuf,
    remote: String,
    tracked: Mutex<HashMap<String, Workspace>>,
}

impl WorkspaceManager {
    pub fn new(workspaces_dir: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            workspaces_dir: workspaces_dir.into(),
            remote: remote.into(),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Root holding every workspace of one repository.
    pub fn project_root(&self, repo_path: &Path) -> Result<PathBuf> {
        let canonical = fs::canonicalize(repo_path)
            .with_context(|| format!("canonicalize {}", repo_path.display()))?;
        let name = canonical
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("repo");
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        let hash = hex::encode(digest);
        Ok(self.workspaces_dir.join(format!("{name}-{}", &hash[..8])))
    }

    pub fn task_dir(&self, repo_path: &Path, task_id: &str) -> Result<PathBuf> {
        Ok(self.project_root(repo_path)?.join(workspace_dir_name(task_id)))
    }

    pub fn tracked(&self, task_id: &str) -> Result<Option<Workspace>> {
        Ok(self.lock()?.get(task_id).cloned())
    }

    /// Return the task's workspace, adopting or creating it as needed.
    #[instrument(skip_all, fields(task_id, branch))]
    pub fn acquire(
        &self,
        task_id: &str,
        repo_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> OrchestratorResult<Workspace> {
        let repo = Git::new(repo_path);
        if !repo.is_repository() {
            return Err(OrchestratorError::validation(format!(
                "{} is not a git repository",
                repo_path.display()
            )));
        }

        if let Some(existing) = self.tracked(task_id)? {
            return same_binding(&existing, repo_path, branch).map(|()| existing);
        }

        if let Some(adopted) = self.adopt_existing(task_id, repo_path, branch, base_branch)? {
            return Ok(adopted);
        }

        let dir = self.task_dir(repo_path, task_id)?;
        if dir.exists() {
            warn!(path = %dir.display(), "removing invalid workspace directory");
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
            if let Err(err) = repo.worktree_prune() {
                warn!(err = %err, "worktree prune failed");
            }
        }
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }

        if repo.branch_exists(branch)? {
            repo.worktree_add_existing(&dir, branch)?;
        } else {
            let start = self.start_point(&repo, base_branch)?;
            repo.worktree_add_new_branch(&dir, branch, &start)?;
        }

        let workspace = Workspace {
            task_id: task_id.to_string(),
            repo_path: repo_path.to_path_buf(),
            path: dir,
            branch: branch.to_string(),
            base_branch: base_branch.to_string(),
        };
        info!(path = %workspace.path.display(), "created workspace");
        self.track(workspace)
    }

    /// Track a valid on-disk checkout for the task, without creating anything.
    pub fn adopt_existing(
        &self,
        task_id: &str,
        repo_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<Option<Workspace>> {
        let dir = self.task_dir(repo_path, task_id)?;
        if !is_checkout_root(&dir) {
            return Ok(None);
        }
        match Git::new(&dir).current_branch() {
            Ok(current) if current != branch => {
                warn!(expected = branch, found = %current, "adopting workspace on unexpected branch");
            }
            Ok(_) => {}
            Err(err) => warn!(err = %err, "could not read workspace branch"),
        }
        let workspace = Workspace {
            task_id: task_id.to_string(),
            repo_path: repo_path.to_path_buf(),
            path: dir,
            branch: branch.to_string(),
            base_branch: base_branch.to_string(),
        };
        debug!(path = %workspace.path.display(), "adopted existing workspace");
        match self.track(workspace) {
            Ok(ws) => Ok(Some(ws)),
            Err(OrchestratorError::Internal(err)) => Err(err),
            Err(other) => Err(anyhow!(other.to_string())),
        }
    }

    /// Remove the task's workspace. Returns false when there was nothing to remove.
    #[instrument(skip_all, fields(task_id))]
    pub fn release(&self, task_id: &str, repo_path: &Path) -> Result<bool> {
        let tracked = self.lock()?.remove(task_id);
        let dir = match &tracked {
            Some(ws) => ws.path.clone(),
            None => self.task_dir(repo_path, task_id)?,
        };
        if !dir.exists() {
            debug!("nothing to release");
            return Ok(tracked.is_some());
        }
        remove_worktree(&Git::new(repo_path), &dir)?;
        info!(path = %dir.display(), "released workspace");
        Ok(true)
    }

    /// Force-remove every on-disk workspace of `repo_path` that is not tracked.
    #[instrument(skip_all)]
    pub fn reconcile_orphans(&self, repo_path: &Path) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let root = match self.project_root(repo_path) {
            Ok(root) => root,
            Err(err) => {
                report
                    .failures
                    .push((repo_path.to_path_buf(), format!("{err:#}")));
                return report;
            }
        };
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(_) => return report,
        };
        let tracked: Vec<PathBuf> = match self.lock() {
            Ok(map) => map.values().map(|ws| ws.path.clone()).collect(),
            Err(err) => {
                report.failures.push((root, format!("{err:#}")));
                return report;
            }
        };

        let repo = Git::new(repo_path);
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || tracked.contains(&path) {
                continue;
            }
            match remove_worktree(&repo, &path) {
                Ok(()) => {
                    info!(path = %path.display(), "removed orphaned workspace");
                    report.removed.push(path);
                }
                Err(err) => {
                    warn!(path = %path.display(), err = %err, "failed to remove orphaned workspace");
                    report.failures.push((path, format!("{err:#}")));
                }
            }
        }
        report
    }

    /// Diff against the fork point with the base branch.
    ///
    /// Any git failure is logged and reported as "no changes".
    pub fn diff_against_base(&self, workspace: &Workspace) -> WorkspaceDiff {
        match compute_diff(workspace, &self.remote) {
            Ok(diff) => diff,
            Err(err) => {
                warn!(task_id = %workspace.task_id, err = %err, "could not diff workspace; assuming no changes");
                WorkspaceDiff::default()
            }
        }
    }

    fn start_point(&self, repo: &Git, base_branch: &str) -> OrchestratorResult<String> {
        let remote_ref = format!("{}/{base_branch}", self.remote);
        if repo.remote_url(&self.remote)?.is_some() {
            match repo.fetch(&self.remote, base_branch) {
                Ok(()) if repo.rev_exists(&remote_ref)? => return Ok(remote_ref),
                Ok(()) => {}
                Err(err) => warn!(err = %err, "fetch failed; using local base branch"),
            }
        }
        if repo.rev_exists(base_branch)? {
            return Ok(base_branch.to_string());
        }
        Err(OrchestratorError::validation(format!(
            "base branch '{base_branch}' not found"
        )))
    }

    fn track(&self, workspace: Workspace) -> OrchestratorResult<Workspace> {
        let mut map = self.lock()?;
        if let Some(existing) = map.get(&workspace.task_id) {
            same_binding(existing, &workspace.repo_path, &workspace.branch)?;
            return Ok(existing.clone());
        }
        map.insert(workspace.task_id.clone(), workspace.clone());
        Ok(workspace)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Workspace>>> {
        self.tracked
            .lock()
            .map_err(|_| anyhow!("workspace registry lock poisoned"))
    }
}

fn same_binding(existing: &Workspace, repo_path: &Path, branch: &str) -> OrchestratorResult<()> {
    if existing.repo_path != repo_path || existing.branch != branch {
        return Err(OrchestratorError::validation(format!(
            "task {} already has a workspace on branch {} at {}",
            existing.task_id,
            existing.branch,
            existing.path.display()
        )));
    }
    Ok(())
}

/// True when `dir` is itself the top level of a git work tree, not merely a
/// directory nested inside some other checkout.
fn is_checkout_root(dir: &Path) -> bool {
    let git = Git::new(dir);
    if !git.is_repository() {
        return false;
    }
    match (git.toplevel(), fs::canonicalize(dir)) {
        (Ok(top), Ok(canonical)) => fs::canonicalize(top).is_ok_and(|t| t == canonical),
        _ => false,
    }
}

fn remove_worktree(repo: &Git, dir: &Path) -> Result<()> {
    if let Err(err) = repo.worktree_remove(dir) {
        debug!(err = %err, "worktree remove failed; deleting directory");
        if dir.exists() {
            fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
        }
        if let Err(err) = repo.worktree_prune() {
            warn!(err = %err, "worktree prune failed");
        }
    }
    Ok(())
}

fn compute_diff(workspace: &Workspace, remote: &str) -> Result<WorkspaceDiff> {
    let git = Git::new(&workspace.path);
    let remote_ref = format!("{remote}/{}", workspace.base_branch);
    let base_ref = if git.rev_exists(&remote_ref)? {
        remote_ref
    } else {
        workspace.base_branch.clone()
    };
    let fork = git.merge_base("HEAD", &base_ref)?;

    let counts: HashMap<String, (u32, u32)> = git
        .diff_numstat(&fork)?
        .into_iter()
        .map(|n| (n.path, (n.insertions, n.deletions)))
        .collect();

    let mut files = Vec::new();
    for entry in git.diff_name_status(&fork)? {
        let change = match entry.status {
            'A' => FileChangeType::Created,
            'D' => FileChangeType::Deleted,
            _ => FileChangeType::Modified,
        };
        let (insertions, deletions) = counts.get(&entry.path).copied().unwrap_or_default();
        files.push(DiffFile {
            path: entry.path,
            change,
            insertions,
            deletions,
        });
    }
    for path in git.untracked_files()? {
        let insertions = count_lines(&workspace.path.join(&path));
        files.push(DiffFile {
            path,
            change: FileChangeType::Created,
            insertions,
            deletions: 0,
        });
    }

    Ok(WorkspaceDiff {
        insertions: files.iter().map(|f| f.insertions).sum(),
        deletions: files.iter().map(|f| f.deletions).sum(),
        files,
    })
}

/// Line count of a text file; binary or unreadable files count as zero.
fn count_lines(path: &Path) -> u32 {
    match fs::read(path) {
        Ok(bytes) if !bytes.contains(&0) => {
            String::from_utf8_lossy(&bytes).lines().count() as u32
        }
        _ => 0,
    }
}
