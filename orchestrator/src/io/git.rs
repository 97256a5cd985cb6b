//! Git adapter for workspace provisioning and publishing.
//!
//! Workspaces are git worktrees of the project repository, so every
//! operation here is an explicit `git` subprocess call in a known directory.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use super::process::HelperCommand;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// One line of `git diff --name-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameStatus {
    /// Single status letter (`A`, `M`, `D`, `T`, ...).
    pub status: char,
    pub path: String,
}

/// One line of `git diff --numstat`; binary files report zero counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumStat {
    pub insertions: u32,
    pub deletions: u32,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when the workdir exists and sits inside a git work tree.
    pub fn is_repository(&self) -> bool {
        if !self.workdir.is_dir() {
            return false;
        }
        match self.run(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) => out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true",
            Err(_) => false,
        }
    }

    /// Absolute path of the work tree root containing the workdir.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Untracked, non-ignored paths relative to the work tree root.
    pub fn untracked_files(&self) -> Result<Vec<String>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .filter(|e| e.code == "??")
            .map(|e| e.path)
            .collect())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Check whether a revision (branch, remote ref, sha) resolves to a commit.
    pub fn rev_exists(&self, rev: &str) -> Result<bool> {
        let spec = format!("{rev}^{{commit}}");
        let status = self.run(&["rev-parse", "--verify", "--quiet", &spec])?.status;
        Ok(status.success())
    }

    /// Fetch a single branch from a remote.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        debug!(remote, branch, "fetching");
        self.run_checked(&["fetch", "--quiet", remote, branch])?;
        Ok(())
    }

    pub fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        let out = self.run_capture(&["merge-base", a, b])?;
        Ok(out.trim().to_string())
    }

    /// Add a worktree at `path` on a new branch started from `start_point`.
    #[instrument(skip_all, fields(branch, start_point))]
    pub fn worktree_add_new_branch(&self, path: &Path, branch: &str, start_point: &str) -> Result<()> {
        let path_str = path_arg(path)?;
        debug!(branch, start_point, path = %path.display(), "adding worktree with new branch");
        self.run_checked(&["worktree", "add", "-b", branch, path_str, start_point])?;
        Ok(())
    }

    /// Add a worktree at `path` checking out an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn worktree_add_existing(&self, path: &Path, branch: &str) -> Result<()> {
        let path_str = path_arg(path)?;
        debug!(branch, path = %path.display(), "adding worktree for existing branch");
        self.run_checked(&["worktree", "add", path_str, branch])?;
        Ok(())
    }

    #[instrument(skip_all)]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path_arg(path)?;
        debug!(path = %path.display(), "removing worktree");
        self.run_checked(&["worktree", "remove", "--force", path_str])?;
        Ok(())
    }

    /// Drop administrative entries for worktrees whose directories are gone.
    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// `git diff --name-status` of the work tree against `base`.
    pub fn diff_name_status(&self, base: &str) -> Result<Vec<NameStatus>> {
        let out = self.run_capture(&["diff", "--no-renames", "--name-status", base])?;
        out.lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_name_status_line)
            .collect()
    }

    /// `git diff --numstat` of the work tree against `base`.
    pub fn diff_numstat(&self, base: &str) -> Result<Vec<NumStat>> {
        let out = self.run_capture(&["diff", "--no-renames", "--numstat", base])?;
        out.lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_numstat_line)
            .collect()
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// URL of a configured remote, or `None` if the remote is not configured.
    pub fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        let out = self.run(&["remote", "get-url", remote])?;
        if !out.status.success() {
            return Ok(None);
        }
        let url = String::from_utf8_lossy(&out.stdout).trim().to_string();
        Ok((!url.is_empty()).then_some(url))
    }

    /// Push `branch` to `remote`, setting upstream. Network bound, so timed.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push_branch(&self, remote: &str, branch: &str, timeout: Duration) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.args(["push", "--set-upstream", remote, branch])
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0");
        HelperCommand::new("git push", cmd, timeout).run()?;
        debug!("pushed branch");
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 path {}", path.display()))
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_name_status_line(line: &str) -> Result<NameStatus> {
    let (code, path) = line
        .split_once('\t')
        .ok_or_else(|| anyhow!("unexpected name-status line: '{line}'"))?;
    let status = code
        .chars()
        .next()
        .ok_or_else(|| anyhow!("empty name-status code: '{line}'"))?;
    Ok(NameStatus {
        status,
        path: path.to_string(),
    })
}

fn parse_numstat_line(line: &str) -> Result<NumStat> {
    let mut parts = line.splitn(3, '\t');
    let (Some(ins), Some(del), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(anyhow!("unexpected numstat line: '{line}'"));
    };
    let count = |raw: &str| -> Result<u32> {
        if raw == "-" {
            return Ok(0);
        }
        raw.parse::<u32>()
            .with_context(|| format!("parse numstat count '{raw}'"))
    };
    Ok(NumStat {
        insertions: count(ins)?,
        deletions: count(del)?,
        path: path.to_string(),
    })
}
