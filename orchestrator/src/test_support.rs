//! Test-only helpers: record builders and throwaway git repositories.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::core::types::TaskStatus;
use crate::model::{AcceptanceCriterion, Epic, Project, Task};

/// Project record pointing at `repo_path` with base branch `main`.
pub fn project(id: &str, repo_path: impl Into<PathBuf>) -> Project {
    Project {
        id: id.to_string(),
        name: format!("{id} project"),
        repo_path: repo_path.into(),
        base_branch: "main".to_string(),
    }
}

pub fn epic(id: &str, project_id: &str) -> Epic {
    Epic {
        id: id.to_string(),
        project_id: project_id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
    }
}

/// Backlog task with deterministic title and description.
pub fn task(id: &str, project_id: &str) -> Task {
    Task {
        id: id.to_string(),
        project_id: project_id.to_string(),
        epic_id: None,
        title: format!("{id} title"),
        description: format!("{id} description"),
        status: TaskStatus::Backlog,
        progress: 0,
        requires_approval: false,
    }
}

pub fn criterion(task_id: &str, id: &str, position: u32) -> AcceptanceCriterion {
    AcceptanceCriterion {
        id: id.to_string(),
        task_id: task_id.to_string(),
        description: format!("{id} holds"),
        checked: false,
        position,
    }
}

/// Run git in `dir`, panicking with stderr on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).to_string()
}

/// Create `parent/repo` with one commit on `main` and a local identity.
pub fn init_repo(parent: &Path) -> PathBuf {
    let repo = parent.join("repo");
    fs::create_dir_all(&repo).expect("create repo dir");
    git(&repo, &["init", "--quiet"]);
    git(&repo, &["checkout", "--quiet", "-b", "main"]);
    git(&repo, &["config", "user.email", "orchestrator@example.com"]);
    git(&repo, &["config", "user.name", "Orchestrator Tests"]);
    git(&repo, &["config", "commit.gpgsign", "false"]);
    fs::write(repo.join("README.md"), "# fixture\n").expect("write readme");
    git(&repo, &["add", "-A"]);
    git(&repo, &["commit", "--quiet", "-m", "initial"]);
    repo
}
