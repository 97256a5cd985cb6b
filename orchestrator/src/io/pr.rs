//! Publishing finished task branches: commit, push, then open a pull request.
//!
//! Pull requests go through a fallback chain. The GitHub REST API is tried
//! when a token is configured, then the `gh` CLI, and finally a compare URL
//! is constructed for the user to open by hand.

use std::fmt::Write as _;
use std::process::Command;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::config::PublishConfig;
use super::git::Git;
use super::process::HelperCommand;
use super::workspace::{Workspace, WorkspaceDiff};
use crate::model::{AcceptanceCriterion, Task};

const USER_AGENT: &str = concat!("orchestrator/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
    pub owner: String,
    pub repo: String,
}

/// How a pull request URL was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrTier {
    Api,
    Cli,
    CompareUrl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrOutcome {
    pub url: String,
    pub via: PrTier,
}

#[derive(Debug, Clone)]
pub struct PrRequest<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub head: &'a str,
    pub base: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatedPull {
    html_url: String,
}

/// Owner and repository of a GitHub remote (https or ssh form).
pub fn parse_remote_url(url: &str) -> Option<RepoSlug> {
    static GITHUB_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^(?:https?://(?:[^@/]+@)?github\.com/|(?:ssh://)?git@github\.com[:/])([^/]+)/([^/]+?)(?:\.git)?/?$")
            .expect("github remote pattern is valid")
    });
    let caps = GITHUB_RE.captures(url.trim())?;
    Some(RepoSlug {
        owner: caps.get(1)?.as_str().to_string(),
        repo: caps.get(2)?.as_str().to_string(),
    })
}

pub fn compare_url(slug: &RepoSlug, base: &str, head: &str) -> String {
    format!(
        "https://github.com/{}/{}/compare/{base}...{head}?expand=1",
        slug.owner, slug.repo
    )
}

/// Markdown body listing the task, its criteria and the diff summary.
pub fn pull_request_body(task: &Task, criteria: &[AcceptanceCriterion], diff: &WorkspaceDiff) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "{}\n", task.description.trim());
    let _ = writeln!(body, "### Acceptance criteria\n");
    for c in criteria {
        let mark = if c.checked { "x" } else { " " };
        let _ = writeln!(body, "- [{mark}] {}", c.description);
    }
    let _ = writeln!(
        body,
        "\n{} files changed, {} insertions(+), {} deletions(-)",
        diff.files.len(),
        diff.insertions,
        diff.deletions
    );
    let _ = writeln!(body, "\nTask: `{}`", task.id);
    body
}

#[derive(Debug, Clone)]
pub struct Publisher {
    config: PublishConfig,
    remote: String,
}

impl Publisher {
    pub fn new(config: PublishConfig) -> Self {
        let remote = config.remote.clone();
        Self { config, remote }
    }

    /// Commit everything in the workspace, push its branch and open a PR.
    ///
    /// Commit and push failures are errors; PR tiers fall through to the next.
    #[instrument(skip_all, fields(task_id = %workspace.task_id, branch = %workspace.branch))]
    pub fn publish(&self, workspace: &Workspace, title: &str, body: &str) -> Result<PrOutcome> {
        let git = Git::new(&workspace.path);
        git.add_all().context("stage workspace changes")?;
        let committed = git
            .commit_staged(&format!("{title}\n\nTask: {}", workspace.task_id))
            .context("commit workspace changes")?;
        debug!(committed, "workspace committed");
        git.push_branch(&self.remote, &workspace.branch, self.config.command_timeout())
            .context("push task branch")?;

        let request = PrRequest {
            title,
            body,
            head: &workspace.branch,
            base: &workspace.base_branch,
        };
        let outcome = self.open_pull_request(&git, &request)?;
        info!(url = %outcome.url, via = ?outcome.via, "published task branch");
        Ok(outcome)
    }

    pub fn open_pull_request(&self, git: &Git, request: &PrRequest<'_>) -> Result<PrOutcome> {
        let slug = git
            .remote_url(&self.remote)?
            .as_deref()
            .and_then(parse_remote_url);

        if let (Some(slug), Some(token)) = (&slug, self.token()) {
            match self.via_api(slug, &token, request) {
                Ok(url) => return Ok(PrOutcome { url, via: PrTier::Api }),
                Err(err) => warn!(err = %err, "github api pull request failed"),
            }
        }

        match self.via_cli(git, request) {
            Ok(url) => return Ok(PrOutcome { url, via: PrTier::Cli }),
            Err(err) => warn!(err = %err, "gh pull request failed"),
        }

        match slug {
            Some(slug) => Ok(PrOutcome {
                url: compare_url(&slug, request.base, request.head),
                via: PrTier::CompareUrl,
            }),
            None => Err(anyhow!(
                "no pull request tier succeeded and remote '{}' is not a GitHub repository",
                self.remote
            )),
        }
    }

    fn token(&self) -> Option<String> {
        std::env::var(&self.config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }

    fn via_api(&self, slug: &RepoSlug, token: &str, request: &PrRequest<'_>) -> Result<String> {
        let url = format!(
            "{}/repos/{}/{}/pulls",
            self.config.api_base.trim_end_matches('/'),
            slug.owner,
            slug.repo
        );
        let payload = serde_json::json!({
            "title": request.title,
            "body": request.body,
            "head": request.head,
            "base": request.base,
        });
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(self.config.command_timeout()))
            .build()
            .new_agent();
        let mut response = agent
            .post(&url)
            .header("Authorization", &format!("Bearer {token}"))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("Content-Type", "application/json")
            .send(payload.to_string())
            .with_context(|| format!("POST {url}"))?;
        let text = response
            .body_mut()
            .read_to_string()
            .context("read pull request response")?;
        let created: CreatedPull =
            serde_json::from_str(&text).context("decode pull request response")?;
        Ok(created.html_url)
    }

    fn via_cli(&self, git: &Git, request: &PrRequest<'_>) -> Result<String> {
        let mut cmd = Command::new(&self.config.gh_program);
        cmd.args([
            "pr", "create", "--head", request.head, "--base", request.base, "--title",
            request.title, "--body", request.body,
        ])
        .current_dir(git.workdir());
        HelperCommand::new("gh pr create", cmd, self.config.command_timeout())
            .run()?
            .lines()
            .map(str::trim)
            .rfind(|l| l.starts_with("https://"))
            .map(str::to_string)
            .ok_or_else(|| anyhow!("gh pr create printed no url"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FileChangeType;
    use crate::io::workspace::{DiffFile, WorkspaceManager};
    use crate::test_support::{criterion, init_repo, task};

    #[test]
    fn parses_github_remotes() {
        let expected = Some(RepoSlug {
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
        });
        for url in [
            "https://github.com/acme/widgets.git",
            "https://github.com/acme/widgets",
            "https://token@github.com/acme/widgets.git",
            "git@github.com:acme/widgets.git",
            "ssh://git@github.com/acme/widgets.git",
        ] {
            assert_eq!(parse_remote_url(url), expected, "{url}");
        }
        assert_eq!(parse_remote_url("https://gitlab.com/acme/widgets.git"), None);
        assert_eq!(parse_remote_url("/srv/git/widgets.git"), None);
    }

    #[test]
    fn builds_compare_url() {
        let slug = RepoSlug {
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
        };
        assert_eq!(
            compare_url(&slug, "main", "task/7-demo"),
            "https://github.com/acme/widgets/compare/main...task/7-demo?expand=1"
        );
    }

    #[test]
    fn body_lists_criteria_and_stats() {
        let mut c = criterion("t1", "c1", 0);
        c.checked = true;
        let diff = WorkspaceDiff {
            files: vec![DiffFile {
                path: "a.rs".to_string(),
                change: FileChangeType::Created,
                insertions: 3,
                deletions: 0,
            }],
            insertions: 3,
            deletions: 0,
        };
        let body = pull_request_body(&task("t1", "p1"), &[c], &diff);
        assert!(body.contains("- [x] c1 holds"));
        assert!(body.contains("1 files changed, 3 insertions(+), 0 deletions(-)"));
    }

    #[test]
    fn publish_fails_when_push_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(temp.path());
        let manager = WorkspaceManager::new(temp.path().join("workspaces"), "origin");
        let ws = manager
            .acquire("t1", &repo, "task/t1", "main")
            .expect("acquire");
        std::fs::write(ws.path.join("new.txt"), "hello\n").expect("write");

        let err = Publisher::new(PublishConfig::default())
            .publish(&ws, "Add greeting", "body")
            .expect_err("no remote to push to");
        assert!(format!("{err:#}").contains("push task branch"));
        let log = crate::test_support::git(&ws.path, &["log", "--oneline", "-1"]);
        assert!(log.contains("Add greeting"));
    }

    /// A publisher that can reach neither the API nor `gh`.
    fn offline_publisher() -> Publisher {
        Publisher::new(PublishConfig {
            token_env: "ORCHESTRATOR_PR_TEST_TOKEN_UNSET".to_string(),
            gh_program: "/nonexistent/bin/gh".to_string(),
            ..PublishConfig::default()
        })
    }

    fn request() -> PrRequest<'static> {
        PrRequest {
            title: "Add greeting",
            body: "body",
            head: "task/t1",
            base: "main",
        }
    }

    #[test]
    fn falls_back_to_compare_url_for_github_remote() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(temp.path());
        crate::test_support::git(
            &repo,
            &["remote", "add", "origin", "https://github.com/acme/widgets.git"],
        );

        let outcome = offline_publisher()
            .open_pull_request(&Git::new(&repo), &request())
            .expect("compare url");
        assert_eq!(outcome.via, PrTier::CompareUrl);
        assert_eq!(
            outcome.url,
            "https://github.com/acme/widgets/compare/main...task/t1?expand=1"
        );
    }

    #[test]
    fn non_github_remote_without_cli_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(temp.path());
        crate::test_support::git(
            &repo,
            &["remote", "add", "origin", "https://gitlab.com/acme/widgets.git"],
        );

        let err = offline_publisher()
            .open_pull_request(&Git::new(&repo), &request())
            .expect_err("no tier left");
        assert!(err.to_string().contains("not a GitHub repository"), "{err}");
    }
}
