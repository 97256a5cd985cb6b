//! Command-line front end for the session orchestrator.
//!
//! State lives under `<home>/.orchestrator/`: `config.toml`, the JSON store
//! and the task workspaces. The long-running HTTP surface is the separate
//! `orchestrator-server` binary; this CLI drives one session at a time and
//! performs maintenance.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use orchestrator::core::types::{ContextKey, ContextType, SessionStatus};
use orchestrator::dependencies;
use orchestrator::exit_codes;
use orchestrator::io::init::{InitOptions, OrchestratorPaths, init_home};
use orchestrator::io::store::{LocalStore, Store};
use orchestrator::session::events::EventKind;
use orchestrator::{OrchestratorError, SpawnOptions, Supervisor};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Supervise coding-agent sessions against a task board"
)]
struct Cli {
    /// Directory containing `.orchestrator/` (defaults to the current directory).
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.orchestrator/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a session, stream its output to stdout and wait for it to finish.
    Run {
        context_type: ContextType,
        context_id: String,
        /// Worker command overriding the configured one.
        #[arg(long, num_args = 1.., allow_hyphen_values = true)]
        command: Option<Vec<String>>,
    },
    /// Repair state after a crash; with `--abandoned`, also release idle workspaces.
    Sweep {
        #[arg(long)]
        abandoned: bool,
    },
    /// Manage task dependencies.
    Deps {
        #[command(subcommand)]
        action: DepsAction,
    },
    /// Print a task's state document.
    Ledger { task_id: String },
    /// List active sessions, or the history of one context.
    Sessions {
        context_type: Option<ContextType>,
        context_id: Option<String>,
    },
    /// Approve a task waiting for review.
    Approve { task_id: String },
}

#[derive(Subcommand)]
enum DepsAction {
    /// `task_id` depends on `depends_on`.
    Add { task_id: String, depends_on: String },
    Remove { task_id: String, depends_on: String },
    /// Print dependencies and dependents of a task.
    List { task_id: String },
}

#[tokio::main]
async fn main() {
    orchestrator::logging::init();
    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<OrchestratorError>() {
        Some(OrchestratorError::NotFound { .. }) => exit_codes::NOT_FOUND,
        _ => exit_codes::INVALID,
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let home = match cli.home {
        Some(home) => home,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    if let Command::Init { force } = cli.command {
        let paths = init_home(&home, &InitOptions { force })?;
        println!("{}", paths.home_dir.display());
        return Ok(exit_codes::OK);
    }

    let paths = OrchestratorPaths::new(&home);
    let config = paths.load_config()?;
    let store = Arc::new(LocalStore::open(&paths.store_path)?);
    let supervisor = Supervisor::new(store.clone(), config, &paths.workspaces_dir);

    match cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Run {
            context_type,
            context_id,
            command,
        } => cmd_run(&supervisor, ContextKey::new(context_type, context_id), command).await,
        Command::Sweep { abandoned } => {
            let mut report = supervisor.startup_sweep().await?;
            if abandoned {
                report.released = supervisor.sweep_abandoned(Utc::now()).await?.released;
            }
            print_json(&report)?;
            Ok(exit_codes::OK)
        }
        Command::Deps { action } => cmd_deps(store.as_ref(), action),
        Command::Ledger { task_id } => {
            let task = store
                .task(&task_id)?
                .ok_or_else(|| OrchestratorError::not_found("task", &task_id))?;
            let ledger = dependencies::ledger_for(store.as_ref(), &task, &supervisor.config().ledger)?;
            let record = ledger
                .read(&task_id)?
                .with_context(|| format!("no state document for task {task_id}"))?;
            print_json(&record)?;
            Ok(exit_codes::OK)
        }
        Command::Sessions {
            context_type,
            context_id,
        } => {
            let records = match (context_type, context_id) {
                (Some(context_type), Some(context_id)) => {
                    supervisor.history(&ContextKey::new(context_type, context_id))?
                }
                (None, None) => store.sessions_with_status(&SessionStatus::ACTIVE)?,
                _ => anyhow::bail!("pass both a context type and an id, or neither"),
            };
            print_json(&records)?;
            Ok(exit_codes::OK)
        }
        Command::Approve { task_id } => {
            let outcome = supervisor.approve(&task_id).await?;
            print_json(&outcome)?;
            Ok(exit_codes::OK)
        }
    }
}

/// Stream one session to stdout; worker output goes to stdout, events to stderr.
async fn cmd_run(supervisor: &Supervisor, key: ContextKey, command: Option<Vec<String>>) -> Result<i32> {
    let mut events = supervisor.subscribe();
    let record = supervisor.spawn(key.clone(), SpawnOptions { command }).await?;
    let awaits_completion = key.task_id().is_some();
    let mut exit_status = None;
    let mut stdout = std::io::stdout();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                eprintln!("[orchestrator] skipped {skipped} events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if event.session_id != record.id {
            continue;
        }
        match event.kind {
            EventKind::Output { data } => {
                stdout.write_all(data.as_bytes()).context("write output")?;
                stdout.flush().context("flush output")?;
            }
            EventKind::Exit { code, status } => {
                eprintln!("[orchestrator] worker exited: status={status} code={code:?}");
                exit_status = Some(status);
                if !awaits_completion {
                    break;
                }
            }
            EventKind::Completion {
                task_status,
                action,
                pull_request,
            } => {
                eprintln!("[orchestrator] task {task_status} ({action:?})");
                if let Some(pr) = pull_request {
                    eprintln!("[orchestrator] pull request: {}", pr.url);
                }
                break;
            }
            EventKind::CompletionError { message } => {
                eprintln!("[orchestrator] completion failed: {message}");
                break;
            }
            EventKind::Progress { value, applied: true } => {
                eprintln!("[orchestrator] progress {value}%");
            }
            _ => {}
        }
    }

    Ok(match exit_status {
        Some(SessionStatus::Completed) => exit_codes::OK,
        _ => exit_codes::WORKER_FAILED,
    })
}

fn cmd_deps(store: &dyn Store, action: DepsAction) -> Result<i32> {
    match action {
        DepsAction::Add {
            task_id,
            depends_on,
        } => dependencies::add_dependency(store, &task_id, &depends_on)?,
        DepsAction::Remove {
            task_id,
            depends_on,
        } => {
            if !dependencies::remove_dependency(store, &task_id, &depends_on)? {
                eprintln!("no dependency {task_id} -> {depends_on}");
                return Ok(exit_codes::NOT_FOUND);
            }
        }
        DepsAction::List { task_id } => {
            #[derive(Serialize)]
            struct Listing {
                dependencies: Vec<orchestrator::model::Task>,
                dependents: Vec<orchestrator::model::Task>,
            }
            print_json(&Listing {
                dependencies: dependencies::dependencies(store, &task_id)?,
                dependents: dependencies::dependents(store, &task_id)?,
            })?;
        }
    }
    Ok(exit_codes::OK)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_command_override() {
        let cli = Cli::parse_from([
            "orchestrator",
            "run",
            "task",
            "t1",
            "--command",
            "sh",
            "-c",
            "echo hi",
        ]);
        match cli.command {
            Command::Run {
                context_type,
                context_id,
                command,
            } => {
                assert_eq!(context_type, ContextType::Task);
                assert_eq!(context_id, "t1");
                assert_eq!(
                    command,
                    Some(vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()])
                );
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_deps_add() {
        let cli = Cli::parse_from(["orchestrator", "--home", "/tmp/h", "deps", "add", "a", "b"]);
        assert_eq!(cli.home, Some(PathBuf::from("/tmp/h")));
        assert!(matches!(
            cli.command,
            Command::Deps {
                action: DepsAction::Add { .. }
            }
        ));
    }

    #[test]
    fn rejects_unknown_context_type() {
        assert!(Cli::try_parse_from(["orchestrator", "run", "story", "s1"]).is_err());
    }

    #[test]
    fn not_found_maps_to_exit_code() {
        let err = anyhow::Error::new(OrchestratorError::not_found("task", "t1"));
        assert_eq!(exit_code_for(&err), exit_codes::NOT_FOUND);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), exit_codes::INVALID);
    }
}
