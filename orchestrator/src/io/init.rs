//! Layout of the orchestrator home directory (`.orchestrator/`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use super::config::{OrchestratorConfig, load_config, write_config};

/// All canonical paths within `.orchestrator/` for a home directory.
#[derive(Debug, Clone)]
pub struct OrchestratorPaths {
    pub root: PathBuf,
    pub home_dir: PathBuf,
    pub config_path: PathBuf,
    pub store_path: PathBuf,
    pub workspaces_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl OrchestratorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let home_dir = root.join(".orchestrator");
        Self {
            root: root.clone(),
            home_dir: home_dir.clone(),
            config_path: home_dir.join("config.toml"),
            store_path: home_dir.join("store.json"),
            workspaces_dir: home_dir.join("workspaces"),
            gitignore_path: home_dir.join(".gitignore"),
        }
    }

    /// Load config, falling back to defaults when the file is missing.
    pub fn load_config(&self) -> Result<OrchestratorConfig> {
        load_config(&self.config_path)
    }
}

/// Options for `init_home`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config with defaults.
    pub force: bool,
}

/// Create the home layout: config, workspaces dir and a `.gitignore` that
/// keeps orchestrator state out of the host repository.
pub fn init_home(root: &Path, options: &InitOptions) -> Result<OrchestratorPaths> {
    let paths = OrchestratorPaths::new(root);
    fs::create_dir_all(&paths.workspaces_dir)
        .with_context(|| format!("create {}", paths.workspaces_dir.display()))?;

    if options.force || !paths.config_path.exists() {
        debug!(path = %paths.config_path.display(), "writing default config");
        write_config(&paths.config_path, &OrchestratorConfig::default())?;
    }
    if !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, "*\n")
            .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    }
    Ok(paths)
}
