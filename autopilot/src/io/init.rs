//! Canonical `.autopilot/` layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{AutopilotConfig, write_config};

const AUTOPILOT_GITIGNORE: &str = "runs/\nscratch/\nartifacts/\nstate/\n";

/// All canonical paths within `.autopilot/` for a workspace root.
#[derive(Debug, Clone)]
pub struct AutopilotPaths {
    pub root: PathBuf,
    pub autopilot_dir: PathBuf,
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub loop_state_path: PathBuf,
}

impl AutopilotPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let autopilot_dir = root.join(".autopilot");
        let state_dir = autopilot_dir.join("state");
        Self {
            root: root.clone(),
            autopilot_dir: autopilot_dir.clone(),
            state_dir: state_dir.clone(),
            runs_dir: autopilot_dir.join("runs"),
            scratch_dir: autopilot_dir.join("scratch"),
            artifacts_dir: autopilot_dir.join("artifacts"),
            gitignore_path: autopilot_dir.join(".gitignore"),
            config_path: autopilot_dir.join("config.toml"),
            loop_state_path: state_dir.join("loop_state.json"),
        }
    }

    /// Directory holding the event log for one run.
    pub fn run_dir(&self, run_id: u64) -> PathBuf {
        self.runs_dir.join(run_id.to_string())
    }
}

/// Options for `init_autopilot`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite the existing config.
    pub force: bool,
}

/// Create `.autopilot/` scaffolding with a default config in `root`.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_autopilot(root: &Path, options: &InitOptions) -> Result<AutopilotPaths> {
    let paths = AutopilotPaths::new(root);
    if paths.autopilot_dir.exists() && !paths.autopilot_dir.is_dir() {
        return Err(anyhow!(
            "autopilot init: .autopilot exists but is not a directory"
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "autopilot init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    for dir in [
        &paths.autopilot_dir,
        &paths.state_dir,
        &paths.runs_dir,
        &paths.scratch_dir,
        &paths.artifacts_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    fs::write(&paths.gitignore_path, AUTOPILOT_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &AutopilotConfig::default())?;

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_layout_and_default_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_autopilot(temp.path(), &InitOptions { force: false }).expect("init");
        assert!(paths.state_dir.is_dir());
        assert!(paths.scratch_dir.is_dir());
        assert!(paths.gitignore_path.is_file());
        let cfg = load_config(&paths.config_path).expect("load");
        assert_eq!(cfg, AutopilotConfig::default());
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_autopilot(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_autopilot(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        init_autopilot(temp.path(), &InitOptions { force: true }).expect("force init");
    }
}
