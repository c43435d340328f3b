//! Workspace layout under `.rlm/` and `rlm-runner init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::io::config::{RunnerConfig, write_config};
use crate::io::control::{ControlFlags, write_control};

const GOAL_STUB: &str = "# Goal\n\nDescribe the goal the worker must reach.\n";
const PLAN_STUB: &str = "# Plan\n\nOutline the steps the worker should follow.\n";
const RULES_STUB: &str = "# Rules\n\nConstraints every attempt must respect.\n";

/// Resolved paths for everything the runner persists under a root.
#[derive(Debug, Clone)]
pub struct RunnerPaths {
    pub rlm_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub supervisor_path: PathBuf,
    pub control_path: PathBuf,
    pub questions_path: PathBuf,
    pub session_path: PathBuf,
    pub context_dir: PathBuf,
    pub chunks_dir: PathBuf,
    pub attempts_dir: PathBuf,
    pub goal_path: PathBuf,
    pub plan_path: PathBuf,
    pub rules_path: PathBuf,
}

impl RunnerPaths {
    pub fn new(root: &Path) -> Self {
        let rlm_dir = root.join(".rlm");
        let state_dir = rlm_dir.join("state");
        Self {
            config_path: state_dir.join("config.toml"),
            supervisor_path: state_dir.join("supervisor.json"),
            control_path: state_dir.join("control.json"),
            questions_path: state_dir.join("questions.json"),
            session_path: state_dir.join("session.json"),
            context_dir: rlm_dir.join("context"),
            chunks_dir: rlm_dir.join("chunks"),
            attempts_dir: rlm_dir.join("attempts"),
            goal_path: rlm_dir.join("GOAL.md"),
            plan_path: rlm_dir.join("PLAN.md"),
            rules_path: rlm_dir.join("RULES.md"),
            state_dir,
            rlm_dir,
        }
    }

    /// Per-attempt artifact directory.
    pub fn attempt_dir(&self, seq: u32) -> PathBuf {
        self.attempts_dir.join(seq.to_string())
    }
}

/// Options for `init`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Overwrite existing files.
    pub force: bool,
}

/// Create the `.rlm/` layout: artifact stubs, default config, control flags.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<RunnerPaths> {
    let paths = RunnerPaths::new(root);
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create {}", paths.state_dir.display()))?;
    fs::create_dir_all(&paths.attempts_dir)
        .with_context(|| format!("create {}", paths.attempts_dir.display()))?;

    write_if_missing_or_force(&paths.goal_path, GOAL_STUB, options.force)?;
    write_if_missing_or_force(&paths.plan_path, PLAN_STUB, options.force)?;
    write_if_missing_or_force(&paths.rules_path, RULES_STUB, options.force)?;

    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &RunnerConfig::default())?;
    }
    if options.force || !paths.control_path.exists() {
        write_control(&paths.control_path, &ControlFlags::default())?;
    }
    Ok(paths)
}

fn write_if_missing_or_force(path: &Path, contents: &str, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Ok(());
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
