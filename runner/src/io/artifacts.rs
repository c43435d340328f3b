//! Goal/plan/rules artifact set and per-attempt context seeding.
//!
//! The supervisor never interprets artifact contents; it only guarantees
//! they exist and are loaded into every fresh attempt. Rollover reseeds
//! `.rlm/context/` from these persisted documents, never from the failed
//! attempt's transient state.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::io::init::RunnerPaths;

/// The named documents every worker session loads before acting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub goal: String,
    pub plan: String,
    pub rules: String,
}

/// Resolved paths of the per-attempt context directory.
#[derive(Debug, Clone)]
pub struct ContextPaths {
    pub dir: PathBuf,
    pub goal_path: PathBuf,
    pub plan_path: PathBuf,
    pub rules_path: PathBuf,
    pub failure_path: PathBuf,
}

impl ContextPaths {
    pub fn new(root: &Path) -> Self {
        let dir = RunnerPaths::new(root).context_dir;
        Self {
            goal_path: dir.join("goal.md"),
            plan_path: dir.join("plan.md"),
            rules_path: dir.join("rules.md"),
            failure_path: dir.join("failure.md"),
            dir,
        }
    }
}

/// Load the artifact set, failing with the missing file's path.
pub fn load_artifacts(root: &Path) -> Result<ArtifactSet> {
    let paths = RunnerPaths::new(root);
    Ok(ArtifactSet {
        goal: read_artifact(&paths.goal_path)?,
        plan: read_artifact(&paths.plan_path)?,
        rules: read_artifact(&paths.rules_path)?,
    })
}

fn read_artifact(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(anyhow!(
            "missing artifact {} (run `rlm-runner init` first)",
            path.display()
        ));
    }
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

/// Clear `.rlm/context/` and seed it for the next attempt.
///
/// `failure` carries the previous verification output excerpt on rollover;
/// everything else from the failed attempt is discarded.
pub fn write_attempt_context(
    root: &Path,
    artifacts: &ArtifactSet,
    failure: Option<&str>,
) -> Result<ContextPaths> {
    let paths = ContextPaths::new(root);
    clear_context_dir(&paths.dir)?;

    write_file(&paths.goal_path, &artifacts.goal)?;
    write_file(&paths.plan_path, &artifacts.plan)?;
    write_file(&paths.rules_path, &artifacts.rules)?;
    write_file(
        &paths.failure_path,
        &render_optional("Failure (verification output)", failure),
    )?;

    debug!(has_failure = failure.is_some(), "attempt context written");
    Ok(paths)
}

fn clear_context_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        debug!(dir = %dir.display(), "clearing context dir");
        fs::remove_dir_all(dir).with_context(|| format!("remove context dir {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("create context dir {}", dir.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn render_optional(title: &str, body: Option<&str>) -> String {
    let content = body
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("None.");
    format!("# {}\n\n{}\n", title, content)
}
