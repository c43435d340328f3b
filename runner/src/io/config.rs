//! Runner configuration stored under `.rlm/state/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Runner configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Hard cap on attempts per goal.
    pub max_attempts: u32,

    /// Stall-detection window: an attempt with no output activity for this
    /// long is killed and rolled over.
    pub heartbeat_minutes: u64,

    /// Wall-clock bound on one verification gate run.
    pub verify_timeout_minutes: u64,

    /// Concurrency cap of the sub-agent pool within one attempt.
    pub max_sub_agents: usize,

    /// Transcript line count beyond which the oldest lines are archived.
    pub max_conversation_lines: usize,

    /// Archive files kept by conversation trimming.
    pub conversation_archive_count: usize,

    /// Largest line span one session `peek` may return.
    pub max_slice_lines: usize,

    /// Reads above this many lines require a prior search step.
    pub search_required_threshold_lines: usize,

    /// When true, destructive session operations are rejected until the
    /// goal/plan/rules artifacts are loaded.
    pub gate_destructive_tools_until_context_loaded: bool,

    /// Chunk planning for the analysis read path.
    pub chunk_size_bytes: usize,
    pub chunk_overlap_bytes: usize,

    /// Per-chunk sub-worker timeout.
    pub dispatch_timeout_secs: u64,

    /// Truncate captured process output beyond this many bytes.
    pub output_limit_bytes: usize,

    pub worker: WorkerConfig,
    pub verify: VerifyConfig,
    pub analyzer: AnalyzerConfig,
}

/// Attempt worker invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Command to execute for one attempt (e.g. `["opencode","run"]`).
    pub command: Vec<String>,
}

/// Verification gate invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Command to execute for the gate (e.g. `["just","ci"]`).
    pub command: Vec<String>,
    /// Working directory for the gate, relative to the root when not absolute.
    pub workdir: Option<String>,
}

/// Sub-worker invocation for chunk analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub command: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec!["opencode".to_string(), "run".to_string()],
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: vec!["just".to_string(), "ci".to_string()],
            workdir: None,
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "opencode".to_string(),
                "run".to_string(),
                "--agent".to_string(),
                "chunk-analyzer".to_string(),
            ],
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            heartbeat_minutes: 10,
            verify_timeout_minutes: 30,
            max_sub_agents: 4,
            max_conversation_lines: 2000,
            conversation_archive_count: 3,
            max_slice_lines: 400,
            search_required_threshold_lines: 120,
            gate_destructive_tools_until_context_loaded: true,
            chunk_size_bytes: 200_000,
            chunk_overlap_bytes: 0,
            dispatch_timeout_secs: 300,
            output_limit_bytes: 100_000,
            worker: WorkerConfig::default(),
            verify: VerifyConfig::default(),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.heartbeat_minutes == 0 {
            return Err(anyhow!("heartbeat_minutes must be > 0"));
        }
        if self.verify_timeout_minutes == 0 {
            return Err(anyhow!("verify_timeout_minutes must be > 0"));
        }
        if self.max_sub_agents == 0 {
            return Err(anyhow!("max_sub_agents must be > 0"));
        }
        if self.max_conversation_lines == 0 {
            return Err(anyhow!("max_conversation_lines must be > 0"));
        }
        if self.chunk_size_bytes == 0 {
            return Err(anyhow!("chunk_size_bytes must be > 0"));
        }
        if self.chunk_overlap_bytes >= self.chunk_size_bytes {
            return Err(anyhow!("chunk_overlap_bytes must be smaller than chunk_size_bytes"));
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(anyhow!("dispatch_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        for (name, command) in [
            ("worker.command", &self.worker.command),
            ("verify.command", &self.verify.command),
            ("analyzer.command", &self.analyzer.command),
        ] {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!("{name} must be a non-empty array"));
            }
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_minutes * 60)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_minutes * 60)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = RunnerConfig::default();
        cfg.max_attempts = 3;
        cfg.verify.command = vec!["sh".to_string(), "check.sh".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn validate_rejects_zero_heartbeat() {
        let cfg = RunnerConfig {
            heartbeat_minutes: 0,
            ..RunnerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_verify_command() {
        let mut cfg = RunnerConfig::default();
        cfg.verify.command.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_overlap_at_chunk_size() {
        let cfg = RunnerConfig {
            chunk_size_bytes: 100,
            chunk_overlap_bytes: 100,
            ..RunnerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
