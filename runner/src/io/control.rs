//! Operator control flags polled by the supervisor loop.
//!
//! `pause`/`resume`/`stop` from the CLI write this file; the loop reads it
//! between scheduling decisions and before each heartbeat tick.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Desired control state (`.rlm/state/control.json`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControlFlags {
    /// Block scheduling of the next attempt. In-flight work continues.
    pub paused: bool,
    /// Abort the run; in-flight verification is cancelled.
    pub stop: bool,
}

/// Load control flags. A missing file means no operator requests.
pub fn load_control(path: &Path) -> Result<ControlFlags> {
    if !path.exists() {
        return Ok(ControlFlags::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read control {}", path.display()))?;
    let flags: ControlFlags = serde_json::from_str(&contents)
        .with_context(|| format!("parse control {}", path.display()))?;
    Ok(flags)
}

/// Atomically write control flags (temp file + rename).
pub fn write_control(path: &Path, flags: &ControlFlags) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("control path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(flags)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp control {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace control {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_defaults_to_no_requests() {
        let temp = tempfile::tempdir().expect("tempdir");
        let flags = load_control(&temp.path().join("missing.json")).expect("load");
        assert_eq!(flags, ControlFlags::default());
    }

    #[test]
    fn flags_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("control.json");
        let flags = ControlFlags {
            paused: true,
            stop: false,
        };
        write_control(&path, &flags).expect("write");
        assert_eq!(load_control(&path).expect("load"), flags);
    }
}
