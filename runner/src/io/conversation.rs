//! Session transcript with bounded size.
//!
//! When the line count exceeds the configured cap, the oldest lines beyond
//! a retained window are rotated into numbered archive files instead of
//! being discarded, preserving auditability. At most `archive_count`
//! archives are kept; beyond that the oldest archive is pruned.

use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Append-only transcript log with rotation.
#[derive(Debug)]
pub struct ConversationLog {
    path: PathBuf,
    archive_dir: PathBuf,
    max_lines: usize,
    archive_count: usize,
    lines: usize,
    archives_written: u32,
}

impl ConversationLog {
    /// Open (or create) the transcript at `path`, archiving under
    /// `archive_dir`.
    pub fn open(
        path: &Path,
        archive_dir: &Path,
        max_lines: usize,
        archive_count: usize,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create transcript dir {}", parent.display()))?;
        }
        let lines = if path.exists() {
            fs::read_to_string(path)
                .with_context(|| format!("read transcript {}", path.display()))?
                .lines()
                .count()
        } else {
            fs::write(path, "").with_context(|| format!("create transcript {}", path.display()))?;
            0
        };
        let archives_written = existing_archives(archive_dir)?.len() as u32;
        Ok(Self {
            path: path.to_path_buf(),
            archive_dir: archive_dir.to_path_buf(),
            max_lines,
            archive_count,
            lines,
            archives_written,
        })
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Archive files currently on disk.
    pub fn archives(&self) -> Result<usize> {
        Ok(existing_archives(&self.archive_dir)?.len())
    }

    /// Append one line and rotate if the cap is exceeded.
    pub fn append_line(&mut self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open transcript {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("append transcript {}", self.path.display()))?;
        self.lines += 1;

        if self.lines > self.max_lines {
            self.rotate()?;
        }
        Ok(())
    }

    /// Move everything but the retained tail window into a new archive.
    fn rotate(&mut self) -> Result<()> {
        let retained = self.max_lines / 2;
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read transcript {}", self.path.display()))?;
        let all: Vec<&str> = contents.lines().collect();
        if all.len() <= retained {
            return Ok(());
        }
        let split = all.len() - retained;
        let (old, tail) = all.split_at(split);

        fs::create_dir_all(&self.archive_dir)
            .with_context(|| format!("create archive dir {}", self.archive_dir.display()))?;
        self.archives_written += 1;
        let archive_path = self
            .archive_dir
            .join(format!("transcript.{:04}.log", self.archives_written));
        let mut buf = old.join("\n");
        buf.push('\n');
        fs::write(&archive_path, buf)
            .with_context(|| format!("write archive {}", archive_path.display()))?;

        let mut buf = tail.join("\n");
        if !buf.is_empty() {
            buf.push('\n');
        }
        fs::write(&self.path, buf)
            .with_context(|| format!("rewrite transcript {}", self.path.display()))?;
        self.lines = tail.len();

        self.prune_archives()?;
        debug!(
            archived = old.len(),
            retained = tail.len(),
            archive = %archive_path.display(),
            "rotated transcript"
        );
        Ok(())
    }

    fn prune_archives(&self) -> Result<()> {
        let mut archives = existing_archives(&self.archive_dir)?;
        while archives.len() > self.archive_count {
            let oldest = archives.remove(0);
            fs::remove_file(&oldest)
                .with_context(|| format!("prune archive {}", oldest.display()))?;
        }
        Ok(())
    }
}

fn existing_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut archives: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("read archive dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("transcript.") && n.ends_with(".log"))
        })
        .collect();
    archives.sort();
    Ok(archives)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(temp: &Path, max_lines: usize, archive_count: usize) -> ConversationLog {
        ConversationLog::open(
            &temp.join("transcript.log"),
            &temp.join("archives"),
            max_lines,
            archive_count,
        )
        .expect("open")
    }

    #[test]
    fn rotation_archives_rather_than_discards() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut log = log(temp.path(), 10, 3);
        for i in 0..11 {
            log.append_line(&format!("line {i}")).expect("append");
        }

        // 11 > 10 triggered one rotation; retained window is 5 lines.
        assert_eq!(log.lines(), 5);
        assert_eq!(log.archives().expect("archives"), 1);
        let archived = fs::read_to_string(temp.path().join("archives/transcript.0001.log"))
            .expect("read archive");
        assert!(archived.contains("line 0"));
        let current =
            fs::read_to_string(temp.path().join("transcript.log")).expect("read current");
        assert!(current.contains("line 10"));
        assert!(!current.contains("line 0"));
    }

    #[test]
    fn archive_count_is_bounded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut log = log(temp.path(), 4, 2);
        for i in 0..40 {
            log.append_line(&format!("line {i}")).expect("append");
        }
        assert!(log.archives().expect("archives") <= 2);
        // Newest archive survives pruning.
        let archives = existing_archives(&temp.path().join("archives")).expect("list");
        assert!(!archives.is_empty());
    }

    #[test]
    fn reopen_counts_existing_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let mut log = log(temp.path(), 100, 2);
            log.append_line("one").expect("append");
            log.append_line("two").expect("append");
        }
        let log = log(temp.path(), 100, 2);
        assert_eq!(log.lines(), 2);
    }
}
