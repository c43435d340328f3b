//! Chunk materialization: writes planned ranges as independently
//! addressable files so dispatch can reference chunks by handle instead of
//! re-slicing the blob.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::chunk::ChunkRange;
use crate::io::store::ContextBlob;

/// An addressable, materialized chunk. Read-only once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHandle {
    pub id: u32,
    /// Effective byte range after UTF-8 boundary flooring.
    pub start: usize,
    pub end: usize,
    pub path: PathBuf,
}

/// Write each planned range under `dir` as `chunk_NNNN.txt`.
///
/// The directory is cleared first so stale chunks from a previous query
/// cannot be addressed by mistake.
pub fn materialize(blob: &ContextBlob, ranges: &[ChunkRange], dir: &Path) -> Result<Vec<ChunkHandle>> {
    clear_dir(dir)?;

    let mut handles = Vec::with_capacity(ranges.len());
    for range in ranges {
        let (start, end, text) = blob.slice_lossy(range.start, range.end);
        let path = dir.join(format!("chunk_{:04}.txt", range.id));
        fs::write(&path, text).with_context(|| format!("write chunk {}", path.display()))?;
        handles.push(ChunkHandle {
            id: range.id,
            start,
            end,
            path,
        });
    }
    debug!(dir = %dir.display(), chunks = handles.len(), "materialized chunks");
    Ok(handles)
}

fn clear_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("remove chunk dir {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("create chunk dir {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunk::plan_chunks;

    #[test]
    fn materialize_writes_one_file_per_chunk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("src.txt");
        fs::write(&source, "a".repeat(250)).expect("write");
        let blob = ContextBlob::load(&source).expect("load");
        let ranges = plan_chunks(blob.size(), 100, 0).expect("plan");

        let dir = temp.path().join("chunks");
        let handles = materialize(&blob, &ranges, &dir).expect("materialize");

        assert_eq!(handles.len(), 3);
        for handle in &handles {
            let contents = fs::read_to_string(&handle.path).expect("read chunk");
            assert_eq!(contents.len(), handle.end - handle.start);
        }
        assert_eq!(handles[2].end - handles[2].start, 50);
    }

    #[test]
    fn materialize_clears_stale_chunks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("src.txt");
        fs::write(&source, "abc").expect("write");
        let blob = ContextBlob::load(&source).expect("load");
        let dir = temp.path().join("chunks");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("chunk_9999.txt"), "stale").expect("stale");

        let ranges = plan_chunks(blob.size(), 10, 0).expect("plan");
        materialize(&blob, &ranges, &dir).expect("materialize");

        assert!(!dir.join("chunk_9999.txt").exists());
        assert!(dir.join("chunk_0000.txt").exists());
    }
}
