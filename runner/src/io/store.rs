//! Context store: loads a source (file or directory tree) into an
//! offset-indexed blob that answers slice and search queries without
//! re-reading the source.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, warn};

/// Raised when the source cannot be opened. Fatal to the analysis request,
/// not to the supervisor.
#[derive(Debug, Clone)]
pub struct SourceUnreadableError {
    pub path: PathBuf,
    pub detail: String,
}

impl fmt::Display for SourceUnreadableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source unreadable {}: {}", self.path.display(), self.detail)
    }
}

impl std::error::Error for SourceUnreadableError {}

/// Raised when a slice falls outside `[0, size]`. A contract error,
/// surfaced immediately.
#[derive(Debug, Clone, Copy)]
pub struct RangeOutOfBoundsError {
    pub start: usize,
    pub end: usize,
    pub size: usize,
}

impl fmt::Display for RangeOutOfBoundsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "range [{}, {}) out of bounds for blob of {} bytes",
            self.start, self.end, self.size
        )
    }
}

impl std::error::Error for RangeOutOfBoundsError {}

/// One file merged into a directory-tree blob, with its byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub start: usize,
    pub end: usize,
}

/// A search hit in offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub offset: usize,
    pub text: String,
    /// 1-indexed line number.
    pub line: usize,
}

/// One loaded source. Immutable after load; discarded with the session.
#[derive(Debug, Clone)]
pub struct ContextBlob {
    source: PathBuf,
    text: String,
    files: Vec<SourceFile>,
    /// Byte offset of the start of each line.
    line_starts: Vec<usize>,
}

impl ContextBlob {
    /// Load a file, or a directory tree merged file-by-file in sorted path
    /// order with a header line per file.
    pub fn load(source: &Path) -> Result<Self> {
        let meta = fs::metadata(source).map_err(|e| {
            anyhow!(SourceUnreadableError {
                path: source.to_path_buf(),
                detail: e.to_string(),
            })
        })?;

        let (text, files) = if meta.is_dir() {
            load_tree(source)?
        } else {
            let text = read_text(source)?;
            let end = text.len();
            (
                text,
                vec![SourceFile {
                    path: source.to_path_buf(),
                    start: 0,
                    end,
                }],
            )
        };

        let line_starts = index_lines(&text);
        debug!(
            source = %source.display(),
            bytes = text.len(),
            files = files.len(),
            lines = line_starts.len(),
            "loaded context blob"
        );
        Ok(Self {
            source: source.to_path_buf(),
            text,
            files,
            line_starts,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn size(&self) -> usize {
        self.text.len()
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Slice by byte range. Offsets outside `[0, size]` (or splitting a
    /// UTF-8 code point) are a contract violation.
    pub fn slice(&self, start: usize, end: usize) -> Result<&str> {
        if start > end || end > self.text.len() {
            return Err(anyhow!(RangeOutOfBoundsError {
                start,
                end,
                size: self.text.len(),
            }));
        }
        self.text.get(start..end).ok_or_else(|| {
            anyhow!(RangeOutOfBoundsError {
                start,
                end,
                size: self.text.len(),
            })
        })
    }

    /// Slice with both endpoints floored to UTF-8 boundaries. Used by chunk
    /// materialization, where planned byte offsets may split a code point.
    pub fn slice_lossy(&self, start: usize, end: usize) -> (usize, usize, &str) {
        let start = floor_char_boundary(&self.text, start.min(self.text.len()));
        let end = floor_char_boundary(&self.text, end.min(self.text.len()));
        (start, end, &self.text[start..end])
    }

    /// Lazy search: yields at most `max_matches` hits in offset order. The
    /// caller may stop early without scanning the rest of the blob.
    pub fn search<'a>(
        &'a self,
        pattern: &'a Regex,
        max_matches: usize,
    ) -> impl Iterator<Item = SearchMatch> + 'a {
        pattern
            .find_iter(&self.text)
            .take(max_matches)
            .map(|m| SearchMatch {
                offset: m.start(),
                text: m.as_str().to_string(),
                line: self.line_of_offset(m.start()),
            })
    }

    /// 1-indexed line containing `offset`.
    pub fn line_of_offset(&self, offset: usize) -> usize {
        match self.line_starts.binary_search(&offset) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        }
    }

    /// Byte range covering 1-indexed lines `[first, last]`, clamped to the
    /// blob end.
    pub fn line_range(&self, first: usize, last: usize) -> Result<(usize, usize)> {
        if first == 0 || first > last || first > self.line_starts.len() {
            return Err(anyhow!(
                "invalid line range {first}..={last} (blob has {} lines)",
                self.line_starts.len()
            ));
        }
        let start = self.line_starts[first - 1];
        let end = self
            .line_starts
            .get(last)
            .copied()
            .unwrap_or(self.text.len());
        Ok((start, end))
    }
}

fn read_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| {
        anyhow!(SourceUnreadableError {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn load_tree(root: &Path) -> Result<(String, Vec<SourceFile>)> {
    let mut paths = Vec::new();
    collect_files(root, &mut paths)?;
    paths.sort();

    let mut text = String::new();
    let mut files = Vec::new();
    for path in paths {
        let start = text.len();
        let rel = path.strip_prefix(root).unwrap_or(&path);
        text.push_str(&format!("==== {} ====\n", rel.display()));
        match read_text(&path) {
            Ok(contents) => {
                text.push_str(&contents);
                if !text.ends_with('\n') {
                    text.push('\n');
                }
            }
            Err(err) => {
                // A single unreadable file does not fail the whole tree.
                warn!(path = %path.display(), err = %err, "skipping unreadable file");
                text.push_str("(unreadable)\n");
            }
        }
        files.push(SourceFile {
            path,
            start,
            end: text.len(),
        });
    }
    Ok((text, files))
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| {
        anyhow!(SourceUnreadableError {
            path: dir.to_path_buf(),
            detail: e.to_string(),
        })
    })?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read dir entry in {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("file type of {}", path.display()))?;
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn index_lines(text: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    if text.is_empty() {
        return starts;
    }
    starts.push(0);
    for (idx, byte) in text.bytes().enumerate() {
        if byte == b'\n' && idx + 1 < text.len() {
            starts.push(idx + 1);
        }
    }
    starts
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
