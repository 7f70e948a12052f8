//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! reduce duplicated `create_dir_all` / parent-directory checks.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::{Error, Result};

/// Upper bound on bytes read from the end of a file by [`read_tail`].
const TAIL_READ_LIMIT: u64 = 256 * 1024;

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure the parent directory of a file path exists with a custom operation label.
pub async fn ensure_parent_dir_with_op(op: &'static str, path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all_with_op(op, parent).await
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Read the last `max_lines` lines of a text file.
///
/// Only the final 256 KiB are inspected, so a huge crawl log never gets loaded
/// whole. Invalid UTF-8 is replaced rather than rejected.
pub async fn read_tail(path: &Path, max_lines: usize) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_error("opening log", path, e))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| io_error("reading log metadata", path, e))?
        .len();

    let start = len.saturating_sub(TAIL_READ_LIMIT);
    file.seek(SeekFrom::Start(start))
        .await
        .map_err(|e| io_error("seeking log", path, e))?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)
        .await
        .map_err(|e| io_error("reading log", path, e))?;

    let text = String::from_utf8_lossy(&buf);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(max_lines);
    Ok(lines[skip..].join("\n"))
}

/// Keep at most `max_chars` characters from the end of `text`.
pub fn truncate_tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let byte_idx = text
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[byte_idx..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        let content: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        tokio::fs::write(&path, content).await.unwrap();

        let tail = read_tail(&path, 3).await.unwrap();
        assert_eq!(tail, "line 8\nline 9\nline 10");
    }

    #[tokio::test]
    async fn read_tail_missing_file_reports_path() {
        let err = read_tail(Path::new("/definitely/not/here.log"), 5)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("here.log"));
    }

    #[test]
    fn truncate_tail_is_char_safe() {
        assert_eq!(truncate_tail("héllo wörld", 5), "wörld");
        assert_eq!(truncate_tail("short", 10), "short");
    }
}
