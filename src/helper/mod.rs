//! Host-side file and process helpers.
//!
//! These functions back the local sandbox and are also exposed through the
//! hidden `sbx helper` subcommands, which follow an argument-vector calling
//! convention:
//!
//! ```text
//! sbx helper read <path> [--encoding E] [--offset N] [--limit N]   stdout = content
//! sbx helper write <path> [--encoding E]                           stdin  = content
//! sbx helper readdir <path> <offset> [limit] [--recursive]         stdout = listing lines
//! sbx helper exec --dir D --limit N [--cwd C] -- <command> [args]  detached supervisor
//! ```

pub mod supervise;

use std::io::ErrorKind;
use std::path::Path;

use tracing::{trace, warn};
use walkdir::WalkDir;

use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::listing::ListingRecord;
use crate::sandbox::{FileContent, ReadOptions, content};

/// Returns true for errors that mean "the target is not there".
#[must_use]
pub fn is_absent(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::NotFound | ErrorKind::NotADirectory)
}

/// Reads a file, returning `None` when it does not exist.
///
/// # Errors
///
/// Returns `SandboxError::Io` for any failure other than absence.
pub async fn read_file(path: &Path, options: &ReadOptions) -> SandboxResult<Option<FileContent>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            trace!(path = %path.display(), bytes = bytes.len(), "read file");
            Ok(Some(content::encode(&bytes, options)))
        }
        Err(e) if is_absent(e.kind()) => Ok(None),
        Err(e) => Err(SandboxError::io("read file", path.display().to_string(), e)),
    }
}

/// Writes raw bytes, creating parent directories as needed.
///
/// # Errors
///
/// Returns `SandboxError::Io` naming the path that failed.
pub async fn write_file(path: &Path, bytes: &[u8]) -> SandboxResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SandboxError::io("create directory", parent.display().to_string(), e))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| SandboxError::io("write file", path.display().to_string(), e))
}

/// Deletes a file; a missing file is not an error.
///
/// # Errors
///
/// Returns `SandboxError::Io` for any failure other than absence.
pub async fn delete_file(path: &Path) -> SandboxResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if is_absent(e.kind()) => Ok(()),
        Err(e) => Err(SandboxError::io("delete file", path.display().to_string(), e)),
    }
}

/// Lists `path`, skipping `offset` records and returning at most
/// `limit + 1` of the rest (all of them when `limit` is `None`).
///
/// Entries are sorted by file name at every level so offsets stay stable
/// between calls. A missing path or a non-directory yields no records.
/// Directories that cannot be read are reported with `skipped` set.
///
/// This walks the filesystem synchronously; async callers should run it on
/// a blocking thread.
///
/// # Errors
///
/// Returns `SandboxError::Io` if `path` exists but cannot be inspected.
pub fn list_dir(
    path: &Path,
    offset: usize,
    limit: Option<usize>,
    recursive: bool,
) -> SandboxResult<Vec<ListingRecord>> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(Vec::new()),
        Err(e) if is_absent(e.kind()) => return Ok(Vec::new()),
        Err(e) => return Err(SandboxError::io("list directory", path.display().to_string(), e)),
    }

    let wanted = limit.map(|l| offset.saturating_add(l).saturating_add(1));
    let walker = WalkDir::new(path)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .sort_by_file_name();

    let mut records: Vec<ListingRecord> = Vec::new();
    for item in walker {
        if wanted.is_some_and(|w| records.len() >= w) {
            break;
        }
        match item {
            Ok(entry) => {
                let file_type = entry.file_type();
                let kind = if file_type.is_dir() {
                    'd'
                } else if file_type.is_file() {
                    'f'
                } else if file_type.is_symlink() {
                    'l'
                } else {
                    'o'
                };
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                records.push(ListingRecord {
                    kind,
                    size,
                    path: entry.path().to_string_lossy().into_owned(),
                    skipped: false,
                });
            }
            Err(err) => {
                let Some(failed) = err.path().map(|p| p.to_string_lossy().into_owned()) else {
                    continue;
                };
                warn!(path = %failed, error = %err, "skipping unreadable entry");
                match records.last_mut() {
                    Some(last) if last.path == failed => last.skipped = true,
                    _ => records.push(ListingRecord {
                        kind: 'd',
                        size: 0,
                        path: failed,
                        skipped: true,
                    }),
                }
            }
        }
    }

    Ok(records.into_iter().skip(offset).collect())
}
