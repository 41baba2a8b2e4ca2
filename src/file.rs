//! Locked, atomic file access shared by the config store and the pid ledger.

use crate::error::FileError;
use std::io;
use std::path::Path;

/// Runs `f` while holding the advisory lock that guards `path`.
pub(crate) fn with_file_lock<T>(
    path: &Path,
    f: impl FnOnce() -> Result<T, FileError>,
) -> Result<T, FileError> {
    if let Some(parent) = path.parent() {
        xx::file::mkdirp(parent).map_err(|e| FileError::WriteError {
            path: parent.to_path_buf(),
            details: Some(e.to_string()),
        })?;
    }
    let _lock = xx::fslock::get(path, false).map_err(|e| FileError::WriteError {
        path: path.to_path_buf(),
        details: Some(format!("failed to acquire lock: {e}")),
    })?;
    f()
}

/// The file's contents, or `None` when it does not exist.
pub(crate) fn read_optional(path: &Path) -> Result<Option<String>, FileError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FileError::ReadError {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes next to the target and renames over it, so readers never see a
/// truncated file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<(), FileError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));
    xx::file::write(&tmp, contents).map_err(|e| FileError::WriteError {
        path: tmp.clone(),
        details: Some(e.to_string()),
    })?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        FileError::WriteError {
            path: path.to_path_buf(),
            details: Some(e.to_string()),
        }
    })
}
