//! Default on-disk locations.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// Directory permissions: owner read/write/execute only (0700).
const DIR_PERMISSIONS: u32 = 0o700;

/// Subdirectory of the base dir holding per-sandbox data.
pub const SANDBOXES_DIR: &str = "sandboxes";

/// Subdirectory of the base dir holding the sandbox index.
pub const INDEX_DIR: &str = "index";

/// Returns the default base directory.
///
/// Uses `XDG_DATA_HOME/sbx` if set, otherwise `~/.local/share/sbx`,
/// falling back to `/tmp/sbx`.
#[must_use]
pub fn default_base_dir() -> PathBuf {
    if let Some(xdg_data) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg_data).join("sbx");
    }

    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".local/share/sbx");
    }

    PathBuf::from("/tmp/sbx")
}

/// Directory under `base` that holds sandbox data.
#[must_use]
pub fn sandboxes_dir(base: &Path) -> PathBuf {
    base.join(SANDBOXES_DIR)
}

/// Directory under `base` that holds the sandbox index.
#[must_use]
pub fn index_dir(base: &Path) -> PathBuf {
    base.join(INDEX_DIR)
}

/// Ensures a directory exists, creating it owner-only if it does not.
///
/// # Errors
///
/// Returns `StoreError::Io` if creation or chmod fails.
pub fn ensure_private_dir(dir: &Path) -> Result<(), StoreError> {
    if dir.exists() {
        return Ok(());
    }

    fs::create_dir_all(dir).map_err(|e| StoreError::Io {
        context: format!("failed to create directory: {}", dir.display()),
        source: e,
    })?;

    fs::set_permissions(dir, fs::Permissions::from_mode(DIR_PERMISSIONS)).map_err(|e| {
        StoreError::Io {
            context: format!("failed to set permissions on directory: {}", dir.display()),
            source: e,
        }
    })
}
