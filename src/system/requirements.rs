//! Host checks run before the CLI touches any sandbox.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{Result, SystemRequirementsError};

/// What the checks found on this host.
#[derive(Debug, Clone)]
pub struct SystemRequirements {
    /// Resolved helper executable for the local driver
    pub helper: PathBuf,
    /// Data directory that was checked for writes
    pub data_dir: PathBuf,
    /// Container engine server version, if an engine was checked
    pub engine_version: Option<String>,
}

/// Run every check. `engine` is only checked when given.
///
/// # Errors
///
/// Returns the first failing requirement.
pub fn check_all(helper: &Path, data_dir: &Path, engine: Option<&str>) -> Result<SystemRequirements> {
    let helper = check_helper(helper)?;
    check_data_dir(data_dir)?;
    let engine_version = engine.map(check_engine).transpose()?;

    Ok(SystemRequirements {
        helper,
        data_dir: data_dir.to_path_buf(),
        engine_version,
    })
}

/// Check the helper executable exists, searching `PATH` for bare names.
///
/// # Errors
///
/// Returns `SystemRequirementsError::HelperMissing` if it cannot be found.
pub fn check_helper(helper: &Path) -> Result<PathBuf> {
    let missing = || SystemRequirementsError::HelperMissing {
        path: helper.display().to_string(),
    };

    if helper.components().count() > 1 {
        return if helper.is_file() {
            Ok(helper.to_path_buf())
        } else {
            Err(missing().into())
        };
    }

    let path = std::env::var_os("PATH").ok_or_else(missing)?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(helper))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| missing().into())
}

/// Check the data directory can be created and written to.
///
/// # Errors
///
/// Returns `SystemRequirementsError::DataDirNotWritable` on any failure.
pub fn check_data_dir(data_dir: &Path) -> Result<()> {
    let not_writable = |source| SystemRequirementsError::DataDirNotWritable {
        path: data_dir.display().to_string(),
        source,
    };

    fs::create_dir_all(data_dir).map_err(not_writable)?;
    let marker = data_dir.join(format!(".write-check-{}", std::process::id()));
    fs::write(&marker, b"").map_err(not_writable)?;
    fs::remove_file(&marker).map_err(not_writable)?;
    Ok(())
}

/// Check the container engine CLI runs and reaches its daemon.
///
/// # Errors
///
/// Returns `SystemRequirementsError::EngineUnavailable` with the engine's
/// own error output.
pub fn check_engine(engine: &str) -> Result<String> {
    let unavailable = |reason: String| SystemRequirementsError::EngineUnavailable {
        engine: engine.to_string(),
        reason,
    };

    let output = Command::new(engine)
        .args(["version", "--format", "{{.Server.Version}}"])
        .stdin(Stdio::null())
        .output()
        .map_err(|e| unavailable(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(unavailable(stderr).into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
