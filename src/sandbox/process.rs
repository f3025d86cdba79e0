//! Persisted process records.
//!
//! Each spawned process owns one directory:
//!
//! ```text
//! {data_dir}/.processes/{process-id}/
//! ├── meta.json     # ProcessMetadata
//! ├── stdout.txt    # captured stdout
//! ├── stderr.txt    # captured stderr
//! ├── pid.txt       # PID of the command, written before execute() returns
//! ├── signal.txt    # signal sent through kill() or observed at exit
//! └── exitcode.txt  # written last; its existence means "completed"
//! ```
//!
//! The same layout is used inside containers by the container backend.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{SandboxError, SandboxResult};

/// Directory under a sandbox's data dir holding process records.
pub const PROCESSES_DIR: &str = ".processes";
pub const META_FILE: &str = "meta.json";
pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";
pub const PID_FILE: &str = "pid.txt";
pub const SIGNAL_FILE: &str = "signal.txt";
pub const EXIT_CODE_FILE: &str = "exitcode.txt";

/// Signal used when `kill()` is called without one.
pub const DEFAULT_SIGNAL: &str = "SIGTERM";

/// Generates a process id: millisecond timestamp plus random suffix.
#[must_use]
pub fn new_process_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("proc-{}-{}", Utc::now().timestamp_millis(), &random[..7])
}

/// Parses `SIGTERM`, `TERM`, `term` or `15` into a signal.
///
/// # Errors
///
/// Returns `SandboxError::InvalidArgument` for unknown names or numbers.
pub fn parse_signal(raw: &str) -> SandboxResult<Signal> {
    let trimmed = raw.trim();
    if let Ok(number) = trimmed.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|_| SandboxError::invalid(format!("unknown signal number: {number}")));
    }

    let upper = trimmed.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| SandboxError::invalid(format!("unknown signal: {raw}")))
}

/// Paths of one process record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessPaths {
    pub root: PathBuf,
    pub meta_file: PathBuf,
    pub stdout_file: PathBuf,
    pub stderr_file: PathBuf,
    pub pid_file: PathBuf,
    pub signal_file: PathBuf,
    pub exit_code_file: PathBuf,
}

impl ProcessPaths {
    /// Computes the record paths for `process_id` under a sandbox data dir.
    #[must_use]
    pub fn new(data_dir: &Path, process_id: &str) -> Self {
        Self::at(data_dir.join(PROCESSES_DIR).join(process_id))
    }

    /// Computes the record paths for an explicit record directory.
    #[must_use]
    pub fn at(root: PathBuf) -> Self {
        Self {
            meta_file: root.join(META_FILE),
            stdout_file: root.join(STDOUT_FILE),
            stderr_file: root.join(STDERR_FILE),
            pid_file: root.join(PID_FILE),
            signal_file: root.join(SIGNAL_FILE),
            exit_code_file: root.join(EXIT_CODE_FILE),
            root,
        }
    }

    /// Returns true if a record exists.
    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.meta_file).await.unwrap_or(false)
    }

    /// Reads the recorded PID, if any.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Io` if the file exists but cannot be read.
    pub async fn read_pid(&self) -> SandboxResult<Option<i32>> {
        Ok(read_optional(&self.pid_file)
            .await?
            .and_then(|raw| raw.trim().parse().ok())
            .filter(|pid: &i32| *pid > 0))
    }

    /// Reads the exit code sentinel. `None` means the process is still running.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Io` if the file exists but cannot be read.
    pub async fn read_exit_code(&self) -> SandboxResult<Option<i32>> {
        Ok(read_optional(&self.exit_code_file)
            .await?
            .and_then(|raw| raw.trim().parse().ok()))
    }

    /// Reads the recorded signal name, if any.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Io` if the file exists but cannot be read.
    pub async fn read_signal(&self) -> SandboxResult<Option<String>> {
        Ok(read_optional(&self.signal_file)
            .await?
            .map(|raw| raw.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    /// Records a signal name.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Io` if writing fails.
    pub async fn write_signal(&self, signal: &str) -> SandboxResult<()> {
        tokio::fs::write(&self.signal_file, signal)
            .await
            .map_err(|e| SandboxError::io("write", self.signal_file.display().to_string(), e))
    }

    /// Writes the exit code sentinel atomically.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Io` if writing or renaming fails.
    pub async fn write_exit_code(&self, code: i32) -> SandboxResult<()> {
        write_atomic(&self.exit_code_file, code.to_string().as_bytes()).await
    }
}

/// Metadata for one process, persisted as `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetadata {
    pub command: String,
    pub args: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default)]
    pub output_byte_limit: u64,
    #[serde(default)]
    pub truncated: bool,
}

impl ProcessMetadata {
    /// Creates a record for a process that is about to start.
    #[must_use]
    pub fn new(command: impl Into<String>, args: &[String], output_byte_limit: u64) -> Self {
        Self {
            command: command.into(),
            args: args.to_vec(),
            start_time: Utc::now(),
            cwd: None,
            exit_code: None,
            signal: None,
            output_byte_limit,
            truncated: false,
        }
    }

    /// Sets the working directory the command runs in.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// The command line as one string, used for pattern-based signalling.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// An extended regex for `pkill -f` that matches a process whose own
    /// command line starts with this one. Anchoring keeps it from matching
    /// wrappers such as the supervisor, which carry the command as trailing
    /// arguments.
    #[must_use]
    pub fn command_pattern(&self) -> String {
        let mut pattern = String::from("^");
        for c in self.command_line().chars() {
            if "\\^$.|?*+()[]{}".contains(c) {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern
    }

    /// Loads metadata from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Io` if reading fails, or
    /// `SandboxError::Backend` if the JSON is malformed.
    pub async fn load(path: &Path) -> SandboxResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SandboxError::io("read process metadata", path.display().to_string(), e))?;

        serde_json::from_str(&content).map_err(|e| {
            SandboxError::backend(
                "parse process metadata",
                path.display().to_string(),
                e.to_string(),
            )
        })
    }

    /// Saves metadata to a JSON file atomically.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Io` if writing fails.
    pub async fn save(&self, path: &Path) -> SandboxResult<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| {
            SandboxError::backend(
                "serialize process metadata",
                path.display().to_string(),
                e.to_string(),
            )
        })?;
        write_atomic(path, &json).await
    }
}

/// Writes `bytes` to a sibling temp file, syncs it, then renames it into place.
///
/// # Errors
///
/// Returns `SandboxError::Io` naming the file that failed.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> SandboxResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| SandboxError::io("create", temp_path.display().to_string(), e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| SandboxError::io("write", temp_path.display().to_string(), e))?;
    file.sync_all()
        .await
        .map_err(|e| SandboxError::io("sync", temp_path.display().to_string(), e))?;
    drop(file);

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| SandboxError::io("rename", path.display().to_string(), e))
}

async fn read_optional(path: &Path) -> SandboxResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SandboxError::io("read", path.display().to_string(), e)),
    }
}
