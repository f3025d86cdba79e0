//! The uniform sandbox contract shared by every backend.
//!
//! A [`Sandbox`] exposes file I/O and detached process execution. Backends
//! differ only in mechanism: the local backend works on the host filesystem
//! and process table, the container backend goes through a container engine.
//!
//! # Example
//!
//! ```no_run
//! use sandbox_manager::sandbox::{ExecOptions, ReadOptions, Sandbox, WriteOptions};
//!
//! async fn demo(sandbox: &dyn Sandbox) -> sandbox_manager::error::SandboxResult<()> {
//!     sandbox.write_file("notes.txt", "hello\n", WriteOptions::default()).await?;
//!     let content = sandbox.read_file("notes.txt", ReadOptions::default()).await?;
//!     assert_eq!(content.map(|c| c.content).as_deref(), Some("hello\n"));
//!
//!     let id = sandbox.execute("echo", &["hi".to_string()], ExecOptions::default()).await?;
//!     let exit = sandbox.wait(&id).await?;
//!     assert_eq!(exit.exit_code, 0);
//!     sandbox.release(&id).await?;
//!     Ok(())
//! }
//! ```

mod config;
pub mod content;
pub mod listing;
pub mod process;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{SandboxError, SandboxResult};

pub use config::{SandboxConfig, SandboxMetadata};

/// Exit code reported by `output()` while no exit code is on record.
pub const EXIT_CODE_RUNNING: i32 = -1;

/// Default ceiling for `wait()`.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default interval between completion checks in `wait()`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Content encoding for file transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Plain text.
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    /// Binary-safe base64 text.
    #[serde(rename = "base64")]
    Base64,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8 => write!(f, "utf-8"),
            Self::Base64 => write!(f, "base64"),
        }
    }
}

impl FromStr for Encoding {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" | "text" => Ok(Self::Utf8),
            "base64" => Ok(Self::Base64),
            other => Err(SandboxError::invalid(format!("unknown encoding: {other}"))),
        }
    }
}

/// Options for [`Sandbox::read_file`].
///
/// For UTF-8 reads `offset` is a 1-based line number and `limit` a line
/// count. For base64 reads both count bytes, `offset` again 1-based.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub encoding: Encoding,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl ReadOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// File content returned by [`Sandbox::read_file`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
    pub encoding: Encoding,
}

/// Options for [`Sandbox::write_file`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// How the supplied content is encoded.
    pub encoding: Encoding,
}

impl WriteOptions {
    #[must_use]
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }
}

/// Options for [`Sandbox::readdir`].
#[derive(Debug, Clone, Default)]
pub struct ReadDirOptions {
    /// Continuation token from a previous page.
    pub cursor: Option<String>,
    /// Descend into subdirectories.
    pub recursive: bool,
    /// Maximum entries per page; `None` or zero lists everything.
    pub limit: Option<usize>,
}

impl ReadDirOptions {
    #[must_use]
    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    #[must_use]
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One directory entry, named relative to the listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub is_file: bool,
    pub is_directory: bool,
    pub size: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

/// One page of a directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirPage {
    pub entries: Vec<DirEntry>,
    /// Present when more entries follow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Options for [`Sandbox::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory, resolved like any sandbox path.
    pub cwd: Option<String>,
    /// Extra environment variables for the command.
    pub env: HashMap<String, String>,
    /// Cap on retained stdout+stderr bytes; 0 means unlimited.
    pub output_byte_limit: u64,
}

impl ExecOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_output_byte_limit(mut self, limit: u64) -> Self {
        self.output_byte_limit = limit;
        self
    }
}

/// Accumulated output and status of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutput {
    /// stdout followed by stderr.
    pub output: String,
    pub truncated: bool,
    /// [`EXIT_CODE_RUNNING`] until the process has completed.
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

impl ProcessOutput {
    /// Returns true once an exit code is on record.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.exit_code != EXIT_CODE_RUNNING
    }
}

/// Terminal state of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// Options for [`Sandbox::wait_with`].
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Stops the wait early with [`SandboxError::Cancelled`].
    pub cancel: Option<CancellationToken>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: None,
        }
    }
}

impl WaitOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// The capability set every sandbox backend implements.
///
/// Missing files are reported as `None` or an empty page, never as errors.
/// Unknown process ids fail with [`SandboxError::ProcessNotFound`], except in
/// [`Sandbox::release`], which is idempotent.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// The sandbox id this instance was loaded for.
    fn id(&self) -> &str;

    /// The caller-defined metadata supplied at creation.
    fn meta(&self) -> &SandboxMetadata;

    /// Resolves a sandbox path. Relative paths are joined onto the working
    /// directory; absolute paths are returned unchanged.
    fn resolve_path(&self, path: &str) -> PathBuf;

    /// Reads a file, returning `None` if it does not exist.
    async fn read_file(&self, path: &str, options: ReadOptions)
    -> SandboxResult<Option<FileContent>>;

    /// Writes a file, creating parent directories as needed.
    async fn write_file(&self, path: &str, content: &str, options: WriteOptions)
    -> SandboxResult<()>;

    /// Deletes a file. Deleting a missing file succeeds.
    async fn delete_file(&self, path: &str) -> SandboxResult<()>;

    /// Lists a directory one page at a time.
    async fn readdir(&self, path: &str, options: ReadDirOptions) -> SandboxResult<DirPage>;

    /// Starts a detached process and returns its id.
    async fn execute(
        &self,
        command: &str,
        args: &[String],
        options: ExecOptions,
    ) -> SandboxResult<String>;

    /// Sends a signal (default `SIGTERM`) to a process.
    async fn kill(&self, process_id: &str, signal: Option<&str>) -> SandboxResult<()>;

    /// Returns the accumulated output and current status of a process.
    async fn output(&self, process_id: &str) -> SandboxResult<ProcessOutput>;

    /// Returns the terminal state of a process, or `None` while it runs.
    async fn exit_status(&self, process_id: &str) -> SandboxResult<Option<ExitInfo>>;

    /// Discards everything retained for a process.
    async fn release(&self, process_id: &str) -> SandboxResult<()>;

    /// Waits for a process with the default one hour ceiling.
    async fn wait(&self, process_id: &str) -> SandboxResult<ExitInfo> {
        self.wait_with(process_id, WaitOptions::default()).await
    }

    /// Polls [`Sandbox::exit_status`] until the process completes, the
    /// timeout elapses or the cancellation token fires.
    async fn wait_with(&self, process_id: &str, options: WaitOptions) -> SandboxResult<ExitInfo> {
        poll_until_exit(self, process_id, options).await
    }
}

async fn poll_until_exit<S>(
    sandbox: &S,
    process_id: &str,
    options: WaitOptions,
) -> SandboxResult<ExitInfo>
where
    S: Sandbox + ?Sized,
{
    let deadline = Instant::now() + options.timeout;
    let mut polls: u64 = 0;

    loop {
        if let Some(info) = sandbox.exit_status(process_id).await? {
            trace!(process_id, polls, exit_code = info.exit_code, "process completed");
            return Ok(info);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(SandboxError::Timeout {
                id: process_id.to_string(),
                timeout_ms: u64::try_from(options.timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }

        let nap = options.poll_interval.min(deadline - now);
        polls += 1;

        match &options.cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => {
                        return Err(SandboxError::Cancelled { id: process_id.to_string() });
                    }
                    () = tokio::time::sleep(nap) => {}
                }
            }
            None => tokio::time::sleep(nap).await,
        }
    }
}

/// Resolves `path` against `workdir` unless it is already absolute.
#[must_use]
pub fn resolve_sandbox_path(workdir: &Path, path: &str) -> PathBuf {
    if path.starts_with('/') {
        PathBuf::from(path)
    } else if path.is_empty() || path == "." {
        workdir.to_path_buf()
    } else {
        workdir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_path() {
        let workdir = Path::new("/work");
        assert_eq!(
            resolve_sandbox_path(workdir, "src/main.rs"),
            PathBuf::from("/work/src/main.rs")
        );
        assert_eq!(resolve_sandbox_path(workdir, "."), PathBuf::from("/work"));
        assert_eq!(resolve_sandbox_path(workdir, ""), PathBuf::from("/work"));
    }

    #[test]
    fn test_resolve_absolute_path_verbatim() {
        let workdir = Path::new("/work");
        assert_eq!(
            resolve_sandbox_path(workdir, "/etc/hosts"),
            PathBuf::from("/etc/hosts")
        );
    }

    #[test]
    fn test_encoding_parse_and_display() {
        assert_eq!("utf-8".parse::<Encoding>().ok(), Some(Encoding::Utf8));
        assert_eq!("UTF8".parse::<Encoding>().ok(), Some(Encoding::Utf8));
        assert_eq!("base64".parse::<Encoding>().ok(), Some(Encoding::Base64));
        assert!("latin1".parse::<Encoding>().is_err());
        assert_eq!(Encoding::Base64.to_string(), "base64");
    }

    #[test]
    fn test_encoding_serde_names() {
        let json = serde_json::to_string(&Encoding::Utf8).expect("failed to serialize");
        assert_eq!(json, "\"utf-8\"");
    }

    #[test]
    fn test_dir_entry_omits_skipped_when_false() {
        let entry = DirEntry {
            name: "a.txt".to_string(),
            is_file: true,
            is_directory: false,
            size: 3,
            skipped: false,
        };
        let json = serde_json::to_value(&entry).expect("failed to serialize");
        assert!(json.get("skipped").is_none());
        assert_eq!(json["isFile"], serde_json::json!(true));
    }

    #[test]
    fn test_wait_options_defaults() {
        let options = WaitOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(3600));
        assert_eq!(options.poll_interval, Duration::from_millis(100));
        assert!(options.cancel.is_none());
    }

    #[test]
    fn test_process_output_finished() {
        let running = ProcessOutput {
            output: String::new(),
            truncated: false,
            exit_code: EXIT_CODE_RUNNING,
            signal: None,
        };
        assert!(!running.is_finished());
    }
}
