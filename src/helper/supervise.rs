//! Detached process supervisor behind `sbx helper exec`.
//!
//! The supervisor runs in its own process group, starts the command in
//! another one, records its PID, prints a single handshake line and then
//! captures output into the record directory until the command exits.
//! The exit code sentinel is written last.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::process::{ProcessMetadata, ProcessPaths};

/// Prefix of the line printed once the PID is on disk.
pub const HANDSHAKE_PREFIX: &str = "started";

/// Supervisor diagnostics land here, next to the record files.
pub const SUPERVISOR_LOG_FILE: &str = "supervisor.log";

/// Exit code recorded when the command does not exist.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Exit code recorded when the command exists but cannot be started.
pub const EXIT_CANNOT_EXECUTE: i32 = 126;

/// How long to keep draining pipes after the command exited. Background
/// grandchildren may hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8192;

/// What to run and where to record it.
#[derive(Debug, Clone)]
pub struct SuperviseRequest {
    pub record_dir: PathBuf,
    pub output_byte_limit: u64,
    pub cwd: Option<PathBuf>,
    pub command: String,
    pub args: Vec<String>,
}

/// Byte budget shared by the stdout and stderr drains.
#[derive(Debug)]
pub struct OutputBudget {
    remaining: AtomicU64,
    unlimited: bool,
    truncated: AtomicBool,
}

impl OutputBudget {
    /// A limit of zero means unlimited.
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            remaining: AtomicU64::new(limit),
            unlimited: limit == 0,
            truncated: AtomicBool::new(false),
        }
    }

    /// Claims up to `wanted` bytes and returns how many may be kept.
    pub fn claim(&self, wanted: usize) -> usize {
        if self.unlimited {
            return wanted;
        }
        let wanted_u64 = u64::try_from(wanted).unwrap_or(u64::MAX);
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current - current.min(wanted_u64))
            })
            .unwrap_or(0);
        let granted = previous.min(wanted_u64);
        usize::try_from(granted).unwrap_or(wanted)
    }

    /// Flags truncation; returns true only for the first caller.
    pub fn mark_truncated(&self) -> bool {
        !self.truncated.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated.load(Ordering::Acquire)
    }
}

/// Runs the command to completion and returns the recorded exit code.
///
/// # Errors
///
/// Returns `SandboxError::Io` if the record directory cannot be written.
#[instrument(skip(request), fields(record = %request.record_dir.display(), command = %request.command))]
pub async fn run(request: SuperviseRequest) -> SandboxResult<i32> {
    let paths = ProcessPaths::at(request.record_dir.clone());

    let stdout_sink = create_sink(&paths.stdout_file).await?;
    let stderr_sink = create_sink(&paths.stderr_file).await?;

    let mut command = Command::new(&request.command);
    command
        .args(&request.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let code = if e.kind() == std::io::ErrorKind::NotFound {
                EXIT_NOT_FOUND
            } else {
                EXIT_CANNOT_EXECUTE
            };
            warn!(error = %e, code, "failed to spawn command");
            let message = format!("sbx: {}: {}\n", request.command, e);
            tokio::fs::write(&paths.stderr_file, message)
                .await
                .map_err(|e| SandboxError::io("write", paths.stderr_file.display().to_string(), e))?;
            announce(None);
            finish(&paths, code, None, false).await?;
            return Ok(code);
        }
    };

    let pid = child.id();
    if let Some(pid) = pid {
        tokio::fs::write(&paths.pid_file, pid.to_string())
            .await
            .map_err(|e| SandboxError::io("write", paths.pid_file.display().to_string(), e))?;
    }
    announce(pid);
    debug!(?pid, "command started");

    let budget = Arc::new(OutputBudget::new(request.output_byte_limit));
    let mut drains = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        drains.push(tokio::spawn(drain(
            stdout,
            stdout_sink,
            Arc::clone(&budget),
            paths.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        drains.push(tokio::spawn(drain(
            stderr,
            stderr_sink,
            Arc::clone(&budget),
            paths.clone(),
        )));
    }

    let status = child
        .wait()
        .await
        .map_err(|e| SandboxError::io("wait for", request.command.clone(), e))?;

    let aborts: Vec<_> = drains.iter().map(tokio::task::JoinHandle::abort_handle).collect();
    let joined = tokio::time::timeout(DRAIN_GRACE, async {
        for handle in drains {
            match handle.await {
                Ok(Err(e)) => warn!(error = %e, "output capture failed"),
                Err(e) => warn!(error = %e, "output capture task failed"),
                Ok(Ok(())) => {}
            }
        }
    })
    .await;
    if joined.is_err() {
        warn!("output pipes still open after exit, abandoning capture");
        for abort in aborts {
            abort.abort();
        }
    }

    let observed_signal = status
        .signal()
        .and_then(|raw| Signal::try_from(raw).ok())
        .map(|s| s.as_str().to_string());
    let code = status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));

    debug!(code, signal = ?observed_signal, "command exited");
    finish(&paths, code, observed_signal, budget.is_truncated()).await?;
    Ok(code)
}

fn announce(pid: Option<u32>) {
    use std::io::Write;

    let mut stdout = std::io::stdout().lock();
    let line = format!("{HANDSHAKE_PREFIX} {}\n", pid.unwrap_or(0));
    if let Err(e) = stdout.write_all(line.as_bytes()).and_then(|()| stdout.flush()) {
        warn!(error = %e, "failed to write handshake");
    }
}

async fn create_sink(path: &std::path::Path) -> SandboxResult<tokio::fs::File> {
    tokio::fs::File::create(path)
        .await
        .map_err(|e| SandboxError::io("create", path.display().to_string(), e))
}

async fn drain<R>(
    mut reader: R,
    mut sink: tokio::fs::File,
    budget: Arc<OutputBudget>,
    paths: ProcessPaths,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let keep = budget.claim(n);
        if keep > 0 {
            sink.write_all(&buf[..keep]).await?;
            sink.flush().await?;
        }
        if keep < n && budget.mark_truncated() {
            mark_truncated(&paths).await;
        }
    }
    sink.flush().await
}

async fn mark_truncated(paths: &ProcessPaths) {
    let result = async {
        let mut meta = ProcessMetadata::load(&paths.meta_file).await?;
        meta.truncated = true;
        meta.save(&paths.meta_file).await
    }
    .await;
    if let Err(e) = result {
        warn!(error = %e, "failed to record truncation");
    }
}

/// Records the terminal state. A signal sent through `kill()` takes
/// precedence over the one observed at exit.
async fn finish(
    paths: &ProcessPaths,
    code: i32,
    observed_signal: Option<String>,
    truncated: bool,
) -> SandboxResult<()> {
    let recorded = paths.read_signal().await?;
    let signal = match (recorded, observed_signal) {
        (Some(recorded), _) => Some(recorded),
        (None, Some(observed)) => {
            paths.write_signal(&observed).await?;
            Some(observed)
        }
        (None, None) => None,
    };

    match ProcessMetadata::load(&paths.meta_file).await {
        Ok(mut meta) => {
            meta.exit_code = Some(code);
            meta.truncated |= truncated;
            if signal.is_some() {
                meta.signal = signal;
            }
            meta.save(&paths.meta_file).await?;
        }
        Err(e) => warn!(error = %e, "process metadata unavailable, recording exit code only"),
    }

    paths.write_exit_code(code).await
}
