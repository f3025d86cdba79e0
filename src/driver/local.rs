//! Sandboxes backed by the host filesystem and process table.
//!
//! Intended for hosts that are already isolated (for example, when `sbx`
//! itself runs inside a container). Each sandbox owns a data directory that
//! holds its process records and, unless a shared working directory is
//! configured, its private workspace:
//!
//! ```text
//! {data_dir}/{sandbox-id}/
//! ├── workspace/     # working directory (private mode only)
//! └── .processes/    # one record per execute() call
//! ```
//!
//! Processes are started through the `sbx helper exec` supervisor so they
//! outlive the call that started them. Completion is detected by polling for
//! the exit code sentinel the supervisor writes last.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};
use walkdir::WalkDir;

use super::{
    CreateOptions, Driver, LoadOptions, decode_driver_config, encode_driver_config,
    ensure_driver_config,
};
use crate::error::{SandboxError, SandboxResult};
use crate::helper::supervise::{HANDSHAKE_PREFIX, SUPERVISOR_LOG_FILE};
use crate::helper::{self, is_absent};
use crate::sandbox::listing::{effective_limit, paginate, parse_cursor};
use crate::sandbox::process::{
    DEFAULT_SIGNAL, PROCESSES_DIR, ProcessMetadata, ProcessPaths, new_process_id, parse_signal,
};
use crate::sandbox::{
    DEFAULT_POLL_INTERVAL, DirPage, EXIT_CODE_RUNNING, ExecOptions, ExitInfo, FileContent, ProcessOutput, ReadDirOptions,
    ReadOptions, Sandbox, SandboxConfig, SandboxMetadata, WriteOptions, content,
    resolve_sandbox_path,
};
use crate::system::paths;

/// Name the local driver registers under.
pub const LOCAL_DRIVER_NAME: &str = "local";

/// Private workspace directory inside a sandbox's data dir.
pub const WORKSPACE_DIR: &str = "workspace";

/// How long `execute()` waits for the supervisor to report the PID.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long deleting a sandbox waits for killed processes to be recorded.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const REMOVE_ATTEMPTS: u32 = 10;

/// Configuration for the local driver.
///
/// # Example
///
/// ```
/// use sandbox_manager::driver::LocalDriverConfig;
///
/// let config = LocalDriverConfig::new("/var/lib/sbx/sandboxes")
///     .with_workdir("/workspace")
///     .with_env("LANG", "C.UTF-8")
///     .with_helper_path("/usr/local/bin/sbx");
/// ```
#[derive(Debug, Clone)]
pub struct LocalDriverConfig {
    /// Root under which each sandbox gets `<data_dir>/<id>`.
    pub data_dir: PathBuf,

    /// Shared working directory. When unset each sandbox works in its own
    /// `<data_dir>/<id>/workspace`.
    pub workdir: Option<PathBuf>,

    /// Environment applied to every command.
    pub env: HashMap<String, String>,

    /// The `sbx` binary providing the `helper exec` supervisor.
    pub helper_path: PathBuf,
}

impl Default for LocalDriverConfig {
    fn default() -> Self {
        Self {
            data_dir: paths::sandboxes_dir(&paths::default_base_dir()),
            workdir: None,
            env: HashMap::new(),
            helper_path: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("sbx")),
        }
    }
}

impl LocalDriverConfig {
    /// Creates a configuration rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Shares one working directory between all sandboxes.
    #[must_use]
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Adds an environment variable for every command.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the helper binary.
    #[must_use]
    pub fn with_helper_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.helper_path = path.into();
        self
    }
}

/// Driver configuration blob persisted for each local sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSandboxSettings {
    pub data_dir: PathBuf,
    pub workdir: PathBuf,
    pub helper_path: PathBuf,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Creates and loads local sandboxes.
#[derive(Debug, Clone, Default)]
pub struct LocalDriver {
    config: LocalDriverConfig,
}

impl LocalDriver {
    #[must_use]
    pub fn new(config: LocalDriverConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &LocalDriverConfig {
        &self.config
    }

    fn sandbox_dir(&self, id: &str) -> PathBuf {
        self.config.data_dir.join(id)
    }

    fn settings_for(&self, config: &SandboxConfig) -> SandboxResult<LocalSandboxSettings> {
        match &config.driver_config {
            Some(value) => decode_driver_config(&config.id, value.clone()),
            None => Ok(self.default_settings(&config.id)),
        }
    }

    fn default_settings(&self, id: &str) -> LocalSandboxSettings {
        let data_dir = self.sandbox_dir(id);
        LocalSandboxSettings {
            workdir: self
                .config
                .workdir
                .clone()
                .unwrap_or_else(|| data_dir.join(WORKSPACE_DIR)),
            data_dir,
            helper_path: self.config.helper_path.clone(),
            env: self.config.env.clone(),
        }
    }
}

#[async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &str {
        LOCAL_DRIVER_NAME
    }

    #[instrument(skip(self, config), fields(sandbox_id = %config.id, parent = ?config.parent_id))]
    async fn create_sandbox(
        &self,
        config: &SandboxConfig,
        options: CreateOptions,
    ) -> SandboxResult<Value> {
        let settings = self.default_settings(&config.id);

        match (&config.parent_id, options.recreate) {
            (Some(parent), false) => {
                let parent_dir = self.sandbox_dir(parent);
                if tokio::fs::try_exists(&parent_dir).await.unwrap_or(false) {
                    let source = parent_dir.clone();
                    let target = settings.data_dir.clone();
                    let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &target))
                        .await
                        .map_err(|e| {
                            SandboxError::backend(
                                "copy sandbox",
                                parent_dir.display().to_string(),
                                e.to_string(),
                            )
                        })??;
                    debug!(parent, copied, "copied parent sandbox state");
                } else {
                    warn!(parent, "parent sandbox data missing, creating an empty sandbox");
                    create_dir(&settings.data_dir).await?;
                }
            }
            _ => create_dir(&settings.data_dir).await?,
        }

        create_dir(&settings.workdir).await?;
        debug!(data_dir = %settings.data_dir.display(), "local sandbox ready");
        encode_driver_config(&config.id, &settings)
    }

    #[instrument(skip(self, config), fields(sandbox_id = %config.id))]
    async fn delete_sandbox(&self, config: &SandboxConfig) -> SandboxResult<()> {
        let settings = self.settings_for(config)?;
        terminate_running(&settings.data_dir).await;
        remove_sandbox_dir(&settings.data_dir).await?;
        debug!("removed sandbox data");
        Ok(())
    }

    async fn load_sandbox(
        &self,
        config: &SandboxConfig,
        options: LoadOptions,
    ) -> SandboxResult<Arc<dyn Sandbox>> {
        let value = ensure_driver_config(self, config, options).await?;
        let settings: LocalSandboxSettings = decode_driver_config(&config.id, value)?;
        Ok(Arc::new(LocalSandbox::new(
            config.id.clone(),
            config.meta.clone(),
            settings,
        )))
    }
}

/// A sandbox on the host filesystem.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    id: String,
    meta: SandboxMetadata,
    settings: LocalSandboxSettings,
}

impl LocalSandbox {
    #[must_use]
    pub fn new(id: String, meta: SandboxMetadata, settings: LocalSandboxSettings) -> Self {
        Self { id, meta, settings }
    }

    /// Directory holding this sandbox's process records.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.settings.data_dir
    }

    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.settings.workdir
    }

    /// Paths of a process record; `None` for ids that cannot name one.
    fn record_paths(&self, process_id: &str) -> Option<ProcessPaths> {
        let valid = !process_id.is_empty()
            && process_id != "."
            && process_id != ".."
            && !process_id.contains('/');
        valid.then(|| ProcessPaths::new(&self.settings.data_dir, process_id))
    }

    async fn existing_record(&self, process_id: &str) -> SandboxResult<ProcessPaths> {
        match self.record_paths(process_id) {
            Some(paths) if paths.exists().await => Ok(paths),
            _ => Err(SandboxError::ProcessNotFound {
                id: process_id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn meta(&self) -> &SandboxMetadata {
        &self.meta
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        resolve_sandbox_path(&self.settings.workdir, path)
    }

    #[instrument(skip(self, options), fields(sandbox_id = %self.id))]
    async fn read_file(
        &self,
        path: &str,
        options: ReadOptions,
    ) -> SandboxResult<Option<FileContent>> {
        helper::read_file(&self.resolve_path(path), &options).await
    }

    #[instrument(skip(self, content, options), fields(sandbox_id = %self.id, bytes = content.len()))]
    async fn write_file(
        &self,
        path: &str,
        content: &str,
        options: WriteOptions,
    ) -> SandboxResult<()> {
        let bytes = content::decode(content, options.encoding)?;
        helper::write_file(&self.resolve_path(path), &bytes).await
    }

    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    async fn delete_file(&self, path: &str) -> SandboxResult<()> {
        helper::delete_file(&self.resolve_path(path)).await
    }

    #[instrument(skip(self, options), fields(sandbox_id = %self.id, cursor = ?options.cursor))]
    async fn readdir(&self, path: &str, options: ReadDirOptions) -> SandboxResult<DirPage> {
        let absolute = self.resolve_path(path);
        let offset = parse_cursor(options.cursor.as_deref())?;
        let limit = effective_limit(options.limit);
        let recursive = options.recursive;

        let dir = absolute.clone();
        let records =
            tokio::task::spawn_blocking(move || helper::list_dir(&dir, offset, limit, recursive))
                .await
                .map_err(|e| {
                    SandboxError::backend(
                        "list directory",
                        absolute.display().to_string(),
                        e.to_string(),
                    )
                })??;

        trace!(records = records.len(), offset, "listed directory");
        Ok(paginate(records, &absolute, offset, limit))
    }

    #[instrument(skip(self, args, options), fields(sandbox_id = %self.id, process_id = tracing::field::Empty))]
    async fn execute(
        &self,
        command: &str,
        args: &[String],
        options: ExecOptions,
    ) -> SandboxResult<String> {
        let process_id = new_process_id();
        tracing::Span::current().record("process_id", process_id.as_str());

        let paths = ProcessPaths::new(&self.settings.data_dir, &process_id);
        create_dir(&paths.root).await?;

        let cwd = options
            .cwd
            .as_deref()
            .map_or_else(|| self.settings.workdir.clone(), |c| self.resolve_path(c));
        ProcessMetadata::new(command, args, options.output_byte_limit)
            .with_cwd(cwd.to_string_lossy())
            .save(&paths.meta_file)
            .await?;

        let log_path = paths.root.join(SUPERVISOR_LOG_FILE);
        let log = std::fs::File::create(&log_path)
            .map_err(|e| SandboxError::io("create", log_path.display().to_string(), e))?;

        let mut supervisor = Command::new(&self.settings.helper_path);
        supervisor
            .arg("helper")
            .arg("exec")
            .arg("--dir")
            .arg(&paths.root)
            .arg("--limit")
            .arg(options.output_byte_limit.to_string())
            .arg("--cwd")
            .arg(&cwd)
            .arg("--")
            .arg(command)
            .args(args)
            .current_dir(&self.settings.data_dir)
            .envs(&self.settings.env)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log))
            .process_group(0);

        let mut child = supervisor.spawn().map_err(|e| {
            SandboxError::io(
                "start helper",
                self.settings.helper_path.display().to_string(),
                e,
            )
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SandboxError::backend("start", process_id.as_str(), "helper stdout unavailable")
        })?;

        let mut lines = BufReader::new(stdout).lines();
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next_line()).await {
            Ok(Ok(Some(line))) if line.starts_with(HANDSHAKE_PREFIX) => {
                debug!(handshake = %line, "process started");
            }
            Ok(Ok(_)) => {
                let log = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
                return Err(SandboxError::backend(
                    "start",
                    process_id,
                    format!("helper exited before starting the command: {}", log.trim()),
                ));
            }
            Ok(Err(e)) => {
                return Err(SandboxError::io("read handshake from", process_id, e));
            }
            Err(_) => warn!("helper handshake timed out, the process may still start"),
        }

        Ok(process_id)
    }

    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    async fn kill(&self, process_id: &str, signal: Option<&str>) -> SandboxResult<()> {
        let paths = self.existing_record(process_id).await?;
        let signal = parse_signal(signal.unwrap_or(DEFAULT_SIGNAL))?;

        if let Some(code) = paths.read_exit_code().await? {
            debug!(code, "process already exited, nothing to signal");
            return Ok(());
        }

        match paths.read_pid().await? {
            Some(pid) => {
                if !deliver_signal(pid, signal) {
                    debug!(pid, "process already gone");
                }
            }
            None => {
                let meta = ProcessMetadata::load(&paths.meta_file).await?;
                warn!("no pid on record, signalling by command line");
                signal_by_pattern(&meta.command_pattern(), signal).await;
            }
        }

        paths.write_signal(signal.as_str()).await?;
        let mut meta = ProcessMetadata::load(&paths.meta_file).await?;
        meta.signal = Some(signal.as_str().to_string());
        meta.save(&paths.meta_file).await
    }

    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    async fn output(&self, process_id: &str) -> SandboxResult<ProcessOutput> {
        let paths = self.existing_record(process_id).await?;
        let meta = ProcessMetadata::load(&paths.meta_file).await?;

        let mut bytes = read_or_empty(&paths.stdout_file).await?;
        bytes.extend(read_or_empty(&paths.stderr_file).await?);

        let (output, cut) = content::cap_output(&bytes, meta.output_byte_limit);

        let exit_code = paths
            .read_exit_code()
            .await?
            .or(meta.exit_code)
            .unwrap_or(EXIT_CODE_RUNNING);
        let signal = paths.read_signal().await?.or(meta.signal);

        Ok(ProcessOutput {
            output,
            truncated: meta.truncated || cut,
            exit_code,
            signal,
        })
    }

    async fn exit_status(&self, process_id: &str) -> SandboxResult<Option<ExitInfo>> {
        let paths = self.existing_record(process_id).await?;
        match paths.read_exit_code().await? {
            Some(exit_code) => Ok(Some(ExitInfo {
                exit_code,
                signal: paths.read_signal().await?,
            })),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    async fn release(&self, process_id: &str) -> SandboxResult<()> {
        let Some(paths) = self.record_paths(process_id) else {
            return Ok(());
        };
        match tokio::fs::remove_dir_all(&paths.root).await {
            Ok(()) => {
                debug!("released process record");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::io(
                "release",
                paths.root.display().to_string(),
                e,
            )),
        }
    }
}

async fn create_dir(path: &Path) -> SandboxResult<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| SandboxError::io("create directory", path.display().to_string(), e))
}

async fn read_or_empty(path: &Path) -> SandboxResult<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if is_absent(e.kind()) => Ok(Vec::new()),
        Err(e) => Err(SandboxError::io("read", path.display().to_string(), e)),
    }
}

/// Signals the process group led by `pid`, then `pid` itself.
/// Returns false if neither exists any more.
fn deliver_signal(pid: i32, signal: Signal) -> bool {
    let target = Pid::from_raw(pid);

    match killpg(target, signal) {
        Ok(()) => return true,
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "failed to signal process group"),
    }

    match kill(target, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, error = %e, "failed to signal process");
            false
        }
    }
}

async fn signal_by_pattern(pattern: &str, signal: Signal) {
    match Command::new("pkill")
        .arg(format!("-{}", signal as i32))
        .arg("-f")
        .arg(pattern)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => trace!(pattern, code = ?status.code(), "pkill finished"),
        Err(e) => warn!(error = %e, "failed to run pkill"),
    }
}

/// Kills every still-running process recorded under `data_dir` and waits,
/// up to [`TERMINATE_GRACE`], for their supervisors to record the exit.
async fn terminate_running(data_dir: &Path) {
    let mut entries = match tokio::fs::read_dir(data_dir.join(PROCESSES_DIR)).await {
        Ok(entries) => entries,
        Err(_) => return,
    };

    let mut pending = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let paths = ProcessPaths::at(entry.path());
        if matches!(paths.read_exit_code().await, Ok(Some(_))) {
            continue;
        }
        if let Ok(Some(pid)) = paths.read_pid().await {
            debug!(pid, "terminating process of deleted sandbox");
            deliver_signal(pid, Signal::SIGKILL);
        }
        pending.push(paths);
    }

    let deadline = Instant::now() + TERMINATE_GRACE;
    while !pending.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        let mut still_running = Vec::with_capacity(pending.len());
        for paths in pending {
            if !matches!(paths.read_exit_code().await, Ok(Some(_))) {
                still_running.push(paths);
            }
        }
        pending = still_running;
    }
    if !pending.is_empty() {
        warn!(count = pending.len(), "supervisors did not record an exit in time");
    }
}

/// Removes a sandbox data directory, retrying while late writers are
/// still creating files in it.
async fn remove_sandbox_dir(data_dir: &Path) -> SandboxResult<()> {
    let mut attempt = 1;
    loop {
        match tokio::fs::remove_dir_all(data_dir).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty && attempt < REMOVE_ATTEMPTS => {
                trace!(attempt, "sandbox directory still being written, retrying");
                attempt += 1;
                tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
            }
            Err(e) => {
                return Err(SandboxError::io(
                    "remove sandbox",
                    data_dir.display().to_string(),
                    e,
                ));
            }
        }
    }
}

/// Recursively copies `source` into `target`, leaving out process records.
/// Entries that vanish mid-copy are skipped. Returns the number of entries copied.
fn copy_tree(source: &Path, target: &Path) -> SandboxResult<u64> {
    std::fs::create_dir_all(target)
        .map_err(|e| SandboxError::io("create directory", target.display().to_string(), e))?;

    let walker = WalkDir::new(source)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == PROCESSES_DIR));

    let mut copied = 0;
    for item in walker {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().map(|p| p.display().to_string()).unwrap_or_default();
                let io = std::io::Error::from(err);
                if io.kind() == ErrorKind::NotFound {
                    warn!(path, "entry vanished during copy");
                    continue;
                }
                return Err(SandboxError::io("copy", path, io));
            }
        };

        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let dest = target.join(relative);
        let file_type = entry.file_type();

        let result = if file_type.is_dir() {
            std::fs::create_dir_all(&dest)
        } else if file_type.is_symlink() {
            std::fs::read_link(entry.path()).and_then(|link| {
                let _ = std::fs::remove_file(&dest);
                std::os::unix::fs::symlink(link, &dest)
            })
        } else {
            std::fs::copy(entry.path(), &dest).map(|_| ())
        };

        match result {
            Ok(()) => copied += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %entry.path().display(), "entry vanished during copy");
            }
            Err(e) => return Err(SandboxError::io("copy", entry.path().display().to_string(), e)),
        }
    }

    Ok(copied)
}
