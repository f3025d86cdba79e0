//! Sandboxes backed by a container engine.
//!
//! Every sandbox is one long-lived container started with `sleep infinity`.
//! All operations go through the engine CLI (`docker` or any CLI-compatible
//! engine): files through `exec cat`, processes through `exec -d` with a small
//! shell wrapper that writes the same record files the local backend uses,
//! inside the container under `{data_dir}/.processes/{process-id}/`.
//!
//! Forking commits the parent container to a snapshot image and starts the
//! child from it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, trace, warn};

use super::{
    CreateOptions, Driver, LoadOptions, decode_driver_config, encode_driver_config,
    ensure_driver_config,
};
use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::listing::{effective_limit, paginate, parse_cursor, parse_lines};
use crate::sandbox::process::{
    DEFAULT_SIGNAL, EXIT_CODE_FILE, META_FILE, PID_FILE, PROCESSES_DIR, ProcessMetadata,
    new_process_id, parse_signal,
};
use crate::sandbox::{
    DirPage, EXIT_CODE_RUNNING, ExecOptions, ExitInfo, FileContent, ProcessOutput, ReadDirOptions,
    ReadOptions, Sandbox, SandboxConfig, SandboxMetadata, WriteOptions, content,
    resolve_sandbox_path,
};

/// Name the container driver registers under.
pub const CONTAINER_DRIVER_NAME: &str = "docker";

/// Scripts signal "no such process record" with this exit code.
const EXIT_NO_RECORD: i32 = 3;

/// The kill script exits with this when the process already completed.
const EXIT_ALREADY_DONE: i32 = 4;

const PID_POLL_ATTEMPTS: u32 = 20;
const PID_POLL_INTERVAL: Duration = Duration::from_millis(50);

const WRITE_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;

const LIST_SCRIPT: &str = r#"[ -d "$1" ] || exit 0
if [ "$2" = "1" ]; then depth=""; else depth="-maxdepth 1"; fi
find "$1" -mindepth 1 $depth -printf '%y|%s|%p|0\n' 2>/dev/null | LC_ALL=C sort -t '|' -k3
exit 0"#;

/// Runs `$@` detached. With a positive limit stdout and stderr share one
/// stream through a FIFO and at most `limit + 1` bytes are ever kept; the
/// overflow byte is trimmed and `truncated` flipped in `meta.json` on exit.
const SPAWN_SCRIPT: &str = r#"dir="$1"; limit="$2"; shift 2
out="$dir/stdout.txt"
reader=""
if [ "$limit" -gt 0 ]; then
  fifo="$dir/output.fifo"
  mkfifo "$fifo"
  {
    head -c "$((limit + 1))" > "$out"
    cat > /dev/null
    if [ "$(wc -c < "$out")" -gt "$limit" ]; then
      head -c "$limit" "$out" > "$out.tmp" && mv "$out.tmp" "$out"
      sed 's/"truncated":false/"truncated":true/' "$dir/meta.json" > "$dir/meta.tmp" && mv "$dir/meta.tmp" "$dir/meta.json"
    fi
  } < "$fifo" &
  reader=$!
  "$@" > "$fifo" 2>&1 < /dev/null &
else
  "$@" > "$out" 2> "$dir/stderr.txt" < /dev/null &
fi
pid=$!
echo "$pid" > "$dir/pid.txt"
wait "$pid"
code=$?
if [ -n "$reader" ]; then wait "$reader"; rm -f "$fifo"; fi
echo "$code" > "$dir/exitcode.tmp" && mv "$dir/exitcode.tmp" "$dir/exitcode.txt""#;

const STATUS_SCRIPT: &str = r#"dir="$1"
[ -f "$dir/meta.json" ] || exit 3
printf '%s\n' "$(cat "$dir/exitcode.txt" 2>/dev/null)" "$(cat "$dir/signal.txt" 2>/dev/null)" "$(cat "$dir/meta.json")"
if [ "$2" = "1" ]; then cat "$dir/stdout.txt" "$dir/stderr.txt" 2>/dev/null; fi
exit 0"#;

const KILL_SCRIPT: &str = r#"dir="$1"; sig="$2"
[ -f "$dir/meta.json" ] || exit 3
[ -f "$dir/exitcode.txt" ] && exit 4
if [ -s "$dir/pid.txt" ]; then
  kill -s "$sig" "$(cat "$dir/pid.txt")" 2>/dev/null
elif [ -n "$3" ]; then
  pkill "-$sig" -f "$3" 2>/dev/null
fi
echo "SIG$sig" > "$dir/signal.txt"
exit 0"#;

/// Configuration for the container driver.
///
/// # Example
///
/// ```
/// use sandbox_manager::driver::ContainerDriverConfig;
///
/// let config = ContainerDriverConfig::default()
///     .with_engine("podman")
///     .with_image("debian:bookworm")
///     .with_run_arg("--network=none");
/// ```
#[derive(Debug, Clone)]
pub struct ContainerDriverConfig {
    /// Engine CLI to invoke.
    pub engine: String,
    /// Base image for new sandboxes.
    pub image: String,
    /// Working directory inside the container.
    pub workdir: String,
    /// Directory inside the container holding process records.
    pub data_dir: String,
    /// Prefix for container and snapshot names.
    pub name_prefix: String,
    /// Environment applied to every command.
    pub env: HashMap<String, String>,
    /// Extra arguments for `run`.
    pub run_args: Vec<String>,
}

impl Default for ContainerDriverConfig {
    fn default() -> Self {
        Self {
            engine: String::from("docker"),
            image: String::from("debian:bookworm-slim"),
            workdir: String::from("/workspace"),
            data_dir: String::from("/var/lib/sbx"),
            name_prefix: String::from("sbx"),
            env: HashMap::new(),
            run_args: Vec::new(),
        }
    }
}

impl ContainerDriverConfig {
    #[must_use]
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    #[must_use]
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<String>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    #[must_use]
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_run_arg(mut self, arg: impl Into<String>) -> Self {
        self.run_args.push(arg.into());
        self
    }
}

/// Driver configuration blob persisted for each container sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSandboxSettings {
    pub engine: String,
    pub container: String,
    pub image: String,
    /// Snapshot image this sandbox was forked from, removed with it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    pub workdir: String,
    pub data_dir: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Thin wrapper over the engine CLI.
#[derive(Debug, Clone)]
struct Engine {
    program: String,
}

impl Engine {
    fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Runs the CLI and returns its raw output whatever the exit status.
    async fn output(&self, args: &[String], stdin: Option<&[u8]>) -> SandboxResult<Output> {
        trace!(engine = %self.program, ?args, "engine call");
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::io("run", self.program.clone(), e))?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes)
                .await
                .map_err(|e| SandboxError::io("write stdin of", self.program.clone(), e))?;
            drop(pipe);
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| SandboxError::io("run", self.program.clone(), e))
    }

    /// Runs the CLI and fails unless it exits successfully.
    async fn run(
        &self,
        operation: &'static str,
        target: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> SandboxResult<Vec<u8>> {
        let output = self.output(args, stdin).await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(engine_failure(operation, target, &output))
        }
    }
}

fn engine_failure(operation: &'static str, target: &str, output: &Output) -> SandboxError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let reason = if stderr.trim().is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr.trim().to_string()
    };
    SandboxError::backend(operation, target, reason)
}

fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Replaces characters the engine rejects in names and tags.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Creates and loads container sandboxes.
#[derive(Debug, Clone, Default)]
pub struct ContainerDriver {
    config: ContainerDriverConfig,
}

impl ContainerDriver {
    #[must_use]
    pub fn new(config: ContainerDriverConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ContainerDriverConfig {
        &self.config
    }

    fn engine(&self) -> Engine {
        Engine::new(&self.config.engine)
    }

    #[must_use]
    pub fn container_name(&self, id: &str) -> String {
        format!("{}-{}", sanitize(&self.config.name_prefix), sanitize(id))
    }

    #[must_use]
    pub fn snapshot_image(&self, id: &str) -> String {
        let tag = sanitize(id).trim_start_matches(['.', '-']).to_string();
        format!(
            "{}-snapshot:{}",
            sanitize(&self.config.name_prefix).to_ascii_lowercase(),
            if tag.is_empty() { "latest".to_string() } else { tag }
        )
    }

    fn default_settings(&self, id: &str) -> ContainerSandboxSettings {
        ContainerSandboxSettings {
            engine: self.config.engine.clone(),
            container: self.container_name(id),
            image: self.config.image.clone(),
            snapshot: None,
            workdir: self.config.workdir.clone(),
            data_dir: self.config.data_dir.clone(),
            env: self.config.env.clone(),
        }
    }

    async fn container_exists(&self, name: &str) -> SandboxResult<bool> {
        let output = self
            .engine()
            .output(&args(["inspect", "--format", "{{.Id}}", name]), None)
            .await?;
        Ok(output.status.success())
    }

    async fn snapshot_parent(&self, parent: &str, id: &str) -> SandboxResult<Option<String>> {
        let parent_name = self.container_name(parent);
        if !self.container_exists(&parent_name).await? {
            warn!(parent, "parent container missing, starting from the base image");
            return Ok(None);
        }

        let image = self.snapshot_image(id);
        self.engine()
            .run(
                "snapshot",
                &parent_name,
                &args(["commit", parent_name.as_str(), image.as_str()]),
                None,
            )
            .await?;
        debug!(parent, image, "committed parent container");
        Ok(Some(image))
    }
}

#[async_trait]
impl Driver for ContainerDriver {
    fn name(&self) -> &str {
        CONTAINER_DRIVER_NAME
    }

    #[instrument(skip(self, config), fields(sandbox_id = %config.id, parent = ?config.parent_id))]
    async fn create_sandbox(
        &self,
        config: &SandboxConfig,
        options: CreateOptions,
    ) -> SandboxResult<Value> {
        let mut settings = self.default_settings(&config.id);

        if let (Some(parent), false) = (&config.parent_id, options.recreate) {
            settings.snapshot = self.snapshot_parent(parent, &config.id).await?;
        }
        let image = settings
            .snapshot
            .clone()
            .unwrap_or_else(|| settings.image.clone());

        let engine = self.engine();
        let stale = engine
            .output(&args(["rm", "-f", settings.container.as_str()]), None)
            .await?;
        if stale.status.success() {
            trace!(container = %settings.container, "removed stale container");
        }

        let mut run = args([
            "run",
            "-d",
            "--init",
            "--name",
            settings.container.as_str(),
            "--label",
        ]);
        run.push(format!("sbx.sandbox={}", config.id));
        run.extend(self.config.run_args.iter().cloned());
        run.extend(args([image.as_str(), "sleep", "infinity"]));
        engine
            .run("start container", &settings.container, &run, None)
            .await?;

        let init = args([
            "exec",
            settings.container.as_str(),
            "sh",
            "-c",
            r#"rm -rf "$1/.processes" && mkdir -p "$1/.processes" "$2""#,
            "sh",
            settings.data_dir.as_str(),
            settings.workdir.as_str(),
        ]);
        engine
            .run("prepare container", &settings.container, &init, None)
            .await?;

        debug!(container = %settings.container, image, "container sandbox ready");
        encode_driver_config(&config.id, &settings)
    }

    #[instrument(skip(self, config), fields(sandbox_id = %config.id))]
    async fn delete_sandbox(&self, config: &SandboxConfig) -> SandboxResult<()> {
        let settings = match &config.driver_config {
            Some(value) => decode_driver_config(&config.id, value.clone())?,
            None => self.default_settings(&config.id),
        };
        let engine = Engine::new(&settings.engine);

        let output = engine
            .output(&args(["rm", "-f", settings.container.as_str()]), None)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such container") {
                return Err(engine_failure("remove container", &settings.container, &output));
            }
        }

        if let Some(snapshot) = &settings.snapshot {
            let removed = engine
                .output(&args(["rmi", snapshot.as_str()]), None)
                .await?;
            if !removed.status.success() {
                warn!(snapshot, "failed to remove snapshot image");
            }
        }

        debug!(container = %settings.container, "container sandbox removed");
        Ok(())
    }

    async fn load_sandbox(
        &self,
        config: &SandboxConfig,
        options: LoadOptions,
    ) -> SandboxResult<Arc<dyn Sandbox>> {
        let value = ensure_driver_config(self, config, options).await?;
        let settings: ContainerSandboxSettings = decode_driver_config(&config.id, value)?;
        Ok(Arc::new(ContainerSandbox::new(
            config.id.clone(),
            config.meta.clone(),
            settings,
        )))
    }
}

/// Status lines printed by the status script.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordStatus {
    exit_code: Option<i32>,
    signal: Option<String>,
    meta: Option<ProcessMetadata>,
    output: Vec<u8>,
}

fn parse_status(raw: &[u8]) -> RecordStatus {
    let mut parts = raw.splitn(4, |b| *b == b'\n');
    let mut next_line = || {
        parts
            .next()
            .map(|line| String::from_utf8_lossy(line).trim().to_string())
            .unwrap_or_default()
    };

    let exit_code = next_line().parse().ok();
    let signal = Some(next_line()).filter(|s| !s.is_empty());
    let meta = serde_json::from_str(&next_line()).ok();

    RecordStatus {
        exit_code,
        signal,
        meta,
        output: parts.next().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

/// A sandbox inside a long-lived container.
#[derive(Debug, Clone)]
pub struct ContainerSandbox {
    id: String,
    meta: SandboxMetadata,
    settings: ContainerSandboxSettings,
    engine: Engine,
}

impl ContainerSandbox {
    #[must_use]
    pub fn new(id: String, meta: SandboxMetadata, settings: ContainerSandboxSettings) -> Self {
        let engine = Engine::new(&settings.engine);
        Self {
            id,
            meta,
            settings,
            engine,
        }
    }

    #[must_use]
    pub fn container(&self) -> &str {
        &self.settings.container
    }

    fn record_dir(&self, process_id: &str) -> Option<String> {
        let valid = !process_id.is_empty()
            && process_id != "."
            && process_id != ".."
            && !process_id.contains('/');
        valid.then(|| format!("{}/{PROCESSES_DIR}/{process_id}", self.settings.data_dir))
    }

    fn exec_args<'a, I>(&self, flags: &[&str], command: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut all = vec![String::from("exec")];
        all.extend(flags.iter().map(|f| (*f).to_string()));
        all.push(self.settings.container.clone());
        all.extend(command.into_iter().map(str::to_string));
        all
    }

    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> SandboxResult<()> {
        let target = path.to_string_lossy();
        let call = self.exec_args(&["-i"], ["sh", "-c", WRITE_SCRIPT, "sh", target.as_ref()]);
        self.engine
            .run("write file", &target, &call, Some(bytes))
            .await
            .map(|_| ())
    }

    async fn status(&self, process_id: &str, with_output: bool) -> SandboxResult<RecordStatus> {
        let not_found = || SandboxError::ProcessNotFound {
            id: process_id.to_string(),
        };
        let dir = self.record_dir(process_id).ok_or_else(not_found)?;
        let flag = if with_output { "1" } else { "0" };
        let call = self.exec_args(&[], ["sh", "-c", STATUS_SCRIPT, "sh", dir.as_str(), flag]);

        let output = self.engine.output(&call, None).await?;
        match output.status.code() {
            Some(0) => Ok(parse_status(&output.stdout)),
            Some(EXIT_NO_RECORD) => Err(not_found()),
            _ => Err(engine_failure("read process record", &dir, &output)),
        }
    }

    async fn wait_for_pid(&self, dir: &str) -> bool {
        let pid_file = format!("{dir}/{PID_FILE}");
        for _ in 0..PID_POLL_ATTEMPTS {
            let call = self.exec_args(&[], ["test", "-s", pid_file.as_str()]);
            let output = self.engine.output(&call, None).await;
            if matches!(output, Ok(ref o) if o.status.success()) {
                return true;
            }
            tokio::time::sleep(PID_POLL_INTERVAL).await;
        }
        false
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn meta(&self) -> &SandboxMetadata {
        &self.meta
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        resolve_sandbox_path(Path::new(&self.settings.workdir), path)
    }

    #[instrument(skip(self, options), fields(sandbox_id = %self.id))]
    async fn read_file(
        &self,
        path: &str,
        options: ReadOptions,
    ) -> SandboxResult<Option<FileContent>> {
        let absolute = self.resolve_path(path);
        let target = absolute.to_string_lossy();
        let call = self.exec_args(&[], ["cat", "--", target.as_ref()]);

        let output = self.engine.output(&call, None).await?;
        if output.status.success() {
            return Ok(Some(content::encode(&output.stdout, &options)));
        }

        if reports_absent(&output.stderr) {
            Ok(None)
        } else {
            Err(engine_failure("read file", &target, &output))
        }
    }

    #[instrument(skip(self, content, options), fields(sandbox_id = %self.id, bytes = content.len()))]
    async fn write_file(
        &self,
        path: &str,
        content: &str,
        options: WriteOptions,
    ) -> SandboxResult<()> {
        let bytes = content::decode(content, options.encoding)?;
        self.write_bytes(&self.resolve_path(path), &bytes).await
    }

    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    async fn delete_file(&self, path: &str) -> SandboxResult<()> {
        let absolute = self.resolve_path(path);
        let target = absolute.to_string_lossy();
        let call = self.exec_args(&[], ["rm", "-f", "--", target.as_ref()]);

        let output = self.engine.output(&call, None).await?;
        if output.status.success() || reports_absent(&output.stderr) {
            Ok(())
        } else {
            Err(engine_failure("delete file", &target, &output))
        }
    }

    #[instrument(skip(self, options), fields(sandbox_id = %self.id, cursor = ?options.cursor))]
    async fn readdir(&self, path: &str, options: ReadDirOptions) -> SandboxResult<DirPage> {
        let absolute = self.resolve_path(path);
        let target = absolute.to_string_lossy();
        let offset = parse_cursor(options.cursor.as_deref())?;
        let limit = effective_limit(options.limit);
        let recursive = if options.recursive { "1" } else { "0" };

        let call = self.exec_args(&[], ["sh", "-c", LIST_SCRIPT, "sh", target.as_ref(), recursive]);
        let stdout = self
            .engine
            .run("list directory", &target, &call, None)
            .await?;

        let records = parse_lines(&String::from_utf8_lossy(&stdout));
        let window: Vec<_> = match limit {
            Some(limit) => records.into_iter().skip(offset).take(limit + 1).collect(),
            None => records.into_iter().skip(offset).collect(),
        };
        Ok(paginate(window, &absolute, offset, limit))
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

        let dir = format!("{}/{PROCESSES_DIR}/{process_id}", self.settings.data_dir);
        let cwd = options
            .cwd
            .as_deref()
            .map_or_else(|| PathBuf::from(&self.settings.workdir), |c| self.resolve_path(c));
        let cwd = cwd.to_string_lossy().into_owned();

        let meta = ProcessMetadata::new(command, args, options.output_byte_limit).with_cwd(&cwd);
        let json = serde_json::to_vec(&meta).map_err(|e| {
            SandboxError::backend("serialize process metadata", dir.as_str(), e.to_string())
        })?;
        self.write_bytes(&PathBuf::from(format!("{dir}/{META_FILE}")), &json)
            .await?;

        let mut flags: Vec<String> = vec!["-d".into(), "-w".into(), cwd];
        for (key, value) in self.settings.env.iter().chain(options.env.iter()) {
            flags.push("-e".into());
            flags.push(format!("{key}={value}"));
        }
        let flag_refs: Vec<&str> = flags.iter().map(String::as_str).collect();
        let limit = options.output_byte_limit.to_string();
        let call = self.exec_args(
            &flag_refs,
            ["sh", "-c", SPAWN_SCRIPT, "sh", dir.as_str(), limit.as_str(), command]
                .into_iter()
                .chain(args.iter().map(String::as_str)),
        );
        self.engine.run("start process in", &self.settings.container, &call, None).await?;

        if !self.wait_for_pid(&dir).await {
            warn!("pid not recorded yet, kill will fall back to matching the command line");
        }
        debug!("process started");
        Ok(process_id)
    }

    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    async fn kill(&self, process_id: &str, signal: Option<&str>) -> SandboxResult<()> {
        let signal = parse_signal(signal.unwrap_or(DEFAULT_SIGNAL))?;
        let status = self.status(process_id, false).await?;
        if let Some(code) = status.exit_code {
            debug!(code, "process already exited, nothing to signal");
            return Ok(());
        }

        let dir = self.record_dir(process_id).unwrap_or_default();
        let pattern = status.meta.map(|m| m.command_pattern()).unwrap_or_default();
        let name = signal.as_str().trim_start_matches("SIG");
        let call = self.exec_args(&[], ["sh", "-c", KILL_SCRIPT, "sh", dir.as_str(), name, pattern.as_str()]);

        let output = self.engine.output(&call, None).await?;
        match output.status.code() {
            Some(0) | Some(EXIT_ALREADY_DONE) => Ok(()),
            Some(EXIT_NO_RECORD) => Err(SandboxError::ProcessNotFound {
                id: process_id.to_string(),
            }),
            _ => Err(engine_failure("signal process", &dir, &output)),
        }
    }

    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    async fn output(&self, process_id: &str) -> SandboxResult<ProcessOutput> {
        let status = self.status(process_id, true).await?;
        let limit = status.meta.as_ref().map_or(0, |m| m.output_byte_limit);
        let (output, cut) = content::cap_output(&status.output, limit);

        Ok(ProcessOutput {
            output,
            truncated: cut || status.meta.as_ref().is_some_and(|m| m.truncated),
            exit_code: status.exit_code.unwrap_or(EXIT_CODE_RUNNING),
            signal: status.signal,
        })
    }

    async fn exit_status(&self, process_id: &str) -> SandboxResult<Option<ExitInfo>> {
        let status = self.status(process_id, false).await?;
        Ok(status.exit_code.map(|exit_code| ExitInfo {
            exit_code,
            signal: status.signal,
        }))
    }

    #[instrument(skip(self), fields(sandbox_id = %self.id))]
    async fn release(&self, process_id: &str) -> SandboxResult<()> {
        let Some(dir) = self.record_dir(process_id) else {
            return Ok(());
        };
        let call = self.exec_args(&[], ["rm", "-rf", "--", dir.as_str()]);
        self.engine.run("release", &dir, &call, None).await.map(|_| ())
    }
}

/// True when an in-container tool failed only because the path is absent.
fn reports_absent(stderr: &[u8]) -> bool {
    let stderr = String::from_utf8_lossy(stderr);
    stderr.contains("No such file or directory") || stderr.contains("Not a directory")
}
