//! Integration tests for the local driver and sandbox.
//!
//! Processes are supervised by the `sbx` binary built alongside these tests,
//! so they run real commands (`echo`, `sh`, `sleep`) on the host.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use sandbox_manager::driver::{CreateOptions, Driver, LoadOptions, LocalDriver, LocalDriverConfig};
use sandbox_manager::error::SandboxError;
use sandbox_manager::sandbox::{
    Encoding, ExecOptions, ReadDirOptions, ReadOptions, Sandbox, SandboxConfig, WaitOptions,
    WriteOptions,
};

fn test_driver(tmp: &TempDir) -> LocalDriver {
    LocalDriver::new(
        LocalDriverConfig::new(tmp.path().join("sandboxes"))
            .with_helper_path(env!("CARGO_BIN_EXE_sbx")),
    )
}

async fn provision(driver: &LocalDriver, config: SandboxConfig) -> Arc<dyn Sandbox> {
    let driver_config = driver
        .create_sandbox(&config, CreateOptions::default())
        .await
        .expect("Failed to create sandbox");
    let config = SandboxConfig {
        driver_config: Some(driver_config),
        ..config
    };
    driver
        .load_sandbox(&config, LoadOptions::default())
        .await
        .expect("Failed to load sandbox")
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn short_wait() -> WaitOptions {
    WaitOptions::default().with_timeout(Duration::from_secs(20))
}

/// Text written through the sandbox reads back unchanged.
#[tokio::test]
async fn test_text_round_trip() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("text")).await;

    let content = "first line\nsecond line\n";
    sandbox
        .write_file("dir/notes.txt", content, WriteOptions::default())
        .await
        .expect("Failed to write");

    let read = sandbox
        .read_file("dir/notes.txt", ReadOptions::default())
        .await
        .expect("Failed to read")
        .expect("File should exist");
    assert_eq!(read.content, content);
    assert_eq!(read.encoding, Encoding::Utf8);
}

/// Binary content survives a base64 round trip.
#[tokio::test]
async fn test_binary_round_trip() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("binary")).await;

    let bytes: Vec<u8> = (0u8..=255).collect();
    let encoded = STANDARD.encode(&bytes);
    sandbox
        .write_file(
            "blob.bin",
            &encoded,
            WriteOptions::default().with_encoding(Encoding::Base64),
        )
        .await
        .expect("Failed to write");

    let read = sandbox
        .read_file(
            "blob.bin",
            ReadOptions::new().with_encoding(Encoding::Base64),
        )
        .await
        .expect("Failed to read")
        .expect("File should exist");
    assert_eq!(read.content, encoded);
    assert_eq!(read.encoding, Encoding::Base64);
}

#[tokio::test]
async fn test_windowed_text_read() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("window")).await;

    sandbox
        .write_file("lines.txt", "a\nb\nc\nd\n", WriteOptions::default())
        .await
        .expect("Failed to write");

    let read = sandbox
        .read_file("lines.txt", ReadOptions::new().with_offset(2).with_limit(2))
        .await
        .expect("Failed to read")
        .expect("File should exist");
    assert_eq!(read.content, "b\nc\n");
}

#[tokio::test]
async fn test_missing_file_reads_none() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("missing")).await;

    let read = sandbox
        .read_file("nonexistent.txt", ReadOptions::default())
        .await
        .expect("Missing file must not be an error");
    assert!(read.is_none());
}

#[tokio::test]
async fn test_delete_file_twice() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("delete")).await;

    sandbox
        .write_file("gone.txt", "x", WriteOptions::default())
        .await
        .expect("Failed to write");
    sandbox.delete_file("gone.txt").await.expect("First delete failed");
    sandbox.delete_file("gone.txt").await.expect("Second delete failed");

    sandbox
        .write_file("plain.txt", "x", WriteOptions::default())
        .await
        .expect("Failed to write");
    sandbox
        .delete_file("plain.txt/inner")
        .await
        .expect("A path under a regular file is absent");

    let read = sandbox
        .read_file("gone.txt", ReadOptions::default())
        .await
        .expect("Failed to read");
    assert!(read.is_none());
}

/// Following cursors yields the full listing exactly once for every page size.
#[tokio::test]
async fn test_pagination_covers_listing() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("pages")).await;

    for i in 0..7 {
        sandbox
            .write_file(&format!("file-{i}.txt"), "x", WriteOptions::default())
            .await
            .expect("Failed to write");
    }

    let full: Vec<String> = sandbox
        .readdir(".", ReadDirOptions::default())
        .await
        .expect("Failed to list")
        .entries
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(full.len(), 7);

    for limit in 1..=7 {
        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut options = ReadDirOptions::default().with_limit(limit);
            if let Some(c) = cursor.take() {
                options = options.with_cursor(c);
            }
            let page = sandbox.readdir(".", options).await.expect("Failed to list page");
            assert!(page.entries.len() <= limit);
            seen.extend(page.entries.into_iter().map(|e| e.name));
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, full, "page size {limit}");
        let unique: BTreeSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), seen.len(), "duplicates with page size {limit}");
    }
}

#[tokio::test]
async fn test_recursive_listing_and_missing_dir() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("tree")).await;

    sandbox
        .write_file("src/lib.rs", "// lib", WriteOptions::default())
        .await
        .expect("Failed to write");

    let shallow = sandbox
        .readdir(".", ReadDirOptions::default())
        .await
        .expect("Failed to list");
    let names: Vec<_> = shallow.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["src"]);
    assert!(shallow.entries[0].is_directory);

    let deep = sandbox
        .readdir(".", ReadDirOptions::default().with_recursive(true))
        .await
        .expect("Failed to list");
    let file = deep
        .entries
        .iter()
        .find(|e| e.name == "src/lib.rs")
        .expect("Nested file should be listed");
    assert!(file.is_file);
    assert_eq!(file.size, 6);

    let missing = sandbox
        .readdir("no/such/dir", ReadDirOptions::default())
        .await
        .expect("Missing dir must not be an error");
    assert!(missing.entries.is_empty());
    assert!(missing.cursor.is_none());
}

/// execute, wait, output, release and the NotFound afterwards.
#[tokio::test]
async fn test_process_lifecycle() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("proc")).await;

    let id = sandbox
        .execute("echo", &args(&["hi"]), ExecOptions::default())
        .await
        .expect("Failed to execute");

    let exit = sandbox.wait_with(&id, short_wait()).await.expect("Failed to wait");
    assert_eq!(exit.exit_code, 0);
    assert!(exit.signal.is_none());

    let output = sandbox.output(&id).await.expect("Failed to read output");
    assert!(output.output.contains("hi"), "output: {:?}", output.output);
    assert_eq!(output.exit_code, 0);
    assert!(!output.truncated);

    sandbox.release(&id).await.expect("Failed to release");
    let err = sandbox.output(&id).await.expect_err("Released process must be gone");
    assert!(err.is_process_not_found());

    sandbox.release(&id).await.expect("Second release should succeed");
}

#[tokio::test]
async fn test_nonzero_exit_and_stderr_captured() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("exit")).await;

    let id = sandbox
        .execute("sh", &args(&["-c", "echo oops >&2; exit 3"]), ExecOptions::default())
        .await
        .expect("Failed to execute");

    let exit = sandbox.wait_with(&id, short_wait()).await.expect("Failed to wait");
    assert_eq!(exit.exit_code, 3);
    let output = sandbox.output(&id).await.expect("Failed to read output");
    assert!(output.output.contains("oops"));
}

#[tokio::test]
async fn test_env_and_cwd() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("env")).await;

    sandbox
        .write_file("sub/marker", "", WriteOptions::default())
        .await
        .expect("Failed to write");

    let options = ExecOptions::new().with_cwd("sub").with_env("GREETING", "bonjour");
    let id = sandbox
        .execute("sh", &args(&["-c", "echo $GREETING; ls"]), options)
        .await
        .expect("Failed to execute");

    sandbox.wait_with(&id, short_wait()).await.expect("Failed to wait");
    let output = sandbox.output(&id).await.expect("Failed to read output");
    assert!(output.output.contains("bonjour"));
    assert!(output.output.contains("marker"));
}

#[tokio::test]
async fn test_missing_command_exits_127() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("enoent")).await;

    let id = sandbox
        .execute("sbx-test-no-such-command", &[], ExecOptions::default())
        .await
        .expect("Spawn failures are reported through the exit code");

    let exit = sandbox.wait_with(&id, short_wait()).await.expect("Failed to wait");
    assert_eq!(exit.exit_code, 127);
}

#[tokio::test]
async fn test_kill_after_exit_is_tolerated() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("late-kill")).await;

    let id = sandbox
        .execute("true", &[], ExecOptions::default())
        .await
        .expect("Failed to execute");
    sandbox.wait_with(&id, short_wait()).await.expect("Failed to wait");

    sandbox.kill(&id, None).await.expect("Kill after exit must not fail");
    sandbox
        .kill(&id, Some("SIGKILL"))
        .await
        .expect("Repeated kill must not fail");
    assert_eq!(sandbox.output(&id).await.expect("output").exit_code, 0);
}

#[tokio::test]
async fn test_kill_running_process() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("kill")).await;

    let id = sandbox
        .execute("sleep", &args(&["30"]), ExecOptions::default())
        .await
        .expect("Failed to execute");
    assert!(sandbox.exit_status(&id).await.expect("status").is_none());
    assert_eq!(sandbox.output(&id).await.expect("output").exit_code, -1);

    sandbox.kill(&id, None).await.expect("Failed to kill");
    let exit = sandbox.wait_with(&id, short_wait()).await.expect("Failed to wait");
    assert_ne!(exit.exit_code, 0);
    assert_eq!(exit.signal.as_deref(), Some("SIGTERM"));
}

#[tokio::test]
async fn test_output_limit_truncates() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("trunc")).await;

    let options = ExecOptions::new().with_output_byte_limit(100);
    let id = sandbox
        .execute(
            "sh",
            &args(&["-c", "i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done"]),
            options,
        )
        .await
        .expect("Failed to execute");

    sandbox.wait_with(&id, short_wait()).await.expect("Failed to wait");
    let output = sandbox.output(&id).await.expect("Failed to read output");
    assert!(output.truncated);
    assert!(output.output.len() <= 100, "got {} bytes", output.output.len());

    // A limit that splits a multi-byte character still bounds the output.
    let id = sandbox
        .execute(
            "printf",
            &args(&["ééééé"]),
            ExecOptions::new().with_output_byte_limit(3),
        )
        .await
        .expect("Failed to execute");
    sandbox.wait_with(&id, short_wait()).await.expect("Failed to wait");
    let output = sandbox.output(&id).await.expect("Failed to read output");
    assert!(output.truncated);
    assert!(output.output.len() <= 3, "got {:?}", output.output);
    assert_eq!(output.output, "é");
}

#[tokio::test]
async fn test_wait_timeout() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("timeout")).await;

    let id = sandbox
        .execute("sleep", &args(&["30"]), ExecOptions::default())
        .await
        .expect("Failed to execute");

    let result = sandbox
        .wait_with(
            &id,
            WaitOptions::default()
                .with_timeout(Duration::from_millis(300))
                .with_poll_interval(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(result, Err(SandboxError::Timeout { .. })));

    sandbox.kill(&id, Some("KILL")).await.expect("Failed to kill");
}

#[tokio::test]
async fn test_wait_cancelled() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("cancel")).await;

    let id = sandbox
        .execute("sleep", &args(&["30"]), ExecOptions::default())
        .await
        .expect("Failed to execute");

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let result = sandbox
        .wait_with(&id, short_wait().with_cancel(token))
        .await;
    assert!(matches!(result, Err(SandboxError::Cancelled { .. })));

    sandbox.kill(&id, Some("KILL")).await.expect("Failed to kill");
}

#[tokio::test]
async fn test_unknown_process_id() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("unknown")).await;

    assert!(sandbox.output("proc-0-none").await.is_err_and(|e| e.is_process_not_found()));
    assert!(sandbox.kill("proc-0-none", None).await.is_err_and(|e| e.is_process_not_found()));
    assert!(sandbox.wait("proc-0-none").await.is_err_and(|e| e.is_process_not_found()));
}

/// A fork starts with the parent's files and diverges afterwards.
#[tokio::test]
async fn test_fork_copies_state() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let parent = provision(&driver, SandboxConfig::new("parent")).await;

    parent
        .write_file("f.txt", "original", WriteOptions::default())
        .await
        .expect("Failed to write");

    let child = provision(&driver, SandboxConfig::new("child").with_parent_id("parent")).await;
    let copied = child
        .read_file("f.txt", ReadOptions::default())
        .await
        .expect("Failed to read")
        .expect("Fork should contain the parent's file");
    assert_eq!(copied.content, "original");

    child
        .write_file("f.txt", "changed", WriteOptions::default())
        .await
        .expect("Failed to write");
    let untouched = parent
        .read_file("f.txt", ReadOptions::default())
        .await
        .expect("Failed to read")
        .expect("Parent file should exist");
    assert_eq!(untouched.content, "original");
}

/// Killing without a recorded PID signals the command, not its supervisor.
#[tokio::test]
async fn test_kill_without_pid_reaches_command() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);
    let sandbox = provision(&driver, SandboxConfig::new("pidless")).await;

    let id = sandbox
        .execute("sleep", &args(&["41.5"]), ExecOptions::default())
        .await
        .expect("Failed to execute");
    let pid_file = tmp
        .path()
        .join("sandboxes/pidless/.processes")
        .join(&id)
        .join("pid.txt");
    std::fs::remove_file(&pid_file).expect("Failed to remove pid file");

    sandbox.kill(&id, None).await.expect("Failed to kill");
    let exit = sandbox
        .wait_with(&id, short_wait())
        .await
        .expect("Supervisor should record the exit");
    assert_ne!(exit.exit_code, 0);
    assert_eq!(exit.signal.as_deref(), Some("SIGTERM"));
}

/// Deleting a sandbox with live processes removes everything.
#[tokio::test]
async fn test_delete_with_running_processes() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let driver = test_driver(&tmp);

    for round in 0..3 {
        let config = SandboxConfig::new(format!("busy-{round}"));
        let sandbox = provision(&driver, config.clone()).await;
        for _ in 0..4 {
            sandbox
                .execute("sh", &args(&["-c", "echo start; sleep 30"]), ExecOptions::default())
                .await
                .expect("Failed to execute");
        }

        driver
            .delete_sandbox(&config)
            .await
            .expect("Delete with running processes should succeed");
        assert!(!tmp.path().join(format!("sandboxes/busy-{round}")).exists());
    }
}
