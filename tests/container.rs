//! Integration tests for the container driver.
//!
//! These need a running Docker daemon and pull `debian:bookworm-slim`, so
//! they are ignored by default. Run with `cargo test -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use sandbox_manager::driver::{ContainerDriver, ContainerDriverConfig};
use sandbox_manager::manager::{Manager, MemoryStore};
use sandbox_manager::sandbox::{
    ExecOptions, ReadDirOptions, ReadOptions, SandboxConfig, WaitOptions, WriteOptions,
};

fn test_manager() -> Manager {
    Manager::new(Arc::new(MemoryStore::new()))
        .with_driver(Arc::new(ContainerDriver::new(
            ContainerDriverConfig::default().with_name_prefix("sbx-test"),
        )))
        .with_default_driver("docker")
}

fn unique_id(tag: &str) -> String {
    format!("{tag}-{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_container_files_and_processes() {
    let manager = test_manager();
    let id = unique_id("files");

    let sandbox = manager
        .create_sandbox(SandboxConfig::new(id.as_str()))
        .await
        .expect("Failed to create container sandbox");

    sandbox
        .write_file("dir/a.txt", "alpha\n", WriteOptions::default())
        .await
        .expect("Failed to write");
    let read = sandbox
        .read_file("dir/a.txt", ReadOptions::default())
        .await
        .expect("Failed to read")
        .expect("File should exist");
    assert_eq!(read.content, "alpha\n");
    assert!(sandbox
        .read_file("missing.txt", ReadOptions::default())
        .await
        .expect("Failed to read")
        .is_none());

    let page = sandbox
        .readdir("dir", ReadDirOptions::default())
        .await
        .expect("Failed to list");
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].name, "a.txt");

    let process = sandbox
        .execute("cat", &["dir/a.txt".to_string()], ExecOptions::default())
        .await
        .expect("Failed to execute");
    let exit = sandbox
        .wait_with(&process, WaitOptions::default().with_timeout(Duration::from_secs(30)))
        .await
        .expect("Failed to wait");
    assert_eq!(exit.exit_code, 0);
    assert_eq!(
        sandbox.output(&process).await.expect("Failed to read output").output,
        "alpha\n"
    );

    sandbox.kill(&process, None).await.expect("Kill after exit must not fail");
    sandbox.release(&process).await.expect("Failed to release");
    assert!(sandbox.output(&process).await.is_err_and(|e| e.is_process_not_found()));

    manager.delete_sandbox(&id).await.expect("Failed to delete");
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_container_fork_copies_state() {
    let manager = test_manager();
    let parent_id = unique_id("parent");
    let child_id = unique_id("child");

    let parent = manager
        .create_sandbox(SandboxConfig::new(parent_id.as_str()))
        .await
        .expect("Failed to create parent");
    parent
        .write_file("f.txt", "original", WriteOptions::default())
        .await
        .expect("Failed to write");

    let child = manager
        .fork_sandbox(&parent_id, Some(child_id.clone()))
        .await
        .expect("Failed to fork");
    child
        .write_file("f.txt", "changed", WriteOptions::default())
        .await
        .expect("Failed to write");

    let parent_copy = parent
        .read_file("f.txt", ReadOptions::default())
        .await
        .expect("Failed to read")
        .expect("Parent file should exist");
    assert_eq!(parent_copy.content, "original");

    manager.delete_sandbox(&child_id).await.expect("Failed to delete child");
    manager.delete_sandbox(&parent_id).await.expect("Failed to delete parent");
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_container_delete_under_regular_file() {
    let manager = test_manager();
    let id = unique_id("rm");

    let sandbox = manager
        .create_sandbox(SandboxConfig::new(id.as_str()))
        .await
        .expect("Failed to create container sandbox");
    sandbox
        .write_file("plain.txt", "x", WriteOptions::default())
        .await
        .expect("Failed to write");

    sandbox
        .delete_file("plain.txt/inner")
        .await
        .expect("A path under a regular file is absent");
    assert!(sandbox
        .read_file("plain.txt/inner", ReadOptions::default())
        .await
        .expect("Failed to read")
        .is_none());

    manager.delete_sandbox(&id).await.expect("Failed to delete");
}
