//! Integration tests for the manager over the local driver and file index.

use std::sync::Arc;

use tempfile::TempDir;

use sandbox_manager::driver::{LocalDriver, LocalDriverConfig};
use sandbox_manager::error::ManagerError;
use sandbox_manager::manager::{FileStore, Manager};
use sandbox_manager::sandbox::{ReadOptions, SandboxConfig, WriteOptions};

fn test_manager(tmp: &TempDir) -> Manager {
    let store = FileStore::open(tmp.path().join("index")).expect("Failed to open index");
    Manager::new(Arc::new(store))
        .with_driver(Arc::new(LocalDriver::new(
            LocalDriverConfig::new(tmp.path().join("sandboxes"))
                .with_helper_path(env!("CARGO_BIN_EXE_sbx")),
        )))
        .with_default_driver("local")
}

async fn read_text(manager: &Manager, id: &str, path: &str) -> Option<String> {
    manager
        .load_sandbox(id)
        .await
        .expect("Failed to load sandbox")
        .read_file(path, ReadOptions::default())
        .await
        .expect("Failed to read")
        .map(|c| c.content)
}

#[tokio::test]
async fn test_duplicate_id_rejected() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let manager = test_manager(&tmp);

    manager
        .create_sandbox(SandboxConfig::new("a"))
        .await
        .expect("First create failed");
    let result = manager.create_sandbox(SandboxConfig::new("a")).await;
    assert!(matches!(result, Err(ManagerError::AlreadyExists { .. })));
}

#[tokio::test]
async fn test_unknown_sandbox_not_found() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let manager = test_manager(&tmp);

    let result = manager.load_sandbox("never-created").await;
    assert!(matches!(result, Err(ManagerError::NotFound { .. })));
}

#[tokio::test]
async fn test_records_survive_new_manager() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    {
        let manager = test_manager(&tmp);
        let sandbox = manager
            .create_sandbox(SandboxConfig::new("durable").with_meta("owner", "ci"))
            .await
            .expect("Failed to create");
        sandbox
            .write_file("keep.txt", "kept", WriteOptions::default())
            .await
            .expect("Failed to write");
    }

    let manager = test_manager(&tmp);
    let record = manager.get_config("durable").await.expect("Record should persist");
    assert_eq!(record.driver_name.as_deref(), Some("local"));
    assert_eq!(record.meta.get("owner"), Some(&serde_json::json!("ci")));
    assert_eq!(read_text(&manager, "durable", "keep.txt").await.as_deref(), Some("kept"));
}

#[tokio::test]
async fn test_fork_inherits_files_driver_and_meta() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let manager = test_manager(&tmp);

    let parent = manager
        .create_sandbox(SandboxConfig::new("base").with_meta("tier", "gold"))
        .await
        .expect("Failed to create parent");
    parent
        .write_file("f.txt", "v1", WriteOptions::default())
        .await
        .expect("Failed to write");

    let fork = manager
        .fork_sandbox("base", Some("branch".to_string()))
        .await
        .expect("Failed to fork");
    assert_eq!(fork.id(), "branch");
    assert_eq!(fork.meta().get("tier"), Some(&serde_json::json!("gold")));

    fork.write_file("f.txt", "v2", WriteOptions::default())
        .await
        .expect("Failed to write");
    assert_eq!(read_text(&manager, "base", "f.txt").await.as_deref(), Some("v1"));
    assert_eq!(read_text(&manager, "branch", "f.txt").await.as_deref(), Some("v2"));

    let record = manager.get_config("branch").await.expect("Fork record missing");
    assert_eq!(record.parent_id.as_deref(), Some("base"));
}

#[tokio::test]
async fn test_fork_generates_id_and_requires_parent() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let manager = test_manager(&tmp);

    manager
        .create_sandbox(SandboxConfig::new("origin"))
        .await
        .expect("Failed to create");
    let fork = manager.fork_sandbox("origin", None).await.expect("Failed to fork");
    assert!(fork.id().starts_with("fork-"));

    let result = manager.fork_sandbox("nobody", None).await;
    assert!(matches!(result, Err(ManagerError::NotFound { .. })));
}

#[tokio::test]
async fn test_recreate_resets_contents() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let manager = test_manager(&tmp);

    let sandbox = manager
        .create_sandbox(SandboxConfig::new("reset"))
        .await
        .expect("Failed to create");
    sandbox
        .write_file("scratch.txt", "temp", WriteOptions::default())
        .await
        .expect("Failed to write");

    manager.recreate_sandbox("reset").await.expect("Failed to recreate");
    assert!(read_text(&manager, "reset", "scratch.txt").await.is_none());
    assert!(manager.get_config("reset").await.is_ok());
}

#[tokio::test]
async fn test_delete_removes_record_and_is_idempotent() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let manager = test_manager(&tmp);

    manager
        .create_sandbox(SandboxConfig::new("doomed"))
        .await
        .expect("Failed to create");
    manager.delete_sandbox("doomed").await.expect("Delete failed");
    manager.delete_sandbox("doomed").await.expect("Second delete failed");

    assert!(matches!(
        manager.load_sandbox("doomed").await,
        Err(ManagerError::NotFound { .. })
    ));
    assert!(!tmp.path().join("sandboxes/doomed").exists());

    manager
        .create_sandbox(SandboxConfig::new("doomed"))
        .await
        .expect("Id should be reusable after delete");
}

#[tokio::test]
async fn test_concurrent_create_single_winner() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let manager = Arc::new(test_manager(&tmp));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.create_sandbox(SandboxConfig::new("race")).await.is_ok()
        }));
    }

    let mut created = 0;
    for handle in handles {
        if handle.await.expect("Task panicked") {
            created += 1;
        }
    }
    assert_eq!(created, 1);
}

#[tokio::test]
async fn test_list_sandboxes() {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let manager = test_manager(&tmp);

    for id in ["zeta", "alpha"] {
        manager
            .create_sandbox(SandboxConfig::new(id))
            .await
            .expect("Failed to create");
    }
    let ids: Vec<_> = manager
        .list_sandboxes()
        .await
        .expect("Failed to list")
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec!["alpha", "zeta"]);
}
