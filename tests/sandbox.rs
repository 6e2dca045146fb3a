//! Integration tests for the public sandbox API.
//!
//! Everything runs against the in-memory engine, so these tests verify the
//! whole path from session manager through mounts and lifecycle down to
//! command execution without requiring a container engine on the host.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tempfile::TempDir;
use workcell::{
    discovery, MemoryEngine, SandboxState, SessionKey, SessionManager, WorkcellConfig,
};

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("workcell=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn config_in(root: &TempDir) -> WorkcellConfig {
    WorkcellConfig {
        uploads_root: root.path().join("uploads").display().to_string(),
        intermediate_root: root.path().join("intermediate").display().to_string(),
        shared_resources_root: root.path().join("skills").display().to_string(),
        ..WorkcellConfig::default()
    }
}

fn manager_in(root: &TempDir) -> Result<SessionManager> {
    let engine = Arc::new(MemoryEngine::new());
    Ok(SessionManager::new(engine, config_in(root))?)
}

// -----------------------------------------------------------------------------
// End-to-end flow
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_write_then_execute_roundtrip() -> Result<()> {
    init_tracing();
    let root = TempDir::new()?;
    let manager = manager_in(&root)?;
    let key = SessionKey::new("1", "1")?;

    let sandbox = manager.get_or_create(&key, None).await?;

    // Host directories are derived and created by the mount planner.
    assert!(root.path().join("uploads/1/1").is_dir());
    assert!(root.path().join("intermediate/1/1").is_dir());

    sandbox.write("/workspace/intermediate/out.txt", "hi").await?;
    let result = sandbox.execute("cat intermediate/out.txt", None).await?;

    assert_eq!(result.exit_code, Some(0));
    assert!(result.output.contains("hi"));
    assert!(!result.timed_out);
    assert!(!result.truncated);

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_timeout_is_recovered_locally() -> Result<()> {
    let root = TempDir::new()?;
    let manager = manager_in(&root)?;
    let key = SessionKey::new("1", "1")?;

    let sandbox = manager.get_or_create(&key, None).await?;

    let start = Instant::now();
    let result = sandbox
        .execute("sleep 5", Some(Duration::from_millis(100)))
        .await?;
    assert!(result.timed_out);
    assert!(start.elapsed() < Duration::from_secs(2), "timeout must not wait out the sleep");

    // The sandbox remains usable after a timeout.
    let follow_up = sandbox.execute("echo recovered", None).await?;
    assert_eq!(follow_up.exit_code, Some(0));
    assert!(follow_up.output.contains("recovered"));

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_path_escape_is_rejected_end_to_end() -> Result<()> {
    let root = TempDir::new()?;
    let manager = manager_in(&root)?;
    let key = SessionKey::new("1", "1")?;

    let sandbox = manager.get_or_create(&key, None).await?;
    let err = sandbox.read("../../etc/passwd").await.unwrap_err();
    assert!(err.is_path_escape());

    // Identifiers are validated before any host directory is derived.
    assert!(SessionKey::new("../evil", "1").is_err());

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_stop_twice_is_safe() -> Result<()> {
    let root = TempDir::new()?;
    let manager = manager_in(&root)?;
    let key = SessionKey::new("1", "1")?;

    let sandbox = manager.get_or_create(&key, None).await?;
    sandbox.execute("echo hi", None).await?;

    sandbox.stop().await?;
    assert_eq!(sandbox.state(), SandboxState::Stopped);
    sandbox.stop().await?;
    assert_eq!(sandbox.state(), SandboxState::Stopped);

    // The manager hands out a fresh sandbox afterwards.
    let replacement = manager.get_or_create(&key, None).await?;
    assert_ne!(replacement.id(), sandbox.id());
    let result = replacement.execute("echo hi", None).await?;
    assert_eq!(result.exit_code, Some(0));

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_callers_share_one_sandbox() -> Result<()> {
    let root = TempDir::new()?;
    let manager = Arc::new(manager_in(&root)?);
    let key = SessionKey::new("1", "1")?;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = manager.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            manager.get_or_create(&key, None).await.unwrap().id().to_string()
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await?);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "all callers must observe the same sandbox");
    assert_eq!(manager.session_count().await, 1);

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_idle_reaper_evicts_in_background() -> Result<()> {
    let root = TempDir::new()?;
    let engine = Arc::new(MemoryEngine::new());
    let config = WorkcellConfig {
        idle_timeout_secs: 1,
        ..config_in(&root)
    };
    let manager = SessionManager::new(engine, config)?;
    let key = SessionKey::new("1", "1")?;

    let sandbox = manager.get_or_create(&key, None).await?;
    sandbox.execute("echo hi", None).await?;

    manager.start_idle_reaper(Duration::from_millis(50));

    // Wait past the idle timeout plus a few scan intervals.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(manager.session_count().await, 0);
    assert_eq!(sandbox.state(), SandboxState::Stopped);

    manager.stop_idle_reaper().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_counts_stopped_sandboxes() -> Result<()> {
    let root = TempDir::new()?;
    let manager = manager_in(&root)?;

    for session in ["a", "b"] {
        let key = SessionKey::new("1", session)?;
        let sandbox = manager.get_or_create(&key, None).await?;
        sandbox.execute("echo hi", None).await?;
    }

    assert_eq!(manager.shutdown().await, 2);
    assert_eq!(manager.session_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_discovery_sees_written_files() -> Result<()> {
    let root = TempDir::new()?;
    std::fs::create_dir_all(root.path().join("skills"))?;
    let manager = manager_in(&root)?;
    let key = SessionKey::new("1", "1")?;

    let sandbox = manager.get_or_create(&key, None).await?;
    sandbox.write("uploads/data.csv", "a,b\n1,2\n").await?;
    sandbox.write("intermediate/out.txt", "done").await?;

    let files = discovery::discover_files(&sandbox).await?;
    assert!(files.contains(&"/workspace/uploads/data.csv".to_string()));
    assert!(files.contains(&"/workspace/intermediate/out.txt".to_string()));

    let listing = discovery::list_directories(&sandbox).await?;
    assert_eq!(listing["uploads"], vec!["data.csv".to_string()]);
    assert_eq!(listing["intermediate"], vec!["out.txt".to_string()]);
    assert!(listing.contains_key("skills"));

    let info = discovery::file_info(&sandbox, "/workspace/uploads/data.csv")
        .await?
        .expect("file should exist");
    assert_eq!(info.size, 8);

    manager.shutdown().await;
    Ok(())
}
