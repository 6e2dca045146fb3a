//! Containerized execution sandboxes with session lifecycle management.
//!
//! This crate provisions, reuses, and reclaims isolated execution
//! environments for a multi-tenant caller. Each tenant/session identity
//! maps to at most one live [`Sandbox`], a container-backed environment
//! exposing file operations (`list`/`read`/`write`/`edit`/`glob`/`grep`)
//! and command execution with enforced timeouts. Containers start lazily
//! on first use and are reclaimed automatically once idle.
//!
//! The container engine is abstracted behind [`ContainerEngine`]:
//! [`DockerEngine`] talks to a Docker daemon, [`MemoryEngine`] simulates
//! containers in process for development and tests.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use workcell::{DockerEngine, SessionKey, SessionManager, WorkcellConfig};
//!
//! # async fn run() -> workcell::Result<()> {
//! let engine = Arc::new(DockerEngine::connect().await?);
//! let manager = SessionManager::new(engine, WorkcellConfig::default())?;
//! manager.start_idle_reaper(Duration::from_secs(60));
//!
//! let key = SessionKey::new("tenant-7", "session-42")?;
//! let sandbox = manager.get_or_create(&key, None).await?;
//!
//! sandbox.write("intermediate/script.py", "print('hi')").await?;
//! let result = sandbox.execute("python intermediate/script.py", None).await?;
//! assert_eq!(result.exit_code, Some(0));
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod mounts;
pub mod paths;
pub mod runtime;
pub mod sandbox;
pub mod session;

pub use config::{RuntimeSelection, WorkcellConfig};
pub use engine::{ContainerEngine, ContainerSpec, DockerEngine, ExecOutput, MemoryEngine};
pub use error::{Result, SandboxError};
pub use mounts::{BaseDirs, MountMode, MountSpec};
pub use runtime::{RuntimeResolver, RuntimeTemplate};
pub use sandbox::{
    EditResult, ExecuteResult, FileInfo, GrepMatch, Sandbox, SandboxOptions, SandboxState,
};
pub use session::{SessionKey, SessionManager, SessionSummary};
