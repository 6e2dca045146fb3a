//! Container engine abstraction.
//!
//! The engine client is held behind a trait (start/stop/exec/is-alive plus
//! image preparation and file upload) so the concrete engine is swappable:
//! [`DockerEngine`] talks to a Docker daemon, [`MemoryEngine`] simulates a
//! container in process for development and tests.

mod docker;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::runtime::RuntimeTemplate;

pub use docker::DockerEngine;
pub use memory::MemoryEngine;

/// Everything needed to create and start one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Concrete image reference (already resolved).
    pub image: String,
    /// `host:container:mode` bind strings.
    pub binds: Vec<String>,
    /// `KEY=value` environment entries.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: String,
}

/// Raw outcome of one in-container command execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Combined stdout/stderr, in arrival order.
    pub output: String,
    /// Exit code, absent when the process was terminated.
    pub exit_code: Option<i64>,
    /// Whether the wall-clock budget elapsed before completion.
    pub timed_out: bool,
}

/// Client for one container engine.
///
/// All methods are cheap to call concurrently for different containers;
/// serialization per container is the caller's concern.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Verifies the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Resolves a runtime template to a concrete image reference,
    /// pulling or building the image when it is missing locally.
    async fn prepare_image(&self, template: &RuntimeTemplate) -> Result<String>;

    /// Creates and starts a container, returning its engine reference.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String>;

    /// Runs a shell command inside a running container with a wall-clock
    /// budget. On timeout only the spawned process is terminated; the
    /// container keeps running and the captured output is returned.
    async fn exec(
        &self,
        container: &str,
        command: &str,
        working_dir: &str,
        timeout: Duration,
    ) -> Result<ExecOutput>;

    /// Extracts a tar archive into `dir` inside a running container.
    async fn upload(&self, container: &str, dir: &str, archive: Bytes) -> Result<()>;

    /// Whether the container exists and is running.
    async fn is_alive(&self, container: &str) -> Result<bool>;

    /// Stops a container and, when `remove` is set, deletes it.
    /// Already-gone containers are not an error.
    async fn stop_and_remove(&self, container: &str, remove: bool) -> Result<()>;
}
