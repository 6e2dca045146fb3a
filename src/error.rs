//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use std::path::Path;

/// Errors that can occur while planning, provisioning, or using a sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A requested path resolves outside its declared root.
    #[error("path escapes the sandbox root: {path}")]
    PathEscape { path: String },

    /// Two mounts target the same container path.
    #[error("duplicate container mount target: {container_path}")]
    MountConflict { container_path: String },

    /// Building or pulling the runtime image failed.
    #[error("runtime image build failed: {message}")]
    RuntimeBuild { message: String },

    /// The container failed to start or was found dead on resume.
    /// The caller must request a fresh sandbox.
    #[error("sandbox is unavailable: {message}")]
    SandboxUnavailable { message: String },

    /// The container engine cannot be reached at all.
    #[error("container engine is unreachable: {message}")]
    EngineUnreachable { message: String },

    /// A file or directory does not exist inside the sandbox.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// Host filesystem operation failed.
    #[error("filesystem error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    /// Creates a `PathEscape` error.
    pub fn path_escape(path: impl AsRef<Path>) -> Self {
        Self::PathEscape {
            path: path.as_ref().display().to_string(),
        }
    }

    /// Creates a `MountConflict` error.
    pub fn mount_conflict(container_path: impl Into<String>) -> Self {
        Self::MountConflict {
            container_path: container_path.into(),
        }
    }

    /// Creates a `RuntimeBuild` error.
    pub fn runtime_build(message: impl Into<String>) -> Self {
        Self::RuntimeBuild {
            message: message.into(),
        }
    }

    /// Creates a `SandboxUnavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::SandboxUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `EngineUnreachable` error.
    pub fn engine_unreachable(message: impl Into<String>) -> Self {
        Self::EngineUnreachable {
            message: message.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Wraps a host I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns true if this is a path-escape rejection.
    pub fn is_path_escape(&self) -> bool {
        matches!(self, Self::PathEscape { .. })
    }

    /// Returns true if this is a mount conflict.
    pub fn is_mount_conflict(&self) -> bool {
        matches!(self, Self::MountConflict { .. })
    }

    /// Returns true if the sandbox must be discarded and re-requested.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::SandboxUnavailable { .. })
    }

    /// Returns true if the container engine itself is unreachable.
    pub fn is_engine_unreachable(&self) -> bool {
        matches!(self, Self::EngineUnreachable { .. })
    }

    /// Returns true if this is a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
