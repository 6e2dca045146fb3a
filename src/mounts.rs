//! Mount planning for per-tenant sandbox volumes.
//!
//! Maps a tenant/session identity onto an ordered list of host-to-container
//! bind mounts and creates the backing host directories idempotently. The
//! planner produces values; it never retains them.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::paths::validate_component;

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// Read-only inside the container.
    ReadOnly,
    /// Read-write inside the container.
    ReadWrite,
}

impl MountMode {
    /// Docker bind-option spelling of this mode.
    pub fn as_bind_option(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

/// One host-directory-to-container-path binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Absolute path on the host.
    pub host_path: PathBuf,
    /// Absolute path inside the container.
    pub container_path: String,
    /// Access mode.
    pub mode: MountMode,
}

impl MountSpec {
    /// Renders the `host:container:mode` bind string the engine consumes.
    pub fn bind_string(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            self.mode.as_bind_option()
        )
    }
}

/// The three base directories mounts are derived from.
#[derive(Debug, Clone)]
pub struct BaseDirs {
    /// Root under which per-tenant upload directories live.
    pub uploads_root: PathBuf,
    /// Root under which per-tenant scratch directories live.
    pub intermediate_root: PathBuf,
    /// Optional shared read-only resources directory.
    pub shared_resources_root: PathBuf,
}

/// Plans the mount list for one tenant/session.
///
/// Order is deterministic: uploads, intermediate, shared. The uploads mount
/// uses `upload_path` when it is supplied and exists; otherwise the
/// conventional `{uploads_root}/{tenant}/{session}` directory is derived and
/// created. The intermediate scratch directory is always derived and
/// created. The shared directory is mounted read-only only when it exists.
///
/// # Errors
///
/// Returns `PathEscape` for invalid identifiers, `Io` when a host directory
/// cannot be created, and `MountConflict` when two mounts target the same
/// container path.
pub fn plan(
    tenant_id: &str,
    session_id: &str,
    upload_path: Option<&Path>,
    base_dirs: &BaseDirs,
    work_dir: &str,
) -> Result<Vec<MountSpec>> {
    let tenant = validate_component(tenant_id)?;
    let session = validate_component(session_id)?;

    let mut mounts = Vec::with_capacity(3);

    let uploads_host = match upload_path {
        Some(custom) if custom.exists() => custom.to_path_buf(),
        _ => {
            let derived = base_dirs.uploads_root.join(tenant).join(session);
            ensure_dir(&derived)?;
            derived
        }
    };
    mounts.push(MountSpec {
        host_path: uploads_host,
        container_path: format!("{work_dir}/uploads"),
        mode: MountMode::ReadWrite,
    });

    let intermediate_host = base_dirs.intermediate_root.join(tenant).join(session);
    ensure_dir(&intermediate_host)?;
    mounts.push(MountSpec {
        host_path: intermediate_host,
        container_path: format!("{work_dir}/intermediate"),
        mode: MountMode::ReadWrite,
    });

    if base_dirs.shared_resources_root.is_dir() {
        let shared_name = base_dirs
            .shared_resources_root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("shared");
        mounts.push(MountSpec {
            host_path: base_dirs.shared_resources_root.clone(),
            container_path: format!("{work_dir}/{shared_name}"),
            mode: MountMode::ReadOnly,
        });
    }

    let mut targets = HashSet::new();
    for mount in &mounts {
        if !targets.insert(mount.container_path.as_str()) {
            return Err(SandboxError::mount_conflict(mount.container_path.clone()));
        }
    }

    debug!(tenant, session, count = mounts.len(), "Planned sandbox mounts");
    Ok(mounts)
}

/// Creates a directory and its parents; succeeds if it already exists.
fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| SandboxError::io(format!("creating {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn base_dirs(root: &Path) -> BaseDirs {
        BaseDirs {
            uploads_root: root.join("uploads"),
            intermediate_root: root.join("intermediate"),
            shared_resources_root: root.join("skills"),
        }
    }

    #[test]
    fn test_plan_derives_and_creates_directories() {
        let dir = tempdir().unwrap();
        let dirs = base_dirs(dir.path());

        let mounts = plan("7", "42", None, &dirs, "/workspace").unwrap();

        assert_eq!(mounts.len(), 2); // no shared dir on disk
        assert_eq!(mounts[0].container_path, "/workspace/uploads");
        assert_eq!(mounts[0].mode, MountMode::ReadWrite);
        assert_eq!(mounts[1].container_path, "/workspace/intermediate");
        assert!(dir.path().join("uploads/7/42").is_dir());
        assert!(dir.path().join("intermediate/7/42").is_dir());
    }

    #[test]
    fn test_plan_includes_shared_when_present() {
        let dir = tempdir().unwrap();
        let dirs = base_dirs(dir.path());
        fs::create_dir_all(&dirs.shared_resources_root).unwrap();

        let mounts = plan("7", "42", None, &dirs, "/workspace").unwrap();

        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[2].container_path, "/workspace/skills");
        assert_eq!(mounts[2].mode, MountMode::ReadOnly);
    }

    #[test]
    fn test_plan_is_idempotent() {
        let dir = tempdir().unwrap();
        let dirs = base_dirs(dir.path());
        fs::create_dir_all(&dirs.shared_resources_root).unwrap();

        let first = plan("7", "42", None, &dirs, "/workspace").unwrap();
        let second = plan("7", "42", None, &dirs, "/workspace").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_plan_uses_custom_upload_path_when_present() {
        let dir = tempdir().unwrap();
        let dirs = base_dirs(dir.path());
        let custom = dir.path().join("custom-uploads");
        fs::create_dir_all(&custom).unwrap();

        let mounts = plan("7", "42", Some(&custom), &dirs, "/workspace").unwrap();

        assert_eq!(mounts[0].host_path, custom);
        // Derived uploads directory is not created when the custom one is used.
        assert!(!dir.path().join("uploads/7/42").exists());
    }

    #[test]
    fn test_plan_falls_back_when_custom_upload_path_missing() {
        let dir = tempdir().unwrap();
        let dirs = base_dirs(dir.path());
        let missing = dir.path().join("does-not-exist");

        let mounts = plan("7", "42", Some(&missing), &dirs, "/workspace").unwrap();

        assert_eq!(mounts[0].host_path, dir.path().join("uploads/7/42"));
    }

    #[test]
    fn test_plan_rejects_traversal_identifiers() {
        let dir = tempdir().unwrap();
        let dirs = base_dirs(dir.path());

        let err = plan("../evil", "42", None, &dirs, "/workspace").unwrap_err();
        assert!(err.is_path_escape());
        assert!(!dir.path().join("uploads").exists());

        let err = plan("7", "a/b", None, &dirs, "/workspace").unwrap_err();
        assert!(err.is_path_escape());
    }

    #[test]
    fn test_plan_detects_container_path_conflict() {
        let dir = tempdir().unwrap();
        // A shared directory named "uploads" collides with the uploads mount.
        let dirs = BaseDirs {
            uploads_root: dir.path().join("uploads-root"),
            intermediate_root: dir.path().join("intermediate-root"),
            shared_resources_root: dir.path().join("uploads"),
        };
        fs::create_dir_all(&dirs.shared_resources_root).unwrap();

        let err = plan("7", "42", None, &dirs, "/workspace").unwrap_err();
        assert!(err.is_mount_conflict());
    }

    #[test]
    fn test_bind_string_format() {
        let spec = MountSpec {
            host_path: PathBuf::from("/srv/uploads/7/42"),
            container_path: "/workspace/uploads".to_string(),
            mode: MountMode::ReadWrite,
        };
        assert_eq!(spec.bind_string(), "/srv/uploads/7/42:/workspace/uploads:rw");
    }
}
