//! Workspace discovery helpers.
//!
//! Enumerate what a live sandbox can see under its mounted roots. The
//! results feed a prompt-construction step owned elsewhere, so everything
//! is returned as absolute in-container paths.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::Result;
use crate::sandbox::Sandbox;

/// Metadata for one file inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Absolute in-container path.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Permission string as reported by `stat` (e.g. `-rw-r--r--`).
    pub permissions: String,
    /// Modification timestamp, seconds precision.
    pub modified: String,
}

/// Discovers all files under the sandbox's mounted roots.
///
/// Returns absolute in-container paths, mount order preserved.
///
/// # Errors
///
/// `SandboxUnavailable` / `EngineUnreachable` from the underlying execute.
pub async fn discover_files(sandbox: &Sandbox) -> Result<Vec<String>> {
    let mut paths = Vec::new();

    for mount in sandbox.mounts() {
        let command = format!(
            "find {} -type f 2>/dev/null || true",
            shell_words::quote(&mount.container_path)
        );
        let result = sandbox.execute(&command, None).await?;
        if result.exit_code == Some(0) {
            paths.extend(
                result
                    .output
                    .lines()
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
        }
    }

    debug!(count = paths.len(), sandbox = %sandbox.id(), "Discovered workspace files");
    Ok(paths)
}

/// Lists file names grouped by mounted directory.
///
/// Keys are the directory names under the work dir (`uploads`,
/// `intermediate`, the shared directory); values are direct child names.
///
/// # Errors
///
/// `SandboxUnavailable` / `EngineUnreachable` from the underlying execute.
pub async fn list_directories(sandbox: &Sandbox) -> Result<BTreeMap<String, Vec<String>>> {
    let mut listing = BTreeMap::new();

    for mount in sandbox.mounts() {
        let name = mount
            .container_path
            .rsplit('/')
            .next()
            .unwrap_or(&mount.container_path)
            .to_string();

        let command = format!(
            "ls -1 {} 2>/dev/null || true",
            shell_words::quote(&mount.container_path)
        );
        let result = sandbox.execute(&command, None).await?;

        let entries = if result.exit_code == Some(0) {
            result
                .output
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        listing.insert(name, entries);
    }

    Ok(listing)
}

/// Stats a single file inside the container.
///
/// Returns `None` when the file does not exist.
///
/// # Errors
///
/// `SandboxUnavailable` / `EngineUnreachable` from the underlying execute.
pub async fn file_info(sandbox: &Sandbox, path: &str) -> Result<Option<FileStat>> {
    let command = format!(
        "stat -c '%s|%A|%y' {} 2>/dev/null || true",
        shell_words::quote(path)
    );
    let result = sandbox.execute(&command, None).await?;

    if result.exit_code != Some(0) || result.output.trim().is_empty() {
        return Ok(None);
    }

    let line = result.output.trim();
    let mut parts = line.splitn(3, '|');
    let (Some(size), Some(permissions), Some(modified)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Ok(None);
    };
    let Ok(size) = size.parse() else {
        return Ok(None);
    };

    Ok(Some(FileStat {
        path: path.to_string(),
        size,
        permissions: permissions.to_string(),
        // Drop sub-second precision.
        modified: modified.split('.').next().unwrap_or(modified).to_string(),
    }))
}
