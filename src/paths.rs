//! Path containment checks for sandbox file operations.
//!
//! Every user-supplied path is resolved against a declared root before it
//! reaches the container engine. Tenant and session identifiers pass through
//! the same validation before any host directory is derived from them.

use crate::error::{Result, SandboxError};

/// Resolves `requested` against `root` and rejects anything that escapes it.
///
/// Relative paths are joined onto `root`; absolute paths are accepted as-is
/// but must still normalize to a descendant of `root` (or `root` itself).
/// Parent traversal (`..`), repeated separators, and `.` segments are
/// normalized lexically before the containment check.
///
/// # Errors
///
/// Returns `SandboxError::PathEscape` when the normalized target is not a
/// descendant of `root`.
pub fn resolve_within(root: &str, requested: &str) -> Result<String> {
    let root = normalize(root).ok_or_else(|| SandboxError::path_escape(requested))?;

    let joined = if requested.starts_with('/') {
        requested.to_string()
    } else {
        format!("{root}/{requested}")
    };

    let resolved = normalize(&joined).ok_or_else(|| SandboxError::path_escape(requested))?;

    if resolved == root || resolved.starts_with(&format!("{root}/")) {
        Ok(resolved)
    } else {
        Err(SandboxError::path_escape(requested))
    }
}

/// Validates a tenant or session identifier as a single path component.
///
/// Identifiers are untrusted input to host path construction, so they must
/// be non-empty, free of path separators and NUL, and must not be `.`/`..`.
///
/// # Errors
///
/// Returns `SandboxError::PathEscape` for any violation.
pub fn validate_component(id: &str) -> Result<&str> {
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0')
    {
        return Err(SandboxError::path_escape(id));
    }
    Ok(id)
}

/// Lexically normalizes an absolute unix-style path.
///
/// Returns `None` when traversal pops above the filesystem root.
fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return None;
                }
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        Some("/".to_string())
    } else {
        Some(format!("/{}", parts.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_resolves_inside_root() {
        let resolved = resolve_within("/workspace", "uploads/data.csv").unwrap();
        assert_eq!(resolved, "/workspace/uploads/data.csv");
    }

    #[test]
    fn test_absolute_path_inside_root_is_accepted() {
        let resolved = resolve_within("/workspace", "/workspace/intermediate/out.txt").unwrap();
        assert_eq!(resolved, "/workspace/intermediate/out.txt");
    }

    #[test]
    fn test_root_itself_is_accepted() {
        assert_eq!(resolve_within("/workspace", "/workspace").unwrap(), "/workspace");
        assert_eq!(resolve_within("/workspace", ".").unwrap(), "/workspace");
    }

    #[test]
    fn test_parent_traversal_is_rejected() {
        let err = resolve_within("/workspace", "../etc/passwd").unwrap_err();
        assert!(err.is_path_escape());

        let err = resolve_within("/workspace", "uploads/../../etc/passwd").unwrap_err();
        assert!(err.is_path_escape());
    }

    #[test]
    fn test_absolute_injection_is_rejected() {
        let err = resolve_within("/workspace", "/etc/passwd").unwrap_err();
        assert!(err.is_path_escape());
    }

    #[test]
    fn test_sibling_prefix_is_rejected() {
        // /workspace-evil shares a string prefix but is not a descendant.
        let err = resolve_within("/workspace", "/workspace-evil/file").unwrap_err();
        assert!(err.is_path_escape());
    }

    #[test]
    fn test_traversal_that_returns_inside_is_accepted() {
        let resolved = resolve_within("/workspace", "uploads/../intermediate/x").unwrap();
        assert_eq!(resolved, "/workspace/intermediate/x");
    }

    #[test]
    fn test_dot_segments_and_double_slashes_normalize() {
        let resolved = resolve_within("/workspace", "./uploads//./data.csv").unwrap();
        assert_eq!(resolved, "/workspace/uploads/data.csv");
    }

    #[test]
    fn test_traversal_above_filesystem_root() {
        let err = resolve_within("/workspace", "/../..").unwrap_err();
        assert!(err.is_path_escape());
    }

    #[test]
    fn test_valid_components() {
        assert_eq!(validate_component("tenant-1").unwrap(), "tenant-1");
        assert_eq!(validate_component("42").unwrap(), "42");
        assert_eq!(validate_component("a.b_c").unwrap(), "a.b_c");
    }

    #[test]
    fn test_invalid_components() {
        for bad in ["", ".", "..", "a/b", "a\\b", "a\0b", "../x"] {
            let err = validate_component(bad).unwrap_err();
            assert!(err.is_path_escape(), "should reject {bad:?}");
        }
    }
}
