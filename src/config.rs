//! Configuration surface for the execution backend.
//!
//! Loaded from `workcell.toml` with serde defaults, so an absent file or a
//! partial file both yield a working configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::mounts::BaseDirs;
use crate::runtime::RuntimeTemplate;

const CONFIG_FILE: &str = "workcell.toml";

/// Top-level configuration for sandboxes and their lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkcellConfig {
    /// Seconds of inactivity before a sandbox is reclaimed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Working directory inside the container.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    /// Runtime to provision sandboxes from: a built-in template name or an
    /// inline template table.
    #[serde(default)]
    pub runtime: RuntimeSelection,

    /// Whether stopped containers are removed immediately.
    #[serde(default = "default_true")]
    pub auto_remove: bool,

    /// Root for per-tenant upload directories.
    #[serde(default = "default_uploads_root")]
    pub uploads_root: String,

    /// Root for per-tenant scratch directories.
    #[serde(default = "default_intermediate_root")]
    pub intermediate_root: String,

    /// Shared read-only resources directory.
    #[serde(default = "default_shared_root")]
    pub shared_resources_root: String,

    /// Default wall-clock budget for `execute`, in seconds.
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,

    /// Interval between idle-reaper scans, in seconds.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

impl Default for WorkcellConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            work_dir: default_work_dir(),
            runtime: RuntimeSelection::default(),
            auto_remove: true,
            uploads_root: default_uploads_root(),
            intermediate_root: default_intermediate_root(),
            shared_resources_root: default_shared_root(),
            exec_timeout_secs: default_exec_timeout(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

/// Runtime selection: a built-in template by name, or an inline template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuntimeSelection {
    /// Name of a built-in template (`"default"`, `"data-analysis"`).
    Name(String),
    /// Full inline template definition.
    Template(RuntimeTemplate),
}

impl Default for RuntimeSelection {
    fn default() -> Self {
        Self::Name("default".to_string())
    }
}

// Default value functions
fn default_idle_timeout() -> u64 {
    3600
}

fn default_work_dir() -> String {
    "/workspace".to_string()
}

fn default_uploads_root() -> String {
    "data/uploads".to_string()
}

fn default_intermediate_root() -> String {
    "data/intermediate".to_string()
}

fn default_shared_root() -> String {
    "data/skills".to_string()
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl WorkcellConfig {
    /// Load configuration from `workcell.toml` in `dir`, using defaults if
    /// the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|e| SandboxError::io(format!("reading {}", config_path.display()), e))?;

        toml::from_str(&content).map_err(|e| {
            SandboxError::runtime_build(format!(
                "invalid config file {}: {e}",
                config_path.display()
            ))
        })
    }

    /// The three mount base directories, with `~` expanded.
    pub fn base_dirs(&self) -> BaseDirs {
        BaseDirs {
            uploads_root: expand_path(&self.uploads_root),
            intermediate_root: expand_path(&self.intermediate_root),
            shared_resources_root: expand_path(&self.shared_resources_root),
        }
    }

    /// Resolves the configured runtime selection to a template.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeBuild` when a named template is not a built-in.
    pub fn runtime_template(&self) -> Result<RuntimeTemplate> {
        match &self.runtime {
            RuntimeSelection::Template(template) => Ok(template.clone()),
            RuntimeSelection::Name(name) => RuntimeTemplate::builtin(name).ok_or_else(|| {
                SandboxError::runtime_build(format!("unknown runtime template: {name}"))
            }),
        }
    }

    /// Idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Default execute timeout as a `Duration`.
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    /// Reaper scan interval as a `Duration`.
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

/// Expand `~` to the home directory.
fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkcellConfig::default();
        assert_eq!(config.idle_timeout_secs, 3600);
        assert_eq!(config.work_dir, "/workspace");
        assert_eq!(config.exec_timeout_secs, 30);
        assert!(config.auto_remove);
        assert!(matches!(config.runtime, RuntimeSelection::Name(ref n) if n == "default"));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
idle_timeout_secs = 600
work_dir = "/sandbox"
auto_remove = false
uploads_root = "/srv/uploads"

[runtime]
name = "custom"
image = "custom-image:v2"
"#;
        let config: WorkcellConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.idle_timeout_secs, 600);
        assert_eq!(config.work_dir, "/sandbox");
        assert!(!config.auto_remove);
        assert_eq!(config.uploads_root, "/srv/uploads");

        let template = config.runtime_template().unwrap();
        assert_eq!(template.name, "custom");
        assert_eq!(template.image.as_deref(), Some("custom-image:v2"));
    }

    #[test]
    fn test_parse_named_runtime() {
        let toml = r#"runtime = "data-analysis""#;
        let config: WorkcellConfig = toml::from_str(toml).unwrap();
        let template = config.runtime_template().unwrap();
        assert_eq!(template.name, "data-analysis");
    }

    #[test]
    fn test_unknown_named_runtime_fails() {
        let toml = r#"runtime = "no-such-template""#;
        let config: WorkcellConfig = toml::from_str(toml).unwrap();
        let err = config.runtime_template().unwrap_err();
        assert!(err.to_string().contains("unknown runtime template"));
    }

    #[test]
    fn test_load_nonexistent_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkcellConfig::load(dir.path()).unwrap();
        assert_eq!(config.idle_timeout_secs, 3600);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "idle_timeout_secs = 120\n").unwrap();
        let config = WorkcellConfig::load(dir.path()).unwrap();
        assert_eq!(config.idle_timeout_secs, 120);
    }

    #[test]
    fn test_expand_path_passthrough() {
        assert_eq!(expand_path("/srv/data"), PathBuf::from("/srv/data"));
    }

    #[test]
    fn test_expand_path_tilde() {
        if dirs::home_dir().is_some() {
            let expanded = expand_path("~/uploads");
            assert!(!expanded.starts_with("~"));
            assert!(expanded.ends_with("uploads"));
        }
    }
}
