//! Runtime templates: named, immutable descriptions of sandbox images.
//!
//! A template either names a prebuilt image or describes how to build one
//! (base image, packages, setup commands). Resolution turns a template into
//! a concrete image reference exactly once per name per process when image
//! caching is enabled.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::engine::ContainerEngine;
use crate::error::{Result, SandboxError};

/// Description of a sandbox image.
///
/// Either `image` (prebuilt) or `base_image` (built on demand) must be set;
/// when both are present the prebuilt image wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeTemplate {
    /// Unique template name; also the repository part of built image tags.
    pub name: String,

    /// Prebuilt image reference, pulled if missing locally.
    #[serde(default)]
    pub image: Option<String>,

    /// Base image to build from when no prebuilt image is given.
    #[serde(default)]
    pub base_image: Option<String>,

    /// Python packages installed into a built image.
    #[serde(default)]
    pub packages: Vec<String>,

    /// Shell commands run while building the image.
    #[serde(default)]
    pub setup_commands: Vec<String>,

    /// Environment variables applied to every container of this runtime.
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,

    /// Working directory override; the sandbox work dir applies when unset.
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Cache built images by content hash and memoize resolution per name.
    #[serde(default = "default_cache_image")]
    pub cache_image: bool,
}

fn default_cache_image() -> bool {
    true
}

impl RuntimeTemplate {
    /// A template that uses a prebuilt image.
    pub fn prebuilt(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: Some(image.into()),
            base_image: None,
            packages: Vec::new(),
            setup_commands: Vec::new(),
            env_vars: BTreeMap::new(),
            working_dir: None,
            cache_image: true,
        }
    }

    /// Looks up a built-in template by name.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::prebuilt("default", "workcell-sandbox:latest")),
            // Data-analysis environment: Excel/CSV handling, statistics,
            // plotting, and script execution.
            "data-analysis" => Some(Self::prebuilt(
                "data-analysis",
                "workcell-data-analysis:latest",
            )),
            _ => None,
        }
    }

    /// Checks that the template names an image source.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeBuild` when neither `image` nor `base_image` is set.
    pub fn validate(&self) -> Result<()> {
        if self.image.is_none() && self.base_image.is_none() {
            return Err(SandboxError::runtime_build(format!(
                "template {:?} has neither image nor base_image",
                self.name
            )));
        }
        Ok(())
    }

    /// Content hash over everything that affects a built image.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.base_image.as_deref().unwrap_or_default());
        for package in &self.packages {
            hasher.update(b"\n");
            hasher.update(package);
        }
        for command in &self.setup_commands {
            hasher.update(b"\n");
            hasher.update(command);
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..6])
    }

    /// Tag under which a built image is stored: `{name}:{cache_key}`.
    pub fn build_tag(&self) -> String {
        format!("{}:{}", self.name, self.cache_key())
    }

    /// Synthesizes the Dockerfile for a built template.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeBuild` when the template has no `base_image`.
    pub fn dockerfile(&self) -> Result<String> {
        let base = self.base_image.as_deref().ok_or_else(|| {
            SandboxError::runtime_build(format!("template {:?} has no base_image", self.name))
        })?;

        let mut lines = vec![format!("FROM {base}")];
        for (key, value) in &self.env_vars {
            lines.push(format!("ENV {key}={value}"));
        }
        if !self.packages.is_empty() {
            lines.push(format!(
                "RUN pip install --no-cache-dir {}",
                self.packages.join(" ")
            ));
        }
        for command in &self.setup_commands {
            lines.push(format!("RUN {command}"));
        }
        if let Some(dir) = &self.working_dir {
            lines.push(format!("WORKDIR {dir}"));
        }
        lines.push(String::new());
        Ok(lines.join("\n"))
    }
}

/// Resolves templates to image references, memoizing per name.
///
/// The engine does the actual pulling/building; the resolver only guarantees
/// the at-most-once-per-name contract for cached templates.
pub struct RuntimeResolver {
    engine: Arc<dyn ContainerEngine>,
    resolved: Mutex<HashMap<String, String>>,
}

impl RuntimeResolver {
    /// Creates a resolver backed by `engine`.
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves `template` to a concrete image reference.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeBuild` on build/pull failure (fatal, never retried
    /// internally) and `EngineUnreachable` when the engine is down.
    pub async fn resolve(&self, template: &RuntimeTemplate) -> Result<String> {
        template.validate()?;

        let mut resolved = self.resolved.lock().await;
        if template.cache_image {
            if let Some(image) = resolved.get(&template.name) {
                debug!(template = %template.name, image = %image, "Runtime already resolved");
                return Ok(image.clone());
            }
        }

        // Resolution is held under the map lock so two sandboxes racing on
        // the same template cannot both kick off a build.
        let image = self.engine.prepare_image(template).await?;
        info!(template = %template.name, image = %image, "Resolved runtime template");

        if template.cache_image {
            resolved.insert(template.name.clone(), image.clone());
        }
        Ok(image)
    }
}
