//! Session lifecycle management.
//!
//! A [`SessionManager`] owns the registry mapping a tenant/session identity
//! to at most one live sandbox, builds new sandboxes on demand from the
//! mount planner and runtime resolver, and drives the idle reaper that
//! reclaims sandboxes nobody has touched for too long.
//!
//! Locking discipline: the registry mutex is held only for lookup, insert,
//! and remove, never across engine I/O. Creation for one identity is
//! serialized by a per-key lock so concurrent `get_or_create` calls build
//! exactly one sandbox; creation for different identities proceeds in
//! parallel.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WorkcellConfig;
use crate::engine::ContainerEngine;
use crate::error::Result;
use crate::mounts;
use crate::paths::validate_component;
use crate::runtime::{RuntimeResolver, RuntimeTemplate};
use crate::sandbox::{Sandbox, SandboxOptions, SandboxState};

/// Identity scoping mounts and sandbox reuse: one tenant/session pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    tenant_id: String,
    session_id: String,
}

impl SessionKey {
    /// Validates and builds a key. Identifiers are untrusted input to path
    /// construction and must be single path components.
    ///
    /// # Errors
    ///
    /// Returns `PathEscape` for empty, separator-bearing, or traversal
    /// identifiers.
    pub fn new(tenant_id: impl Into<String>, session_id: impl Into<String>) -> Result<Self> {
        let tenant_id = tenant_id.into();
        let session_id = session_id.into();
        validate_component(&tenant_id)?;
        validate_component(&session_id)?;
        Ok(Self {
            tenant_id,
            session_id,
        })
    }

    /// Tenant part of the key.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Session part of the key.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.session_id)
    }
}

/// One registry entry: the live sandbox and when it was registered.
struct SessionEntry {
    sandbox: Arc<Sandbox>,
    created_at: DateTime<Utc>,
}

/// Introspection snapshot of one registered session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// The identity the sandbox is registered under.
    pub key: SessionKey,
    /// Sandbox identifier.
    pub sandbox_id: String,
    /// When the entry was registered.
    pub created_at: DateTime<Utc>,
    /// Lifecycle state at snapshot time.
    pub state: SandboxState,
}

struct ReaperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ManagerInner {
    engine: Arc<dyn ContainerEngine>,
    config: WorkcellConfig,
    template: RuntimeTemplate,
    resolver: RuntimeResolver,
    registry: AsyncMutex<HashMap<SessionKey, SessionEntry>>,
    creation_locks: AsyncMutex<HashMap<SessionKey, Arc<AsyncMutex<()>>>>,
}

/// Keyed registry of live sandboxes with automatic idle reclamation.
pub struct SessionManager {
    inner: Arc<ManagerInner>,
    reaper: std::sync::Mutex<Option<ReaperHandle>>,
}

impl SessionManager {
    /// Creates a manager over `engine` with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeBuild` when the configured runtime selection names
    /// an unknown template.
    pub fn new(engine: Arc<dyn ContainerEngine>, config: WorkcellConfig) -> Result<Self> {
        let template = config.runtime_template()?;
        let resolver = RuntimeResolver::new(engine.clone());

        Ok(Self {
            inner: Arc::new(ManagerInner {
                engine,
                config,
                template,
                resolver,
                registry: AsyncMutex::new(HashMap::new()),
                creation_locks: AsyncMutex::new(HashMap::new()),
            }),
            reaper: std::sync::Mutex::new(None),
        })
    }

    /// Returns the live sandbox for `key`, creating one if none exists or
    /// the registered one is failed/stopped. A dead sandbox is never
    /// silently reused.
    ///
    /// `upload_path` overrides the derived uploads directory when it is
    /// supplied and exists on the host.
    ///
    /// # Errors
    ///
    /// `PathEscape`, `MountConflict`, `RuntimeBuild`, `SandboxUnavailable`,
    /// `EngineUnreachable`, `Io`.
    pub async fn get_or_create(
        &self,
        key: &SessionKey,
        upload_path: Option<&Path>,
    ) -> Result<Arc<Sandbox>> {
        self.inner.get_or_create(key, upload_path).await
    }

    /// Stops and removes the sandbox for `key` immediately, regardless of
    /// idle time. Returns whether an entry existed.
    ///
    /// # Errors
    ///
    /// Propagates genuine engine failures from the stop; the entry is
    /// removed from the registry either way.
    pub async fn release(&self, key: &SessionKey) -> Result<bool> {
        self.inner.release(key).await
    }

    /// Stops every registered sandbox, clears the registry, and returns
    /// how many sandboxes were stopped. Also stops the idle reaper.
    pub async fn shutdown(&self) -> usize {
        self.stop_idle_reaper().await;

        let entries: Vec<(SessionKey, SessionEntry)> = {
            let mut registry = self.inner.registry.lock().await;
            registry.drain().collect()
        };

        let mut stopped = 0;
        for (key, entry) in entries {
            match entry.sandbox.stop().await {
                Ok(()) => stopped += 1,
                Err(e) => warn!(session = %key, error = %e, "Failed to stop sandbox on shutdown"),
            }
        }

        info!(stopped, "Session manager shut down");
        stopped
    }

    /// Number of registered sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// Snapshot of all registered sessions.
    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let registry = self.inner.registry.lock().await;
        registry
            .iter()
            .map(|(key, entry)| SessionSummary {
                key: key.clone(),
                sandbox_id: entry.sandbox.id().to_string(),
                created_at: entry.created_at,
                state: entry.sandbox.state(),
            })
            .collect()
    }

    /// Starts the background idle reaper, scanning every `interval`.
    /// A second call while it is running is a no-op.
    pub fn start_idle_reaper(&self, interval: Duration) {
        let mut slot = self.reaper.lock().unwrap();
        if slot.is_some() {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let inner = self.inner.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it so a fresh
            // manager never scans at t=0.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = inner.reap_idle_once().await;
                        if reaped > 0 {
                            debug!(reaped, "Idle reaper scan complete");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
        });

        info!(interval_secs = interval.as_secs(), "Idle reaper started");
        *slot = Some(ReaperHandle { stop, task });
    }

    /// Stops the idle reaper and waits for its task to finish. A no-op
    /// when the reaper is not running.
    pub async fn stop_idle_reaper(&self) {
        let handle = self.reaper.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
            let _ = handle.task.await;
            debug!("Idle reaper stopped");
        }
    }

}

impl Drop for SessionManager {
    fn drop(&mut self) {
        // Detached reaper tasks must not outlive the manager.
        if let Some(handle) = self.reaper.lock().unwrap().take() {
            handle.task.abort();
        }
    }
}

impl ManagerInner {
    async fn creation_lock(&self, key: &SessionKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.creation_locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    async fn get_or_create(
        &self,
        key: &SessionKey,
        upload_path: Option<&Path>,
    ) -> Result<Arc<Sandbox>> {
        let lock = self.creation_lock(key).await;
        let _guard = lock.lock().await;

        // Lookup only; the sandbox is inspected after the registry lock is
        // released so a busy sandbox cannot block other tenants.
        let existing = {
            let registry = self.registry.lock().await;
            registry.get(key).map(|entry| entry.sandbox.clone())
        };

        if let Some(sandbox) = existing {
            match sandbox.state() {
                SandboxState::Failed | SandboxState::Stopped => {
                    debug!(session = %key, sandbox = %sandbox.id(), "Replacing dead sandbox");
                    let _ = sandbox.stop().await;
                    let mut registry = self.registry.lock().await;
                    if registry
                        .get(key)
                        .is_some_and(|entry| Arc::ptr_eq(&entry.sandbox, &sandbox))
                    {
                        registry.remove(key);
                    }
                }
                _ => return Ok(sandbox),
            }
        }

        let work_dir = self
            .template
            .working_dir
            .clone()
            .unwrap_or_else(|| self.config.work_dir.clone());

        let mounts = mounts::plan(
            key.tenant_id(),
            key.session_id(),
            upload_path,
            &self.config.base_dirs(),
            &work_dir,
        )?;

        let image = self.resolver.resolve(&self.template).await?;

        let env = self
            .template
            .env_vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mut options = SandboxOptions::from_config(&self.config);
        options.work_dir = work_dir;

        let sandbox = Arc::new(Sandbox::new(
            self.engine.clone(),
            image,
            mounts,
            env,
            options,
        ));

        info!(session = %key, sandbox = %sandbox.id(), "Registered new sandbox");
        let mut registry = self.registry.lock().await;
        registry.insert(
            key.clone(),
            SessionEntry {
                sandbox: sandbox.clone(),
                created_at: Utc::now(),
            },
        );

        Ok(sandbox)
    }

    async fn release(&self, key: &SessionKey) -> Result<bool> {
        let entry = {
            let mut registry = self.registry.lock().await;
            registry.remove(key)
        };

        match entry {
            Some(entry) => {
                debug!(session = %key, sandbox = %entry.sandbox.id(), "Releasing sandbox");
                entry.sandbox.stop().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reap_idle_once(&self) -> usize {
        let snapshot: Vec<(SessionKey, Arc<Sandbox>)> = {
            let registry = self.registry.lock().await;
            registry
                .iter()
                .map(|(key, entry)| (key.clone(), entry.sandbox.clone()))
                .collect()
        };

        let mut reaped = 0;
        for (key, sandbox) in snapshot {
            let idle = sandbox.last_activity().elapsed();
            if idle <= sandbox.idle_timeout() {
                continue;
            }

            info!(
                session = %key,
                sandbox = %sandbox.id(),
                idle_secs = idle.as_secs(),
                "Evicting idle sandbox"
            );
            // One entry's failure must not abort the scan for the others.
            match self.release(&key).await {
                Ok(true) => reaped += 1,
                Ok(false) => {}
                Err(e) => warn!(session = %key, error = %e, "Failed to evict idle sandbox"),
            }
        }

        reaped
    }
}
