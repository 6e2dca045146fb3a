//! One isolated, container-backed execution environment.
//!
//! A sandbox owns exactly one container handle and exposes file operations
//! plus command execution against it. The container starts lazily on the
//! first operation; every operation refreshes the activity timestamp the
//! idle reaper inspects. Operations on one sandbox are serialized by an
//! internal lock; operations on different sandboxes proceed in parallel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkcellConfig;
use crate::engine::{ContainerEngine, ContainerSpec};
use crate::error::{Result, SandboxError};
use crate::mounts::MountSpec;
use crate::paths::resolve_within;

/// Hard ceiling on any single `execute` call.
const MAX_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// Output beyond this many bytes is cut at a line boundary.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Observable lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Created, container not started yet.
    Uninitialized,
    /// Container start in progress.
    Starting,
    /// Container up; operations are served.
    Running,
    /// Stop requested, teardown in progress.
    Stopping,
    /// Container stopped; the sandbox must be replaced, not reused.
    Stopped,
    /// Start failed or the container died; non-recoverable.
    Failed,
}

/// Internal lifecycle; the container reference exists only while running.
#[derive(Debug)]
enum Lifecycle {
    Uninitialized,
    Starting,
    Running { container: String },
    Stopping,
    Stopped,
    Failed,
}

/// Result of one `execute` call.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    /// Combined stdout/stderr, possibly truncated.
    pub output: String,
    /// Exit code; absent when the process was terminated.
    pub exit_code: Option<i64>,
    /// Whether the wall-clock budget elapsed.
    pub timed_out: bool,
    /// Whether the output was cut at the size cap.
    pub truncated: bool,
}

/// One directory entry returned by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Entry name without its directory.
    pub name: String,
    /// Absolute in-container path.
    pub path: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// File size in bytes; absent for directories.
    pub size: Option<u64>,
}

/// One matching line returned by `grep`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrepMatch {
    /// Absolute in-container path of the file.
    pub path: String,
    /// 1-based line number.
    pub line_number: usize,
    /// The matching line.
    pub line: String,
}

/// Result of one `edit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditResult {
    /// How many occurrences were replaced.
    pub occurrences: usize,
}

/// Per-sandbox knobs, usually derived from [`WorkcellConfig`].
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Working directory inside the container.
    pub work_dir: String,
    /// Inactivity threshold the reaper applies to this sandbox.
    pub idle_timeout: Duration,
    /// Default `execute` budget when the caller passes none.
    pub exec_timeout: Duration,
    /// Remove the container on stop.
    pub auto_remove: bool,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            work_dir: "/workspace".to_string(),
            idle_timeout: Duration::from_secs(3600),
            exec_timeout: Duration::from_secs(30),
            auto_remove: true,
        }
    }
}

impl SandboxOptions {
    /// Derives options from the crate configuration.
    pub fn from_config(config: &WorkcellConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            idle_timeout: config.idle_timeout(),
            exec_timeout: config.exec_timeout(),
            auto_remove: config.auto_remove,
        }
    }
}

/// One isolated execution environment bound to a single container.
pub struct Sandbox {
    id: String,
    engine: Arc<dyn ContainerEngine>,
    image: String,
    mounts: Vec<MountSpec>,
    env: Vec<String>,
    options: SandboxOptions,
    lifecycle: AsyncMutex<Lifecycle>,
    /// Snapshot of the lifecycle for observers that must not wait on the
    /// operation lock (manager lookups, the reaper).
    observed: Mutex<SandboxState>,
    last_activity: Mutex<Instant>,
    probe_on_next_use: AtomicBool,
}

fn observable(lifecycle: &Lifecycle) -> SandboxState {
    match lifecycle {
        Lifecycle::Uninitialized => SandboxState::Uninitialized,
        Lifecycle::Starting => SandboxState::Starting,
        Lifecycle::Running { .. } => SandboxState::Running,
        Lifecycle::Stopping => SandboxState::Stopping,
        Lifecycle::Stopped => SandboxState::Stopped,
        Lifecycle::Failed => SandboxState::Failed,
    }
}

impl Sandbox {
    /// Creates a sandbox over an already-resolved image. The container is
    /// not started until the first operation.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        image: String,
        mounts: Vec<MountSpec>,
        env: Vec<String>,
        options: SandboxOptions,
    ) -> Self {
        let id = Uuid::new_v4()
            .to_string()
            .split('-')
            .next()
            .unwrap_or("sandbox")
            .to_string();

        Self {
            id,
            engine,
            image,
            mounts,
            env,
            options,
            lifecycle: AsyncMutex::new(Lifecycle::Uninitialized),
            observed: Mutex::new(SandboxState::Uninitialized),
            last_activity: Mutex::new(Instant::now()),
            probe_on_next_use: AtomicBool::new(false),
        }
    }

    /// Replaces the lifecycle, keeping the observable snapshot in step.
    fn transition(&self, lifecycle: &mut Lifecycle, next: Lifecycle) {
        *self.observed.lock().unwrap() = observable(&next);
        *lifecycle = next;
    }

    /// Stable identifier of this sandbox.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Mounts this sandbox was built with.
    pub fn mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    /// Working directory inside the container.
    pub fn work_dir(&self) -> &str {
        &self.options.work_dir
    }

    /// Inactivity threshold applied by the reaper.
    pub fn idle_timeout(&self) -> Duration {
        self.options.idle_timeout
    }

    /// When the last operation entered this sandbox.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    /// Current lifecycle state. Never blocks on in-flight operations.
    pub fn state(&self) -> SandboxState {
        *self.observed.lock().unwrap()
    }

    /// Marks the container handle as possibly stale after an unknown gap.
    /// The next operation probes liveness once before reuse; routine calls
    /// skip the probe.
    pub fn resume_hint(&self) {
        self.probe_on_next_use.store(true, Ordering::SeqCst);
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn force_last_activity(&self, instant: Instant) {
        *self.last_activity.lock().unwrap() = instant;
    }

    /// Returns the container reference, starting the container if needed.
    /// Must be called with the lifecycle lock held.
    async fn ensure_running(&self, lifecycle: &mut Lifecycle) -> Result<String> {
        match lifecycle {
            Lifecycle::Running { container } => {
                let container = container.clone();
                if self.probe_on_next_use.swap(false, Ordering::SeqCst) {
                    debug!(sandbox = %self.id, "Probing resumed container");
                    if !self.engine.is_alive(&container).await? {
                        self.transition(lifecycle, Lifecycle::Failed);
                        return Err(SandboxError::unavailable(format!(
                            "container {container} died while idle"
                        )));
                    }
                }
                Ok(container)
            }
            Lifecycle::Uninitialized => {
                self.transition(lifecycle, Lifecycle::Starting);

                let spec = ContainerSpec {
                    name: format!("workcell-{}", self.id),
                    image: self.image.clone(),
                    binds: self.mounts.iter().map(MountSpec::bind_string).collect(),
                    env: self.env.clone(),
                    working_dir: self.options.work_dir.clone(),
                };

                match self.engine.create_and_start(&spec).await {
                    Ok(container) => {
                        info!(sandbox = %self.id, container = %container, "Sandbox container started");
                        self.transition(
                            lifecycle,
                            Lifecycle::Running {
                                container: container.clone(),
                            },
                        );
                        Ok(container)
                    }
                    Err(e) => {
                        warn!(sandbox = %self.id, error = %e, "Sandbox container failed to start");
                        // A half-created container may exist; clean up best-effort.
                        let _ = self.engine.stop_and_remove(&spec.name, true).await;
                        self.transition(lifecycle, Lifecycle::Failed);
                        if e.is_engine_unreachable() {
                            Err(e)
                        } else {
                            Err(SandboxError::unavailable(format!(
                                "container failed to start: {e}"
                            )))
                        }
                    }
                }
            }
            Lifecycle::Stopped | Lifecycle::Stopping => {
                Err(SandboxError::unavailable("sandbox is stopped"))
            }
            Lifecycle::Failed => Err(SandboxError::unavailable("sandbox previously failed")),
            Lifecycle::Starting => Err(SandboxError::unavailable("sandbox start in progress")),
        }
    }

    /// Runs `command` under the per-sandbox lock against a live container.
    async fn run(&self, command: &str, timeout: Duration) -> Result<crate::engine::ExecOutput> {
        self.touch();
        let mut lifecycle = self.lifecycle.lock().await;
        let container = self.ensure_running(&mut lifecycle).await?;
        self.engine
            .exec(&container, command, &self.options.work_dir, timeout)
            .await
    }

    /// Lists the direct entries of a directory.
    ///
    /// # Errors
    ///
    /// `PathEscape`, `NotFound`, `SandboxUnavailable`.
    pub async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let resolved = resolve_within(&self.options.work_dir, path)?;
        let command = format!(
            "find {} -mindepth 1 -maxdepth 1 -printf '%y\\t%s\\t%f\\n'",
            shell_words::quote(&resolved)
        );
        let out = self.run(&command, self.options.exec_timeout).await?;
        if out.exit_code != Some(0) {
            return Err(SandboxError::not_found(resolved));
        }

        let mut entries = Vec::new();
        for line in out.output.lines() {
            let mut parts = line.splitn(3, '\t');
            let (Some(kind), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let is_dir = kind == "d";
            entries.push(FileInfo {
                name: name.to_string(),
                path: format!("{}/{name}", resolved.trim_end_matches('/')),
                is_dir,
                size: if is_dir { None } else { size.parse().ok() },
            });
        }
        Ok(entries)
    }

    /// Reads a file's contents.
    ///
    /// # Errors
    ///
    /// `PathEscape`, `NotFound`, `SandboxUnavailable`.
    pub async fn read(&self, path: &str) -> Result<String> {
        let resolved = resolve_within(&self.options.work_dir, path)?;
        let command = format!("cat {}", shell_words::quote(&resolved));
        let out = self.run(&command, self.options.exec_timeout).await?;
        if out.exit_code != Some(0) {
            return Err(SandboxError::not_found(resolved));
        }
        Ok(out.output)
    }

    /// Writes a file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// `PathEscape`, `SandboxUnavailable`.
    pub async fn write(&self, path: &str, content: &str) -> Result<()> {
        let resolved = resolve_within(&self.options.work_dir, path)?;
        let (parent, name) = split_file_path(&resolved)?;

        self.touch();
        let mut lifecycle = self.lifecycle.lock().await;
        let container = self.ensure_running(&mut lifecycle).await?;

        let mkdir = format!("mkdir -p {}", shell_words::quote(parent));
        let out = self
            .engine
            .exec(&container, &mkdir, &self.options.work_dir, self.options.exec_timeout)
            .await?;
        if out.exit_code != Some(0) {
            return Err(SandboxError::unavailable(format!(
                "could not create directory {parent}: {}",
                out.output.trim()
            )));
        }

        let archive = single_file_archive(name, content)?;
        self.engine.upload(&container, parent, archive).await
    }

    /// Replaces every occurrence of `old` with `new` in a file.
    ///
    /// # Errors
    ///
    /// `PathEscape`, `NotFound` (file missing, or `old` absent from it),
    /// `SandboxUnavailable`.
    pub async fn edit(&self, path: &str, old: &str, new: &str) -> Result<EditResult> {
        let content = self.read(path).await?;
        let occurrences = content.matches(old).count();
        if occurrences == 0 {
            return Err(SandboxError::not_found(format!("{old:?} in {path}")));
        }
        let replaced = content.replace(old, new);
        self.write(path, &replaced).await?;
        Ok(EditResult { occurrences })
    }

    /// Finds files under the working directory matching a glob pattern.
    ///
    /// # Errors
    ///
    /// `PathEscape` (pattern attempts traversal), `SandboxUnavailable`.
    pub async fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        if pattern.contains("..") {
            return Err(SandboxError::path_escape(pattern));
        }
        let absolute = if pattern.starts_with('/') {
            pattern.to_string()
        } else {
            format!("{}/{pattern}", self.options.work_dir.trim_end_matches('/'))
        };
        let matcher = glob::Pattern::new(&absolute)
            .map_err(|_| SandboxError::path_escape(pattern))?;

        let command = format!(
            "find {} -type f",
            shell_words::quote(&self.options.work_dir)
        );
        let out = self.run(&command, self.options.exec_timeout).await?;

        Ok(out
            .output
            .lines()
            .filter(|line| matcher.matches(line))
            .map(str::to_string)
            .collect())
    }

    /// Searches file contents, returning matching lines.
    ///
    /// # Errors
    ///
    /// `PathEscape`, `NotFound`, `SandboxUnavailable`.
    pub async fn grep(&self, pattern: &str, path: &str) -> Result<Vec<GrepMatch>> {
        let resolved = resolve_within(&self.options.work_dir, path)?;
        let command = format!(
            "grep -rn -- {} {}",
            shell_words::quote(pattern),
            shell_words::quote(&resolved)
        );
        let out = self.run(&command, self.options.exec_timeout).await?;

        match out.exit_code {
            Some(0) => {}
            Some(1) => return Ok(Vec::new()), // no matches
            _ => return Err(SandboxError::not_found(resolved)),
        }

        let mut matches = Vec::new();
        for line in out.output.lines() {
            let mut parts = line.splitn(3, ':');
            let (Some(file), Some(number), Some(text)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(line_number) = number.parse() else {
                continue;
            };
            matches.push(GrepMatch {
                path: file.to_string(),
                line_number,
                line: text.to_string(),
            });
        }
        Ok(matches)
    }

    /// Runs a shell command in the working directory with a wall-clock
    /// budget (default from options, clamped to a 300s ceiling).
    ///
    /// Timeout and truncation are annotations on the result, not errors:
    /// on timeout only the spawned process is terminated and the sandbox
    /// stays usable. The activity timestamp updates on entry, so a
    /// long-running command does not look idle mid-flight.
    ///
    /// # Errors
    ///
    /// `SandboxUnavailable`, `EngineUnreachable`.
    pub async fn execute(&self, command: &str, timeout: Option<Duration>) -> Result<ExecuteResult> {
        let budget = timeout
            .unwrap_or(self.options.exec_timeout)
            .min(MAX_EXEC_TIMEOUT);

        let out = self.run(command, budget).await?;
        let (output, truncated) = cap_output(out.output);

        if out.timed_out {
            debug!(sandbox = %self.id, command, "Command timed out");
        }

        Ok(ExecuteResult {
            output,
            exit_code: out.exit_code,
            timed_out: out.timed_out,
            truncated,
        })
    }

    /// Stops the sandbox. Idempotent: a sandbox that never started, or one
    /// already stopped, is a no-op. Safe to call from the reaper while
    /// another caller holds a reference.
    ///
    /// # Errors
    ///
    /// Propagates genuine engine failures; "already gone" is suppressed.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;

        let container = match &*lifecycle {
            Lifecycle::Running { container } => container.clone(),
            Lifecycle::Uninitialized | Lifecycle::Failed => {
                self.transition(&mut lifecycle, Lifecycle::Stopped);
                return Ok(());
            }
            Lifecycle::Stopped | Lifecycle::Stopping | Lifecycle::Starting => return Ok(()),
        };

        self.transition(&mut lifecycle, Lifecycle::Stopping);
        let result = self
            .engine
            .stop_and_remove(&container, self.options.auto_remove)
            .await;
        self.transition(&mut lifecycle, Lifecycle::Stopped);

        info!(sandbox = %self.id, container = %container, "Sandbox stopped");
        result
    }
}

/// Splits an absolute file path into (parent directory, file name).
fn split_file_path(path: &str) -> Result<(&str, &str)> {
    match path.rsplit_once('/') {
        Some(("", name)) if !name.is_empty() => Ok(("/", name)),
        Some((parent, name)) if !name.is_empty() => Ok((parent, name)),
        _ => Err(SandboxError::path_escape(path)),
    }
}

/// Builds a tar archive holding a single file.
fn single_file_archive(name: &str, content: &str) -> Result<Bytes> {
    let mut buf = Vec::new();
    {
        let mut tar = tar::Builder::new(&mut buf);
        let bytes = content.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, name, bytes)
            .map_err(|e| SandboxError::io("building upload archive", e))?;
        tar.finish()
            .map_err(|e| SandboxError::io("building upload archive", e))?;
    }
    Ok(Bytes::from(buf))
}

/// Caps output at the size limit, cutting back to the previous newline.
fn cap_output(output: String) -> (String, bool) {
    if output.len() <= MAX_OUTPUT_BYTES {
        return (output, false);
    }

    // The cap may land mid-codepoint; back up to a boundary first.
    let mut boundary = MAX_OUTPUT_BYTES;
    while !output.is_char_boundary(boundary) {
        boundary -= 1;
    }

    let cut = output[..boundary].rfind('\n').map_or(boundary, |idx| idx + 1);

    let mut capped = output;
    capped.truncate(cut);
    (capped, true)
}
