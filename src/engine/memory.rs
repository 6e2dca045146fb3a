//! In-memory engine for development and testing.
//!
//! Simulates containers as in-process maps and interprets the small command
//! vocabulary the sandbox file operations and tests rely on (`cat`, `ls`,
//! `find`, `grep`, `stat`, `echo`, `seq`, `sleep`). No isolation is
//! provided; use it to develop against the sandbox API without a container
//! engine, mirroring the original in-memory backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::engine::{ContainerEngine, ContainerSpec, ExecOutput};
use crate::error::{Result, SandboxError};
use crate::runtime::RuntimeTemplate;

#[derive(Debug, Default)]
struct MemoryContainer {
    running: bool,
    /// Absolute path -> file contents.
    files: BTreeMap<String, String>,
    /// Absolute paths known to be directories (mount targets, work dir).
    dirs: BTreeSet<String>,
}

/// A container engine that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryEngine {
    containers: Mutex<HashMap<String, MemoryContainer>>,
    prepared_images: AtomicUsize,
    fail_next_start: AtomicBool,
}

impl MemoryEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `prepare_image` calls served so far.
    pub fn prepared_image_count(&self) -> usize {
        self.prepared_images.load(Ordering::SeqCst)
    }

    /// Number of containers currently known (running or stopped).
    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    /// Makes the next `create_and_start` fail, simulating an engine-side
    /// start failure.
    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    /// Marks a container as dead without removing it, simulating a crash
    /// between calls.
    pub fn kill_container(&self, container: &str) {
        if let Some(entry) = self.containers.lock().unwrap().get_mut(container) {
            entry.running = false;
        }
    }

    /// Seeds a file into a container, bypassing the upload path.
    pub fn seed_file(&self, container: &str, path: &str, content: &str) {
        if let Some(entry) = self.containers.lock().unwrap().get_mut(container) {
            entry.files.insert(path.to_string(), content.to_string());
        }
    }

    fn run_command(&self, container: &str, command: &str, working_dir: &str) -> Result<ExecOutput> {
        let tokens = tokenize(command);
        let mut containers = self.containers.lock().unwrap();
        let entry = containers
            .get_mut(container)
            .filter(|c| c.running)
            .ok_or_else(|| SandboxError::unavailable(format!("container {container} is not running")))?;

        let (output, exit_code) = match tokens.first().map(String::as_str) {
            None => (String::new(), 0),
            Some("echo") => (format!("{}\n", tokens[1..].join(" ")), 0),
            Some("seq") => seq(&tokens),
            Some("mkdir") => mkdir(entry, &tokens, working_dir),
            Some("cat") => cat(entry, &tokens, working_dir),
            Some("ls") => ls(entry, &tokens, working_dir),
            Some("find") => find(entry, &tokens, working_dir),
            Some("grep") => grep_files(entry, &tokens, working_dir),
            Some("stat") => stat(entry, &tokens, working_dir),
            Some("true") => (String::new(), 0),
            Some(other) => (format!("sh: {other}: not found\n"), 127),
        };

        Ok(ExecOutput {
            output,
            exit_code: Some(exit_code),
            timed_out: false,
        })
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn prepare_image(&self, template: &RuntimeTemplate) -> Result<String> {
        self.prepared_images.fetch_add(1, Ordering::SeqCst);
        Ok(template
            .image
            .clone()
            .unwrap_or_else(|| template.build_tag()))
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(SandboxError::unavailable("simulated start failure"));
        }

        let mut entry = MemoryContainer {
            running: true,
            ..Default::default()
        };
        entry.dirs.insert(spec.working_dir.clone());
        for bind in &spec.binds {
            // host:container:mode
            if let Some(container_path) = bind.split(':').nth(1) {
                entry.dirs.insert(container_path.to_string());
            }
        }

        debug!(name = %spec.name, image = %spec.image, "Started in-memory container");
        self.containers
            .lock()
            .unwrap()
            .insert(spec.name.clone(), entry);
        Ok(spec.name.clone())
    }

    async fn exec(
        &self,
        container: &str,
        command: &str,
        working_dir: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        // `sleep` is the one command that takes time; everything else is
        // instantaneous map access.
        let tokens = tokenize(command);
        if tokens.first().map(String::as_str) == Some("sleep") {
            {
                let containers = self.containers.lock().unwrap();
                if !containers.get(container).is_some_and(|c| c.running) {
                    return Err(SandboxError::unavailable(format!(
                        "container {container} is not running"
                    )));
                }
            }
            let secs: f64 = tokens
                .get(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            let wanted = Duration::from_secs_f64(secs);
            if wanted > timeout {
                tokio::time::sleep(timeout).await;
                return Ok(ExecOutput {
                    output: String::new(),
                    exit_code: None,
                    timed_out: true,
                });
            }
            tokio::time::sleep(wanted).await;
            return Ok(ExecOutput {
                output: String::new(),
                exit_code: Some(0),
                timed_out: false,
            });
        }

        self.run_command(container, command, working_dir)
    }

    async fn upload(&self, container: &str, dir: &str, archive: Bytes) -> Result<()> {
        let mut unpacked = Vec::new();
        let mut tar = tar::Archive::new(archive.as_ref());
        let entries = tar
            .entries()
            .map_err(|e| SandboxError::io("reading upload archive", e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| SandboxError::io("reading upload archive", e))?;
            let path = entry
                .path()
                .map_err(|e| SandboxError::io("reading upload archive", e))?
                .to_string_lossy()
                .into_owned();
            let mut content = String::new();
            std::io::Read::read_to_string(&mut entry, &mut content)
                .map_err(|e| SandboxError::io("reading upload archive", e))?;
            unpacked.push((path, content));
        }

        let mut containers = self.containers.lock().unwrap();
        let entry = containers
            .get_mut(container)
            .filter(|c| c.running)
            .ok_or_else(|| SandboxError::unavailable(format!("container {container} is not running")))?;
        for (name, content) in unpacked {
            let absolute = format!("{}/{}", dir.trim_end_matches('/'), name);
            entry.files.insert(absolute, content);
        }
        Ok(())
    }

    async fn is_alive(&self, container: &str) -> Result<bool> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(container)
            .is_some_and(|c| c.running))
    }

    async fn stop_and_remove(&self, container: &str, remove: bool) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        if remove {
            containers.remove(container);
        } else if let Some(entry) = containers.get_mut(container) {
            entry.running = false;
        }
        Ok(())
    }
}

/// Splits a command, dropping redirections and everything after `||`.
fn tokenize(command: &str) -> Vec<String> {
    let tokens = shell_words::split(command).unwrap_or_default();
    tokens
        .into_iter()
        .take_while(|t| t != "||" && t != "&&" && t != "|")
        .filter(|t| !t.starts_with("2>") && t != "--")
        .collect()
}

fn resolve(path: &str, working_dir: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", working_dir.trim_end_matches('/'), path)
    }
}

fn mkdir(entry: &mut MemoryContainer, tokens: &[String], working_dir: &str) -> (String, i64) {
    let Some(path) = tokens.iter().skip(1).find(|t| !t.starts_with('-')) else {
        return (String::new(), 1);
    };
    entry.dirs.insert(resolve(path, working_dir));
    (String::new(), 0)
}

fn seq(tokens: &[String]) -> (String, i64) {
    let n: u64 = tokens
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    let mut out = String::new();
    for i in 1..=n {
        out.push_str(&i.to_string());
        out.push('\n');
    }
    (out, 0)
}

fn cat(entry: &MemoryContainer, tokens: &[String], working_dir: &str) -> (String, i64) {
    let Some(path) = tokens.get(1) else {
        return (String::new(), 1);
    };
    let absolute = resolve(path, working_dir);
    match entry.files.get(&absolute) {
        Some(content) => (content.clone(), 0),
        None => (format!("cat: {absolute}: No such file or directory\n"), 1),
    }
}

/// Direct children (name, is_dir, size) of a directory.
fn children(entry: &MemoryContainer, dir: &str) -> Vec<(String, bool, u64)> {
    let prefix = format!("{}/", dir.trim_end_matches('/'));
    let mut seen = BTreeMap::new();
    for (path, content) in &entry.files {
        if let Some(rest) = path.strip_prefix(&prefix) {
            match rest.split_once('/') {
                None => {
                    seen.insert(rest.to_string(), (false, content.len() as u64));
                }
                Some((first, _)) => {
                    seen.entry(first.to_string()).or_insert((true, 0));
                }
            }
        }
    }
    for dir_path in &entry.dirs {
        if let Some(rest) = dir_path.strip_prefix(&prefix) {
            if !rest.is_empty() && !rest.contains('/') {
                seen.insert(rest.to_string(), (true, 0));
            }
        }
    }
    seen.into_iter()
        .map(|(name, (is_dir, size))| (name, is_dir, size))
        .collect()
}

fn dir_exists(entry: &MemoryContainer, dir: &str) -> bool {
    let trimmed = dir.trim_end_matches('/');
    entry.dirs.iter().any(|d| d == trimmed)
        || entry
            .files
            .keys()
            .any(|p| p.starts_with(&format!("{trimmed}/")))
}

fn ls(entry: &MemoryContainer, tokens: &[String], working_dir: &str) -> (String, i64) {
    let path = tokens
        .iter()
        .skip(1)
        .find(|t| !t.starts_with('-'))
        .map(|p| resolve(p, working_dir))
        .unwrap_or_else(|| working_dir.to_string());

    if !dir_exists(entry, &path) {
        return (
            format!("ls: {path}: No such file or directory\n"),
            1,
        );
    }

    let mut out = String::new();
    for (name, _, _) in children(entry, &path) {
        out.push_str(&name);
        out.push('\n');
    }
    (out, 0)
}

fn find(entry: &MemoryContainer, tokens: &[String], working_dir: &str) -> (String, i64) {
    let Some(root) = tokens.get(1) else {
        return (String::new(), 1);
    };
    let root = resolve(root, working_dir);
    let maxdepth_one = tokens.iter().any(|t| t == "-maxdepth");
    let printf = tokens.iter().any(|t| t == "-printf");

    if !dir_exists(entry, &root) {
        return (format!("find: {root}: No such file or directory\n"), 1);
    }

    let mut out = String::new();
    if maxdepth_one {
        for (name, is_dir, size) in children(entry, &root) {
            if printf {
                let kind = if is_dir { 'd' } else { 'f' };
                out.push_str(&format!("{kind}\t{size}\t{name}\n"));
            } else {
                out.push_str(&format!("{}/{name}\n", root.trim_end_matches('/')));
            }
        }
    } else {
        // Recursive; `-type f` is implied by every caller in this crate.
        let prefix = format!("{}/", root.trim_end_matches('/'));
        for path in entry.files.keys() {
            if path.starts_with(&prefix) {
                out.push_str(path);
                out.push('\n');
            }
        }
    }
    (out, 0)
}

fn grep_files(entry: &MemoryContainer, tokens: &[String], working_dir: &str) -> (String, i64) {
    let args: Vec<&String> = tokens.iter().skip(1).filter(|t| !t.starts_with('-')).collect();
    let (Some(pattern), Some(path)) = (args.first(), args.get(1)) else {
        return (String::new(), 2);
    };
    let root = resolve(path, working_dir);

    let mut out = String::new();
    for (file, content) in &entry.files {
        let in_scope = file == &root || file.starts_with(&format!("{}/", root.trim_end_matches('/')));
        if !in_scope {
            continue;
        }
        for (idx, line) in content.lines().enumerate() {
            if line.contains(pattern.as_str()) {
                out.push_str(&format!("{file}:{}:{line}\n", idx + 1));
            }
        }
    }

    if out.is_empty() {
        (out, 1)
    } else {
        (out, 0)
    }
}

fn stat(entry: &MemoryContainer, tokens: &[String], working_dir: &str) -> (String, i64) {
    // stat -c '%s|%A|%y' <path>
    let Some(path) = tokens.iter().skip(1).find(|t| !t.starts_with('-') && !t.contains('%')) else {
        return (String::new(), 1);
    };
    let absolute = resolve(path, working_dir);
    match entry.files.get(&absolute) {
        Some(content) => (
            format!("{}|-rw-r--r--|2024-01-01 00:00:00.000000000 +0000\n", content.len()),
            0,
        ),
        None => (String::new(), 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "cell-test".to_string(),
            image: "workcell-sandbox:latest".to_string(),
            binds: vec![
                "/srv/uploads/1/1:/workspace/uploads:rw".to_string(),
                "/srv/intermediate/1/1:/workspace/intermediate:rw".to_string(),
            ],
            env: vec![],
            working_dir: "/workspace".to_string(),
        }
    }

    async fn started() -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.create_and_start(&spec()).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_exec_requires_running_container() {
        let engine = MemoryEngine::new();
        let err = engine
            .exec("ghost", "echo hi", "/workspace", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_echo_and_cat_roundtrip() {
        let engine = started().await;
        engine.seed_file("cell-test", "/workspace/uploads/data.csv", "a,b\n1,2\n");

        let out = engine
            .exec("cell-test", "cat uploads/data.csv", "/workspace", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.output, "a,b\n1,2\n");

        let missing = engine
            .exec("cell-test", "cat uploads/nope.csv", "/workspace", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(missing.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_sleep_honors_timeout() {
        let engine = started().await;
        let start = std::time::Instant::now();
        let out = engine
            .exec("cell-test", "sleep 5", "/workspace", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_upload_unpacks_archive() {
        let engine = started().await;

        let mut tar_buf = Vec::new();
        {
            let mut tar = tar::Builder::new(&mut tar_buf);
            let data = b"hello";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, "out.txt", &data[..]).unwrap();
            tar.finish().unwrap();
        }

        engine
            .upload("cell-test", "/workspace/intermediate", Bytes::from(tar_buf))
            .await
            .unwrap();

        let out = engine
            .exec(
                "cell-test",
                "cat /workspace/intermediate/out.txt",
                "/workspace",
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(out.output, "hello");
    }

    #[tokio::test]
    async fn test_find_recursive_and_maxdepth() {
        let engine = started().await;
        engine.seed_file("cell-test", "/workspace/uploads/a.csv", "x");
        engine.seed_file("cell-test", "/workspace/uploads/sub/b.csv", "y");

        let recursive = engine
            .exec(
                "cell-test",
                "find /workspace/uploads -type f 2>/dev/null || true",
                "/workspace",
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(recursive.output.contains("/workspace/uploads/a.csv"));
        assert!(recursive.output.contains("/workspace/uploads/sub/b.csv"));

        let shallow = engine
            .exec(
                "cell-test",
                "find /workspace/uploads -mindepth 1 -maxdepth 1 -printf '%y\t%s\t%f\n'",
                "/workspace",
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(shallow.output.contains("f\t1\ta.csv"));
        assert!(shallow.output.contains("d\t0\tsub"));
    }

    #[tokio::test]
    async fn test_grep_reports_line_numbers() {
        let engine = started().await;
        engine.seed_file("cell-test", "/workspace/uploads/log.txt", "ok\nerror: bad\nok\n");

        let out = engine
            .exec(
                "cell-test",
                "grep -rn -- error /workspace/uploads",
                "/workspace",
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(out.output, "/workspace/uploads/log.txt:2:error: bad\n");
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_stop_and_remove_is_idempotent() {
        let engine = started().await;
        engine.stop_and_remove("cell-test", true).await.unwrap();
        engine.stop_and_remove("cell-test", true).await.unwrap();
        assert_eq!(engine.container_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_container_marks_dead() {
        let engine = started().await;
        assert!(engine.is_alive("cell-test").await.unwrap());
        engine.kill_container("cell-test");
        assert!(!engine.is_alive("cell-test").await.unwrap());
    }
}
