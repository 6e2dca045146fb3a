//! Docker implementation of the container engine.

use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, ListImagesOptions};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use tar::Builder;
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, ContainerSpec, ExecOutput};
use crate::error::{Result, SandboxError};
use crate::runtime::RuntimeTemplate;

/// Container engine backed by a Docker daemon.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects with the local daemon defaults and verifies it responds.
    ///
    /// # Errors
    ///
    /// Returns `EngineUnreachable` when the daemon is down.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::engine_unreachable(format!("connecting to Docker: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| SandboxError::engine_unreachable(format!("pinging Docker daemon: {e}")))?;

        Ok(Self { docker })
    }

    /// Check if an image exists locally.
    async fn image_exists_locally(&self, image: &str) -> Result<bool> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| engine_error("listing images", &e))?;

        let (name, tag) = parse_image_tag(image);

        Ok(images.iter().any(|img| {
            img.repo_tags.iter().any(|tag_str| {
                if let Some(colon_pos) = tag_str.rfind(':') {
                    let (n, t) = tag_str.split_at(colon_pos);
                    n == name && &t[1..] == tag
                } else {
                    tag_str == name && tag == "latest"
                }
            })
        }))
    }

    /// Pull an image from its registry.
    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image, "Pulling image");

        let pull_options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(pull_options), None, None);

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(progress) => {
                    if let Some(error) = &progress.error {
                        return Err(SandboxError::runtime_build(format!(
                            "pulling {image}: {error}"
                        )));
                    }
                }
                Err(e) => {
                    return Err(SandboxError::runtime_build(format!("pulling {image}: {e}")));
                }
            }
        }

        Ok(())
    }

    /// Build an image from a synthesized Dockerfile, tagged `tag`.
    async fn build_image(&self, dockerfile: &str, tag: &str) -> Result<()> {
        info!(tag, "Building runtime image");

        // Build context: a tarball holding just the Dockerfile.
        let mut tar_buf = Vec::new();
        {
            let mut tar = Builder::new(&mut tar_buf);
            let bytes = dockerfile.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, "Dockerfile", bytes)
                .map_err(|e| SandboxError::runtime_build(format!("creating build context: {e}")))?;
            tar.finish()
                .map_err(|e| SandboxError::runtime_build(format!("creating build context: {e}")))?;
        }
        let tar_bytes = Bytes::from(tar_buf);

        let build_options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.build_image(build_options, None, Some(tar_bytes));

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => {
                    if let Some(stream_text) = &output.stream {
                        let trimmed = stream_text.trim();
                        if !trimmed.is_empty() {
                            debug!(tag, "{trimmed}");
                        }
                    } else if let Some(error) = &output.error {
                        return Err(SandboxError::runtime_build(format!(
                            "building {tag}: {error}"
                        )));
                    }
                }
                Err(e) => {
                    return Err(SandboxError::runtime_build(format!("building {tag}: {e}")));
                }
            }
        }

        Ok(())
    }

    /// Best-effort kill of a timed-out exec process inside the container.
    async fn kill_exec_process(&self, container: &str, exec_id: &str) {
        let pid = match self.docker.inspect_exec(exec_id).await {
            Ok(inspect) => inspect.pid,
            Err(e) => {
                warn!(container, error = %e, "Could not inspect timed-out exec");
                return;
            }
        };

        let Some(pid) = pid else { return };

        let kill = CreateExecOptions {
            cmd: Some(vec!["kill".to_string(), "-9".to_string(), pid.to_string()]),
            ..Default::default()
        };

        match self.docker.create_exec(container, kill).await {
            Ok(exec) => {
                let _ = self.docker.start_exec(&exec.id, None).await;
            }
            Err(e) => warn!(container, pid, error = %e, "Could not kill timed-out process"),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::engine_unreachable(format!("pinging Docker daemon: {e}")))
    }

    async fn prepare_image(&self, template: &RuntimeTemplate) -> Result<String> {
        if let Some(image) = &template.image {
            if !self.image_exists_locally(image).await? {
                self.pull_image(image).await?;
            }
            return Ok(image.clone());
        }

        let tag = template.build_tag();
        if template.cache_image && self.image_exists_locally(&tag).await? {
            debug!(tag, "Using cached runtime image");
            return Ok(tag);
        }

        let dockerfile = template.dockerfile()?;
        self.build_image(&dockerfile, &tag).await?;
        Ok(tag)
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        debug!(name = %spec.name, image = %spec.image, "Creating container");

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            // Keep PID 1 alive so exec sessions have a target.
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "sleep infinity".to_string(),
            ]),
            host_config: Some(bollard::service::HostConfig {
                binds: Some(spec.binds.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| engine_error("creating container", &e))?;

        self.docker
            .start_container::<String>(&spec.name, None)
            .await
            .map_err(|e| engine_error("starting container", &e))?;

        Ok(spec.name.clone())
    }

    async fn exec(
        &self,
        container: &str,
        command: &str,
        working_dir: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-lc".to_string(),
                        command.to_string(),
                    ]),
                    working_dir: Some(working_dir.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| engine_error("creating exec", &e))?;

        let start = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| engine_error("starting exec", &e))?;

        let mut output = String::new();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = start
        {
            let drain = async {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                            output.push_str(&String::from_utf8_lossy(&message));
                        }
                        Err(e) => {
                            warn!(container, error = %e, "Error reading exec output");
                            break;
                        }
                        _ => {}
                    }
                }
            };

            if tokio::time::timeout(timeout, drain).await.is_err() {
                self.kill_exec_process(container, &exec.id).await;
                return Ok(ExecOutput {
                    output,
                    exit_code: None,
                    timed_out: true,
                });
            }
        }

        let exit_code = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .ok()
            .and_then(|inspect| inspect.exit_code);

        Ok(ExecOutput {
            output,
            exit_code,
            timed_out: false,
        })
    }

    async fn upload(&self, container: &str, dir: &str, archive: Bytes) -> Result<()> {
        self.docker
            .upload_to_container(
                container,
                Some(bollard::container::UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(|e| engine_error("uploading to container", &e))
    }

    async fn is_alive(&self, container: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(e) if is_gone(&e) => Ok(false),
            Err(e) => Err(engine_error("inspecting container", &e)),
        }
    }

    async fn stop_and_remove(&self, container: &str, remove: bool) -> Result<()> {
        debug!(container, "Stopping container");

        match self
            .docker
            .stop_container(container, Some(StopContainerOptions { t: 5 }))
            .await
        {
            Ok(()) => {}
            Err(e) if is_gone(&e) => {}
            Err(e) => return Err(engine_error("stopping container", &e)),
        }

        if remove {
            match self
                .docker
                .remove_container(
                    container,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => {}
                Err(e) if is_gone(&e) => {}
                Err(e) => return Err(engine_error("removing container", &e)),
            }
        }

        Ok(())
    }
}

/// Maps a bollard error onto the crate taxonomy.
///
/// Daemon responses mean the engine is up but the operation failed; anything
/// else (socket, protocol) means the engine is unreachable.
fn engine_error(context: &str, err: &bollard::errors::Error) -> SandboxError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => SandboxError::unavailable(format!("{context}: {status_code} {message}")),
        other => SandboxError::engine_unreachable(format!("{context}: {other}")),
    }
}

/// Daemon responses meaning "that container no longer exists".
fn is_gone(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 304 | 409,
            ..
        }
    )
}

/// Parse image name and tag from a reference.
fn parse_image_tag(image: &str) -> (&str, &str) {
    if let Some(colon_pos) = image.rfind(':') {
        let (name, tag) = image.split_at(colon_pos);
        (name, &tag[1..])
    } else {
        (image, "latest")
    }
}
