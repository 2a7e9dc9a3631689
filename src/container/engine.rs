//! Container engine abstraction and the Docker implementation

use std::pin::Pin;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use crate::models::ContainerConfig;

use super::error::{Result, SandboxError};

/// CPU cap for every sandbox: half of one core
pub const SANDBOX_NANO_CPUS: i64 = 500_000_000;

/// Memory cap for every sandbox: 128 MiB
pub const SANDBOX_MEMORY_BYTES: i64 = 1 << 27;

/// Byte stream of a tar archive headed for a container
pub type ArchiveStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Attached stdio of a TTY container.
///
/// With a pseudo-terminal, stdout and stderr arrive interleaved on `output`.
pub struct ContainerIo {
    pub output: BoxStream<'static, Result<Bytes>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// Operations the session core needs from a container engine.
///
/// Implementations must be safe to share between sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create (but do not start) a sandboxed container, returning its id
    async fn create(&self, config: &ContainerConfig) -> Result<String>;

    /// Attach to the container's stdio stream
    async fn attach(&self, id: &str) -> Result<ContainerIo>;

    /// Start a created container
    async fn start(&self, id: &str) -> Result<()>;

    /// Force-remove a container whatever its state
    async fn remove(&self, id: &str) -> Result<()>;

    /// Extract a tar archive into the container's root directory
    async fn upload_archive(&self, id: &str, archive: ArchiveStream) -> Result<()>;

    /// Pull an image into the local store
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Engine version string
    async fn version(&self) -> Result<String>;
}

/// Build the engine-side configuration for a sandbox container.
///
/// TTY with open stdin, no network, half a CPU and 128 MiB of memory.
pub fn sandbox_config(config: &ContainerConfig) -> Config<String> {
    Config {
        image: Some(config.image.clone()),
        cmd: (!config.command.is_empty()).then(|| config.command.clone()),
        tty: Some(true),
        open_stdin: Some(true),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            nano_cpus: Some(SANDBOX_NANO_CPUS),
            memory: Some(SANDBOX_MEMORY_BYTES),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Docker engine reached through the bollard API client
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the local defaults (honours `DOCKER_HOST`)
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| SandboxError::engine("connect", e))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, config: &ContainerConfig) -> Result<String> {
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, sandbox_config(config))
            .await
            .map_err(|e| SandboxError::engine("create", e))?;

        for warning in &response.warnings {
            debug!(container_id = %response.id, warning = %warning, "Engine warning on create");
        }

        Ok(response.id)
    }

    async fn attach(&self, id: &str) -> Result<ContainerIo> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };

        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| SandboxError::engine("attach", e))?;

        let output = output
            .map(|item| match item {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::StdIn { message })
                | Ok(LogOutput::Console { message }) => Ok(message),
                Err(e) => Err(SandboxError::engine("read", e)),
            })
            .boxed();

        Ok(ContainerIo { output, input })
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::engine("start", e))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| SandboxError::engine("remove", e))
    }

    async fn upload_archive(&self, id: &str, archive: ArchiveStream) -> Result<()> {
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(id, Some(options), hyper::Body::wrap_stream(archive))
            .await
            .map_err(|e| SandboxError::engine("copy", e))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let progress: Vec<_> = self
            .docker
            .create_image(Some(options), None, None)
            .try_collect()
            .await
            .map_err(|e| SandboxError::engine("pull", e))?;

        info!(image = %image, events = progress.len(), "Image pulled");
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| SandboxError::engine("version", e))?;

        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn python() -> ContainerConfig {
        ContainerConfig {
            image: "python:3-alpine".to_string(),
            command: vec!["python3".to_string(), "/code".to_string()],
        }
    }

    #[test]
    fn test_sandbox_is_isolated_and_capped() {
        let config = sandbox_config(&python());

        assert_eq!(config.image.as_deref(), Some("python:3-alpine"));
        assert_eq!(
            config.cmd,
            Some(vec!["python3".to_string(), "/code".to_string()])
        );
        assert_eq!(config.tty, Some(true));
        assert_eq!(config.open_stdin, Some(true));
        assert_eq!(config.network_disabled, Some(true));

        let host = config.host_config.expect("host config");
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
    }

    #[test]
    fn test_empty_command_keeps_image_default() {
        let config = sandbox_config(&ContainerConfig {
            image: "bash:5".to_string(),
            command: vec![],
        });
        assert!(config.cmd.is_none());
    }
}
