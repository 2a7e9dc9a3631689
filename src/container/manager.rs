//! Container lifecycle management

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{ContainerConfig, Languages};

use super::engine::{ArchiveStream, ContainerEngine, ContainerIo};
use super::error::{Result, SandboxError};

/// Action run against a created container before it is started
#[async_trait]
pub trait PrestartAction: Send {
    async fn before_start(&mut self, container: &PendingContainer) -> Result<()>;
}

/// A created but not yet started container
pub struct PendingContainer {
    id: String,
    engine: Arc<dyn ContainerEngine>,
}

impl PendingContainer {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Extract a tar archive into the container's root filesystem
    pub async fn copy_archive(&self, archive: ArchiveStream) -> Result<()> {
        self.engine.upload_archive(&self.id, archive).await
    }
}

/// Deploys sandbox containers on a shared engine
pub struct ContainerManager {
    /// Engine client, shared read-only between sessions
    engine: Arc<dyn ContainerEngine>,

    /// Budget for each forced removal
    stop_timeout: Duration,
}

impl ContainerManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, stop_timeout: Duration) -> Self {
        Self {
            engine,
            stop_timeout,
        }
    }

    /// Create, prepare, attach and start a container.
    ///
    /// Every engine call is bounded by `deadline`. If anything after creation
    /// fails the container is force-removed before the error is returned.
    pub async fn deploy(
        &self,
        config: &ContainerConfig,
        deadline: Instant,
        prestart: Option<&mut dyn PrestartAction>,
    ) -> Result<Container> {
        let id = within(deadline, self.engine.create(config)).await?;
        info!(container_id = %id, image = %config.image, "Container created");

        match self.prepare(&id, deadline, prestart).await {
            Ok(io) => {
                info!(container_id = %id, "Container started");
                Ok(Container::new(id, self.engine.clone(), io, self.stop_timeout))
            }
            Err(err) => {
                debug!(container_id = %id, error = %err, "Deploy failed, discarding container");
                self.discard(&id).await;
                Err(err)
            }
        }
    }

    async fn prepare(
        &self,
        id: &str,
        deadline: Instant,
        prestart: Option<&mut dyn PrestartAction>,
    ) -> Result<ContainerIo> {
        if let Some(action) = prestart {
            let pending = PendingContainer {
                id: id.to_string(),
                engine: self.engine.clone(),
            };
            within(deadline, action.before_start(&pending)).await?;
        }

        let io = within(deadline, self.engine.attach(id)).await?;
        within(deadline, self.engine.start(id)).await?;

        Ok(io)
    }

    /// Best-effort removal; failures are logged only
    async fn discard(&self, id: &str) {
        match time::timeout(self.stop_timeout, self.engine.remove(id)).await {
            Ok(Ok(())) => debug!(container_id = %id, "Container removed"),
            Ok(Err(err)) => warn!(container_id = %id, error = %err, "Failed to remove container"),
            Err(_) => warn!(container_id = %id, "Timed out removing container"),
        }
    }

    /// Pull every image referenced by the language table
    pub async fn pull_images(&self, languages: &Languages) -> Result<()> {
        for image in languages.images() {
            info!(image = %image, "Pulling image");
            self.engine.pull_image(image).await?;
        }
        Ok(())
    }

    /// Engine version, or `None` if the engine is unreachable
    pub async fn engine_version(&self) -> Option<String> {
        self.engine.version().await.ok()
    }
}

async fn within<T, F>(deadline: Instant, step: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    time::timeout_at(deadline, step)
        .await
        .map_err(|_| SandboxError::Timeout("start"))?
}

struct OutputReader {
    stream: BoxStream<'static, Result<Bytes>>,
    pending: Bytes,
}

/// A running, attached sandbox container
pub struct Container {
    id: String,
    engine: Arc<dyn ContainerEngine>,
    output: Mutex<OutputReader>,
    input: Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    remove_timeout: Duration,
}

impl Container {
    pub fn new(
        id: String,
        engine: Arc<dyn ContainerEngine>,
        io: ContainerIo,
        remove_timeout: Duration,
    ) -> Self {
        Self {
            id,
            engine,
            output: Mutex::new(OutputReader {
                stream: io.output,
                pending: Bytes::new(),
            }),
            input: Mutex::new(io.input),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            remove_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read the next non-empty chunk of output, at most `max` bytes long
    pub async fn read(&self, max: usize) -> Result<Bytes> {
        let max = max.max(1);
        let mut reader = self.output.lock().await;

        while reader.pending.is_empty() {
            if self.shutdown.is_cancelled() {
                return Err(SandboxError::ContainerClosed);
            }

            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(SandboxError::ContainerClosed),
                next = reader.stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => reader.pending = chunk,
                Some(Err(err)) => return Err(err),
                None => return Err(SandboxError::StreamClosed),
            }
        }

        let n = reader.pending.len().min(max);
        Ok(reader.pending.split_to(n))
    }

    /// Write all of `data` to the container's stdin
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut input = self.input.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(SandboxError::ContainerClosed);
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(SandboxError::ContainerClosed),
            res = async {
                input.write_all(data).await?;
                input.flush().await
            } => res.map_err(SandboxError::from),
        }
    }

    /// Close the stdio stream and force-remove the container.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    pub async fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        self.shutdown.cancel();

        let close_result = {
            let mut input = self.input.lock().await;
            match time::timeout(self.remove_timeout, input.shutdown()).await {
                Ok(res) => res.map_err(SandboxError::from),
                Err(_) => Err(SandboxError::Timeout("stdio close")),
            }
        };
        self.output.lock().await.stream = futures::stream::empty().boxed();

        let remove_result = match time::timeout(self.remove_timeout, self.engine.remove(&self.id)).await {
            Ok(res) => res,
            Err(_) => Err(SandboxError::Timeout("container removal")),
        };

        match &remove_result {
            Ok(()) => info!(container_id = %self.id, "Container removed"),
            Err(err) => warn!(container_id = %self.id, error = %err, "Failed to remove container"),
        }

        close_result?;
        remove_result
    }
}
