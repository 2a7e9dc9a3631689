//! Container sessions: one WebSocket client bridged to one sandbox container
//!
//! A session narrates startup with JSON status frames, deploys its container
//! (uploading the client's code first in run mode), then shuttles terminal
//! bytes in both directions until either side fails, closes or stalls.

use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};
use uuid::Uuid;

use crate::metrics;
use crate::models::{ContainerConfig, Status, StatusUpdate};

use super::archive::CodeArchive;
use super::error::{Result, SandboxError};
use super::manager::{Container, ContainerManager, PendingContainer, PrestartAction};

/// Write deadline for ping frames
pub const PING_WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Output, input and ping
const IO_LOOPS: usize = 3;

/// Process-wide session settings, shared by every session
#[derive(Debug, Clone)]
pub struct ContainerSessionConfig {
    /// Largest chunk of container output forwarded in one frame
    pub output_buffer_size: usize,

    /// How long to wait for the client's half of the close handshake
    pub shutdown_timeout: Duration,

    /// Interval between pings; also the pong deadline
    pub ping_rate: Duration,

    /// Budget for removing a container
    pub container_stop_timeout: Duration,

    /// Budget for create, upload, attach and start together
    pub start_timeout: Duration,

    /// Budget for the I/O phase
    pub session_timeout: Duration,
}

/// What a session does with its container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Bare interactive shell
    Terminal,
    /// Upload one file of client code, then run it
    Run,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Terminal => "term",
            SessionMode::Run => "run",
        }
    }
}

/// Both halves of the client WebSocket.
///
/// The sink is shared by the output and ping loops, the stream by the input
/// loop and the close handshake.
#[derive(Clone)]
struct ClientConn {
    sink: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    stream: Arc<Mutex<SplitStream<WebSocket>>>,
}

impl ClientConn {
    fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Arc::new(Mutex::new(sink)),
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.sink.lock().await.send(message).await?;
        Ok(())
    }

    async fn send_status(&self, update: &StatusUpdate) -> Result<()> {
        let text = serde_json::to_string(update)?;
        self.send(Message::Text(text)).await
    }

    async fn recv(&self) -> Result<Message> {
        match self.stream.lock().await.next().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(err)) => Err(err.into()),
            None => Err(SandboxError::ClientGone),
        }
    }

    async fn close_transport(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

/// A terminal session between one client and one container
pub struct ContainerSession {
    id: Uuid,
    language: String,
    mode: SessionMode,
    container_config: ContainerConfig,
    client: ClientConn,
    container: Option<Arc<Container>>,
    config: Arc<ContainerSessionConfig>,
    manager: Arc<ContainerManager>,
    teardown: CancellationToken,
    closed: AtomicBool,
}

impl ContainerSession {
    pub fn new(
        socket: WebSocket,
        language: impl Into<String>,
        mode: SessionMode,
        container_config: ContainerConfig,
        config: Arc<ContainerSessionConfig>,
        manager: Arc<ContainerManager>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            language: language.into(),
            mode,
            container_config,
            client: ClientConn::new(socket),
            container: None,
            config,
            manager,
            teardown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drive the whole session and close it on the way out
    pub async fn serve(&mut self) {
        match self.update_status(StatusUpdate::new(Status::Starting)).await {
            Ok(()) => self.run_phases().await,
            Err(err) => debug!(error = %err, "Client left before the session started"),
        }

        self.close().await;
    }

    async fn run_phases(&mut self) {
        let started = std::time::Instant::now();
        let deployed = self
            .create_container(Instant::now() + self.config.start_timeout)
            .await;
        metrics::record_deploy(
            &self.language,
            self.mode.as_str(),
            started.elapsed().as_secs_f64(),
            deployed.is_ok(),
        );

        if let Err(err) = deployed {
            warn!(error = %err, "Failed to start container");
            let _ = self.update_status(StatusUpdate::error(&err)).await;
            return;
        }

        if self
            .update_status(StatusUpdate::new(Status::Running))
            .await
            .is_err()
        {
            return;
        }

        match self.run_io(Instant::now() + self.config.session_timeout).await {
            Ok(()) => info!("Session ended"),
            Err(err) => {
                metrics::record_io_stopped(err.kind());
                info!(error = %err, "I/O stopped with error");
            }
        }
    }

    /// Send a status frame to the client
    pub async fn update_status(&self, update: StatusUpdate) -> Result<()> {
        debug!(status = ?update.status, "Status update");
        self.client.send_status(&update).await
    }

    /// Deploy the session's container, uploading client code first in run mode
    pub async fn create_container(&mut self, deadline: Instant) -> Result<()> {
        let mut upload = CodeUpload {
            client: self.client.clone(),
        };
        let prestart: Option<&mut dyn PrestartAction> = match self.mode {
            SessionMode::Run => Some(&mut upload),
            SessionMode::Terminal => None,
        };

        let container = self
            .manager
            .deploy(&self.container_config, deadline, prestart)
            .await?;
        self.container = Some(Arc::new(container));

        Ok(())
    }

    /// Bridge container and client until the first loop stops or `deadline`
    /// passes, then close the session.
    ///
    /// Returns the first loop's result. All three loops have finished by the
    /// time this returns.
    pub async fn run_io(&self, deadline: Instant) -> Result<()> {
        let container = self
            .container
            .clone()
            .ok_or(SandboxError::ContainerClosed)?;

        let (results_tx, mut results) = mpsc::channel(IO_LOOPS - 1);
        let (pong_tx, pong_rx) = mpsc::channel(1);

        spawn_loop(
            &results_tx,
            run_output(
                self.client.clone(),
                container.clone(),
                self.config.output_buffer_size,
                self.teardown.clone(),
            ),
        );
        spawn_loop(
            &results_tx,
            run_input(
                self.client.clone(),
                container,
                pong_tx,
                self.teardown.clone(),
            ),
        );
        spawn_loop(
            &results_tx,
            run_ping(
                self.client.clone(),
                self.config.ping_rate,
                pong_rx,
                self.teardown.clone(),
            ),
        );
        drop(results_tx);

        let mut outstanding = IO_LOOPS;
        let first = tokio::select! {
            result = results.recv() => {
                outstanding -= 1;
                result.unwrap_or(Ok(()))
            }
            _ = time::sleep_until(deadline) => Err(SandboxError::Timeout("session")),
        };

        self.close().await;

        while outstanding > 0 && results.recv().await.is_some() {
            outstanding -= 1;
        }

        first
    }

    /// Tear the session down: stop the I/O loops, remove the container and
    /// close the WebSocket, with a bounded close handshake.
    ///
    /// Safe to call more than once; only the first call acts.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.teardown.cancel();

        if let Some(container) = &self.container {
            if let Err(err) = container.close().await {
                warn!(container_id = %container.id(), error = %err, "Container teardown failed");
            }
        }

        let goodbye = Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Borrowed(""),
        }));
        let sent = time::timeout(self.config.shutdown_timeout, self.client.send(goodbye)).await;

        if matches!(sent, Ok(Ok(()))) {
            let client = self.client.clone();
            let drain = async move { while client.recv().await.is_ok() {} };
            if time::timeout(self.config.shutdown_timeout, drain).await.is_err() {
                debug!("Client did not finish the close handshake in time");
            }
        }

        if time::timeout(self.config.shutdown_timeout, self.client.close_transport())
            .await
            .is_err()
        {
            debug!("Timed out closing the client transport");
        }
    }
}

fn spawn_loop<F>(results: &mpsc::Sender<Result<()>>, io_loop: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let results = results.clone();
    tokio::spawn(
        async move {
            let _ = results.send(io_loop.await).await;
        }
        .instrument(Span::current()),
    );
}

/// Container output to client text frames
async fn run_output(
    client: ClientConn,
    container: Arc<Container>,
    buffer_size: usize,
    teardown: CancellationToken,
) -> Result<()> {
    let mut framer = TextFramer::default();

    loop {
        let chunk = tokio::select! {
            _ = teardown.cancelled() => return Ok(()),
            chunk = container.read(buffer_size) => chunk?,
        };

        let Some(text) = framer.frame(&chunk) else {
            continue;
        };

        tokio::select! {
            _ = teardown.cancelled() => return Ok(()),
            sent = client.send(Message::Text(text)) => sent?,
        }
    }
}

/// Client frames to container input
async fn run_input(
    client: ClientConn,
    container: Arc<Container>,
    pongs: mpsc::Sender<()>,
    teardown: CancellationToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            _ = teardown.cancelled() => return Ok(()),
            message = client.recv() => message?,
        };

        match message {
            Message::Text(text) => container.write(text.as_bytes()).await?,
            Message::Binary(data) => container.write(&data).await?,
            Message::Pong(_) => {
                let _ = pongs.try_send(());
            }
            Message::Ping(_) => {}
            Message::Close(frame) => {
                debug!(?frame, "Client sent close frame");
                return Ok(());
            }
        }
    }
}

/// Liveness probe.
///
/// The same ticker schedules pings and bounds the wait for each pong, so a
/// client has one full interval to answer.
async fn run_ping(
    client: ClientConn,
    rate: Duration,
    mut pongs: mpsc::Receiver<()>,
    teardown: CancellationToken,
) -> Result<()> {
    let mut ticker = time::interval_at(Instant::now() + rate, rate);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = teardown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let ping = time::timeout(PING_WRITE_DEADLINE, client.send(Message::Ping(vec![1])));
        tokio::select! {
            _ = teardown.cancelled() => return Ok(()),
            sent = ping => sent.map_err(|_| SandboxError::Timeout("ping write"))??,
        }

        tokio::select! {
            _ = teardown.cancelled() => return Ok(()),
            Some(()) = pongs.recv() => {}
            _ = ticker.tick() => return Err(SandboxError::StalledClient),
        }
    }
}

/// Pre-start hook for run mode: take one frame of code from the client and
/// copy it into the container as `/code`.
struct CodeUpload {
    client: ClientConn,
}

#[async_trait]
impl PrestartAction for CodeUpload {
    async fn before_start(&mut self, container: &PendingContainer) -> Result<()> {
        self.client
            .send_status(&StatusUpdate::new(Status::Ready))
            .await?;

        let code = match self.client.recv().await? {
            Message::Text(text) => Bytes::from(text),
            Message::Binary(data) => Bytes::from(data),
            other => {
                return Err(SandboxError::Protocol(format!(
                    "expected code, got a {} frame",
                    frame_kind(&other)
                )))
            }
        };
        debug!(container_id = %container.id(), bytes = code.len(), "Code received");

        self.client
            .send_status(&StatusUpdate::new(Status::Uploading))
            .await?;

        let (archive, packer) = CodeArchive::pack(code).into_parts();
        container.copy_archive(archive).await?;
        packer.finish().await?;

        self.client
            .send_status(&StatusUpdate::new(Status::Starting))
            .await
    }
}

fn frame_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
    }
}

/// Turns raw terminal bytes into valid UTF-8 text frames.
///
/// A character split across two reads is held back until it is complete;
/// bytes that can never be valid are replaced.
#[derive(Debug, Default)]
struct TextFramer {
    carry: Vec<u8>,
}

impl TextFramer {
    fn frame(&mut self, chunk: &[u8]) -> Option<String> {
        self.carry.extend_from_slice(chunk);

        let complete = self.carry.len() - incomplete_suffix_len(&self.carry);

        let rest = self.carry.split_off(complete);
        let text = std::mem::replace(&mut self.carry, rest);
        if text.is_empty() {
            return None;
        }

        Some(match String::from_utf8(text) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        })
    }
}

/// Length of a trailing UTF-8 sequence that later bytes could still complete
fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    // A sequence is at most four bytes, so only the last three can be pending
    let floor = bytes.len().saturating_sub(3);
    for start in (floor..bytes.len()).rev() {
        let lead = bytes[start];
        if lead & 0xC0 == 0x80 {
            continue;
        }
        let tail = &bytes[start..];
        return match std::str::from_utf8(tail) {
            Err(err) if err.valid_up_to() == 0 && err.error_len().is_none() => tail.len(),
            _ => 0,
        };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_framer_passes_ascii_through() {
        let mut framer = TextFramer::default();
        assert_eq!(framer.frame(b"1\n").as_deref(), Some("1\n"));
        assert_eq!(framer.frame(b"").as_deref(), None);
    }

    #[test]
    fn test_framer_joins_split_characters() {
        let snowman = "\u{2603}".as_bytes();
        let mut framer = TextFramer::default();

        assert_eq!(framer.frame(&[b'a', snowman[0]]).as_deref(), Some("a"));
        assert_eq!(framer.frame(&snowman[1..2]).as_deref(), None);
        assert_eq!(framer.frame(&snowman[2..]).as_deref(), Some("\u{2603}"));
    }

    #[test]
    fn test_framer_replaces_invalid_bytes() {
        let mut framer = TextFramer::default();
        assert_eq!(framer.frame(&[b'o', 0xff, b'k']).as_deref(), Some("o\u{fffd}k"));
        assert!(framer.carry.is_empty());
    }

    #[test]
    fn test_framer_carries_split_character_after_invalid_byte() {
        let mut framer = TextFramer::default();
        assert_eq!(framer.frame(&[0xff, 0xe2]).as_deref(), Some("\u{fffd}"));
        assert_eq!(framer.frame(&[0x98, 0x83]).as_deref(), Some("\u{2603}"));
    }

    #[test]
    fn test_framer_flushes_truncated_sequence_once_broken() {
        let mut framer = TextFramer::default();
        assert_eq!(framer.frame(&[b'a', 0xe2, 0x98]).as_deref(), Some("a"));
        assert_eq!(framer.frame(b"b").as_deref(), Some("\u{fffd}b"));
        assert!(framer.carry.is_empty());
    }

    #[test]
    fn test_mode_labels() {
        assert_eq!(SessionMode::Terminal.as_str(), "term");
        assert_eq!(SessionMode::Run.as_str(), "run");
    }
}
