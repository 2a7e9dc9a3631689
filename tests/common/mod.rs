//! Shared fixtures: an in-memory container engine and a live test server

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, TryStreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::io::ReaderStream;

use boxterm::api::create_router;
use boxterm::config::{AppConfig, SessionSettings};
use boxterm::container::{
    ArchiveStream, ContainerEngine, ContainerIo, ContainerManager, Result, SandboxError,
    CODE_ENTRY_MODE, CODE_ENTRY_NAME,
};
use boxterm::models::{ContainerConfig, Languages, StatusUpdate};
use boxterm::AppState;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const LANGUAGES: &str = r#"{
    "python": {
        "run": { "image": "python:3-alpine", "cmd": ["python3", "/code"] },
        "term": { "image": "python:3-alpine", "cmd": ["python3"] }
    },
    "lua": {
        "run": { "image": "nickblah/lua:5.3", "cmd": ["lua", "/code"] },
        "term": { "image": "nickblah/lua:5.3", "cmd": ["lua"] }
    }
}"#;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Attach,
    Start,
    Upload,
    Remove,
}

struct ProcessIo {
    stdin: DuplexStream,
    stdout: DuplexStream,
}

#[derive(Default)]
struct FakeContainer {
    code: Option<Vec<u8>>,
    process: Option<ProcessIo>,
}

#[derive(Default)]
struct FakeState {
    next_id: usize,
    failing: HashSet<Op>,
    containers: HashMap<String, FakeContainer>,
    created: Vec<String>,
    started: Vec<String>,
    removed: HashMap<String, usize>,
    uploads: Vec<Vec<u8>>,
}

/// Container engine whose "processes" are tasks on the test runtime.
///
/// Each started container prints the argument of a `print(...)` program,
/// then echoes its stdin until it reads `exit`.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(op: Op) -> Arc<Self> {
        let engine = Self::default();
        engine.state.lock().unwrap().failing.insert(op);
        Arc::new(engine)
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn started(&self) -> usize {
        self.state.lock().unwrap().started.len()
    }

    pub fn removals(&self, id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .removed
            .get(id)
            .copied()
            .unwrap_or_default()
    }

    pub fn total_removals(&self) -> usize {
        self.state.lock().unwrap().removed.values().sum()
    }

    pub fn uploads(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().uploads.clone()
    }

    fn check(&self, op: Op) -> Result<()> {
        if self.state.lock().unwrap().failing.contains(&op) {
            return Err(SandboxError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("injected {op:?} failure"),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create(&self, _config: &ContainerConfig) -> Result<String> {
        self.check(Op::Create)?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.containers.insert(id.clone(), FakeContainer::default());
        state.created.push(id.clone());
        Ok(id)
    }

    async fn attach(&self, id: &str) -> Result<ContainerIo> {
        self.check(Op::Attach)?;
        let (input, stdin) = tokio::io::duplex(4096);
        let (stdout, output) = tokio::io::duplex(4096);

        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or(SandboxError::ContainerClosed)?;
        container.process = Some(ProcessIo { stdin, stdout });

        Ok(ContainerIo {
            output: ReaderStream::new(output).map_err(SandboxError::from).boxed(),
            input: Box::pin(input),
        })
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.check(Op::Start)?;
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or(SandboxError::ContainerClosed)?;
        let code = container.code.clone();
        let io = container.process.take().ok_or(SandboxError::ContainerClosed)?;
        state.started.push(id.to_string());

        tokio::spawn(fake_process(code, io));
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.removed.entry(id.to_string()).or_default() += 1;
        state.containers.remove(id);
        drop(state);
        self.check(Op::Remove)
    }

    async fn upload_archive(&self, id: &str, archive: ArchiveStream) -> Result<()> {
        self.check(Op::Upload)?;
        let chunks: Vec<_> = archive.try_collect().await?;
        let tarball = chunks.concat();
        let code = read_code_entry(&tarball)?;

        let mut state = self.state.lock().unwrap();
        state.uploads.push(code.clone());
        let container = state
            .containers
            .get_mut(id)
            .ok_or(SandboxError::ContainerClosed)?;
        container.code = Some(code);
        Ok(())
    }

    async fn pull_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        Ok("fake-1.0".to_string())
    }
}

fn read_code_entry(tarball: &[u8]) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(tarball);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(CODE_ENTRY_NAME) {
            assert_eq!(entry.header().mode()?, CODE_ENTRY_MODE);
            let mut code = Vec::new();
            entry.read_to_end(&mut code)?;
            return Ok(code);
        }
    }
    Err(SandboxError::Protocol("archive has no code entry".to_string()))
}

async fn fake_process(code: Option<Vec<u8>>, io: ProcessIo) {
    let ProcessIo {
        mut stdin,
        mut stdout,
    } = io;

    if let Some(code) = code {
        let program = String::from_utf8_lossy(&code);
        if let Some(arg) = program
            .trim()
            .strip_prefix("print(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            if stdout.write_all(format!("{arg}\n").as_bytes()).await.is_err() {
                return;
            }
        }
    }

    let mut buf = [0u8; 1024];
    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if stdout.write_all(&buf[..n]).await.is_err() {
            return;
        }
        if String::from_utf8_lossy(&buf[..n]).contains("exit") {
            return;
        }
    }
}

/// Session settings small enough for tests
pub fn quick_settings() -> SessionSettings {
    SessionSettings {
        output_buffer_size: 64,
        shutdown_timeout_secs: 1,
        ping_interval_secs: 30,
        container_stop_timeout_secs: 2,
        start_timeout_secs: 5,
        session_timeout_secs: 60,
    }
}

pub fn test_state(engine: Arc<FakeEngine>, settings: SessionSettings) -> Arc<AppState> {
    let config = AppConfig {
        session: settings,
        ..AppConfig::default()
    };
    let manager = Arc::new(ContainerManager::new(
        engine,
        Duration::from_secs(config.session.container_stop_timeout_secs),
    ));
    let languages = Languages::from_json(LANGUAGES).unwrap();
    Arc::new(AppState::new(&config, languages, manager))
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub engine: Arc<FakeEngine>,
}

impl TestServer {
    pub async fn start(engine: Arc<FakeEngine>, settings: SessionSettings) -> Self {
        let state = test_state(engine.clone(), settings);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = create_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            engine,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub async fn connect(&self, path: &str) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(self.url(path)).await.unwrap();
        client
    }

    /// Wait until every session has finished tearing down
    pub async fn wait_idle(&self) {
        let idle = async {
            while self.state.active_sessions.load(Ordering::SeqCst) != 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(STEP_TIMEOUT, idle)
            .await
            .expect("sessions did not finish");
    }
}

/// Next frame the server sent, ignoring pings and pongs
pub async fn next_frame(client: &mut Client) -> Option<Message> {
    loop {
        let frame = tokio::time::timeout(STEP_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame");
        match frame {
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(message)) => return Some(message),
            Some(Err(_)) | None => return None,
        }
    }
}

/// Next status frame; panics on anything else
pub async fn next_status(client: &mut Client) -> StatusUpdate {
    match next_frame(client).await {
        Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a status frame, got {other:?}"),
    }
}

/// Collect terminal text until it contains `needle`
pub async fn read_until(client: &mut Client, needle: &str) -> String {
    let mut seen = String::new();
    while !seen.contains(needle) {
        match next_frame(client).await {
            Some(Message::Text(text)) => seen.push_str(&text),
            other => panic!("expected output containing {needle:?}, got {other:?} after {seen:?}"),
        }
    }
    seen
}

/// Read until the server's close frame; returns whether one arrived
pub async fn expect_close(client: &mut Client) -> bool {
    loop {
        match next_frame(client).await {
            Some(Message::Close(_)) => return true,
            Some(_) => continue,
            None => return false,
        }
    }
}

pub async fn send_text(client: &mut Client, text: &str) {
    client.send(Message::Text(text.to_string())).await.unwrap();
}
