//! Session and container error types

use thiserror::Error;

/// Everything that can end a container session.
///
/// None of these are fatal to the process; every variant resolves to
/// "tear down this session".
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A container engine call failed
    #[error("{op} failed: {source}")]
    Engine {
        op: &'static str,
        #[source]
        source: bollard::errors::Error,
    },

    /// Read or write on the client WebSocket failed
    #[error("websocket error: {0}")]
    Transport(#[from] axum::Error),

    /// The client went away without a close handshake
    #[error("client disconnected")]
    ClientGone,

    /// The client sent a frame that is not allowed at this point
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No pong arrived within one ping interval
    #[error("stalled client")]
    StalledClient,

    /// A start, session or write deadline expired
    #[error("{0} timeout exceeded")]
    Timeout(&'static str),

    /// The container's output stream ended
    #[error("container stream closed")]
    StreamClosed,

    /// The container was already torn down
    #[error("container closed")]
    ContainerClosed,

    /// Packing uploaded code failed
    #[error("failed to pack code archive: {0}")]
    Archive(#[source] std::io::Error),

    #[error("container i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode status: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SandboxError {
    /// Wrap an engine error with the name of the failing operation
    pub fn engine(op: &'static str, source: bollard::errors::Error) -> Self {
        SandboxError::Engine { op, source }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Engine { .. } => "engine",
            SandboxError::Transport(_) | SandboxError::ClientGone => "transport",
            SandboxError::Protocol(_) => "protocol",
            SandboxError::StalledClient => "stalled",
            SandboxError::Timeout(_) => "timeout",
            SandboxError::StreamClosed | SandboxError::ContainerClosed => "container_exit",
            SandboxError::Archive(_) => "archive",
            SandboxError::Io(_) => "container_io",
            SandboxError::Encode(_) => "encode",
        }
    }
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
