//! Container sandbox module for boxterm
//!
//! Handles all interactions with the container engine:
//! - Creating, attaching, starting and removing sandbox containers
//! - Packing client code into the container before start
//! - Bridging a WebSocket client to the container's terminal

mod archive;
mod engine;
mod error;
mod manager;
mod session;

pub use archive::{write_code_tar, ArchivePacker, CodeArchive, CODE_ENTRY_MODE, CODE_ENTRY_NAME};
pub use engine::{
    sandbox_config, ArchiveStream, ContainerEngine, ContainerIo, DockerEngine, SANDBOX_MEMORY_BYTES,
    SANDBOX_NANO_CPUS,
};
pub use error::{Result, SandboxError};
pub use manager::{Container, ContainerManager, PendingContainer, PrestartAction};
pub use session::{ContainerSession, ContainerSessionConfig, SessionMode, PING_WRITE_DEADLINE};
