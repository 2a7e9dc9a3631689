//! Packing uploaded code into a tar stream for the engine

use std::io::{self, Write};

use bytes::Bytes;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::io::{ReaderStream, SyncIoBridge};

use super::engine::ArchiveStream;
use super::error::{Result, SandboxError};

/// Name of the single archive entry; lands at `/code` in the container
pub const CODE_ENTRY_NAME: &str = "code";

/// Uploaded code is read-only inside the sandbox
pub const CODE_ENTRY_MODE: u32 = 0o444;

const PIPE_CAPACITY: usize = 16 * 1024;

/// Archive being written on a blocking thread while it is streamed out
pub struct CodeArchive {
    pub stream: ArchiveStream,
    packer: JoinHandle<io::Result<()>>,
}

impl CodeArchive {
    /// Start packing `code` as the single entry `code`.
    ///
    /// The tar is produced incrementally through an in-memory pipe, so the
    /// archive itself is never buffered whole.
    pub fn pack(code: Bytes) -> Self {
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        let bridge = SyncIoBridge::new(writer);
        let packer = tokio::task::spawn_blocking(move || {
            let mut bridge = write_code_tar(bridge, &code)?;
            bridge.flush()?;
            bridge.shutdown()
        });

        Self {
            stream: ReaderStream::with_capacity(reader, PIPE_CAPACITY).boxed(),
            packer,
        }
    }

    /// Split into the byte stream and a handle reporting packing errors
    pub fn into_parts(self) -> (ArchiveStream, ArchivePacker) {
        (self.stream, ArchivePacker(self.packer))
    }
}

/// Completion handle of the packing thread
pub struct ArchivePacker(JoinHandle<io::Result<()>>);

impl ArchivePacker {
    /// Wait for packing to finish and surface its error, if any
    pub async fn finish(self) -> Result<()> {
        match self.0.await {
            Ok(result) => result.map_err(SandboxError::Archive),
            Err(join) => Err(SandboxError::Archive(io::Error::new(
                io::ErrorKind::Other,
                join.to_string(),
            ))),
        }
    }
}

/// Write a one-entry tar holding `code` and hand back the writer
pub fn write_code_tar<W: Write>(writer: W, code: &[u8]) -> io::Result<W> {
    let mut header = tar::Header::new_ustar();
    header.set_path(CODE_ENTRY_NAME)?;
    header.set_mode(CODE_ENTRY_MODE);
    header.set_size(code.len() as u64);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let mut builder = tar::Builder::new(writer);
    builder.append(&header, code)?;
    builder.into_inner()
}
