//! Snapshot handles and the snapshot stream format
//!
//! Stream layout:
//!
//! ```text
//! [8B BE index length][index bytes][4B BE crc32c(index bytes)][raw log bytes]
//! ```
//!
//! The index bytes are an encoded `IndexSnapshot`. The raw log is the
//! engine's log file verbatim and runs to the end of the stream.

use std::io::{Read, Write};

use logkv_core::{IndexSnapshot, LogKvError};

use crate::error::{FsmError, FsmResult};
use crate::sink::SnapshotSink;

/// Upper bound on the encoded index section. A length header beyond this
/// is treated as corruption rather than an allocation request.
pub const MAX_INDEX_BYTES: u64 = 1 << 32;

/// A point-in-time snapshot handed to the consensus layer.
pub trait FsmSnapshot: Send {
    /// Write the snapshot into `sink`, closing it on success and
    /// cancelling it on failure.
    fn persist(&self, sink: &mut dyn SnapshotSink) -> FsmResult<()>;

    /// Called once the consensus layer is done with the snapshot.
    fn release(&mut self);
}

/// Snapshot of a LogKV engine: encoded index plus a copy of the log.
#[derive(Debug, Clone)]
pub struct LogKvSnapshot {
    index_bytes: Vec<u8>,
    log: Vec<u8>,
}

impl LogKvSnapshot {
    /// Wrap an already-encoded index and a log copy.
    pub fn new(index_bytes: Vec<u8>, log: Vec<u8>) -> Self {
        Self { index_bytes, log }
    }

    /// Size of the stream `persist` will write.
    pub fn stream_len(&self) -> u64 {
        (8 + self.index_bytes.len() + 4 + self.log.len()) as u64
    }

    /// Size of the log section.
    pub fn log_len(&self) -> u64 {
        self.log.len() as u64
    }
}

impl FsmSnapshot for LogKvSnapshot {
    fn persist(&self, sink: &mut dyn SnapshotSink) -> FsmResult<()> {
        let written = write_stream(&mut *sink, &self.index_bytes, &self.log);
        let written = written.and_then(|()| sink.flush().map_err(FsmError::from));
        match written {
            Ok(()) => {
                sink.close()?;
                tracing::info!(
                    id = %sink.id(),
                    bytes = self.stream_len(),
                    log_bytes = self.log.len(),
                    "snapshot persisted"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(id = %sink.id(), error = %e, "snapshot persist failed, cancelling sink");
                if let Err(cancel_err) = sink.cancel() {
                    tracing::warn!(id = %sink.id(), error = %cancel_err, "failed to cancel snapshot sink");
                }
                Err(e)
            }
        }
    }

    fn release(&mut self) {}
}

/// Write the stream header, index section and log section.
pub fn write_stream<W: Write + ?Sized>(out: &mut W, index_bytes: &[u8], log: &[u8]) -> FsmResult<()> {
    out.write_all(&(index_bytes.len() as u64).to_be_bytes())?;
    out.write_all(index_bytes)?;
    out.write_all(&crc32c::crc32c(index_bytes).to_be_bytes())?;
    out.write_all(log)?;
    Ok(())
}

/// Read and verify the index section, leaving `input` positioned at the
/// start of the raw log bytes.
pub fn read_index<R: Read + ?Sized>(input: &mut R) -> FsmResult<IndexSnapshot> {
    let mut len_buf = [0u8; 8];
    read_section(input, &mut len_buf, "index length")?;
    let len = u64::from_be_bytes(len_buf);
    if len > MAX_INDEX_BYTES {
        return Err(LogKvError::SnapshotCorrupted(format!("index section of {} bytes exceeds limit", len)).into());
    }

    // Grow with what the stream actually holds; `len` is unverified
    let mut index_bytes = Vec::new();
    (&mut *input).take(len).read_to_end(&mut index_bytes)?;
    if (index_bytes.len() as u64) < len {
        return Err(LogKvError::SnapshotCorrupted("stream ended inside index".into()).into());
    }

    let mut crc_buf = [0u8; 4];
    read_section(input, &mut crc_buf, "index checksum")?;
    let expected = u32::from_be_bytes(crc_buf);
    let actual = crc32c::crc32c(&index_bytes);
    if expected != actual {
        return Err(LogKvError::SnapshotCorrupted(format!(
            "index checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        ))
        .into());
    }

    Ok(IndexSnapshot::from_bytes(&index_bytes)?)
}

fn read_section<R: Read + ?Sized>(input: &mut R, buf: &mut [u8], what: &str) -> FsmResult<()> {
    match input.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(LogKvError::SnapshotCorrupted(format!("stream ended inside {}", what)).into())
        }
        Err(e) => Err(e.into()),
    }
}
