//! Snapshot sinks
//!
//! A sink is where a snapshot's bytes go. The consensus layer owns it; the
//! snapshot writes into it and then either closes it (the snapshot becomes
//! visible) or cancels it (nothing is left behind).

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use logkv_core::platform_durability::{durable_sync, durable_sync_dir};
use logkv_core::LogKvError;

use crate::error::{FsmError, FsmResult};

/// Destination for a persisted snapshot.
pub trait SnapshotSink: Write + Send {
    /// Identifier of the snapshot being written.
    fn id(&self) -> &str;

    /// Make the written snapshot durable and visible.
    fn close(&mut self) -> FsmResult<()>;

    /// Abandon the snapshot and discard what was written.
    fn cancel(&mut self) -> FsmResult<()>;
}

/// Writes a snapshot to `<dir>/<id>.snap` through a `.tmp` sibling that is
/// synced and renamed into place on `close`.
pub struct FileSnapshotSink {
    id: String,
    path: PathBuf,
    tmp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    state: &'static str,
}

impl FileSnapshotSink {
    /// Start a snapshot named `id` in `dir`.
    pub fn create(dir: &Path, id: impl Into<String>) -> FsmResult<Self> {
        let id = id.into();
        fs::create_dir_all(dir).map_err(|e| LogKvError::io_at(dir, e, "Failed to create snapshot directory"))?;

        let path = dir.join(format!("{}.snap", id));
        let tmp_path = dir.join(format!("{}.snap.tmp", id));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| LogKvError::io_at(&tmp_path, e, "Failed to create snapshot file"))?;

        Ok(Self { id, path, tmp_path, writer: Some(BufWriter::new(file)), state: "open" })
    }

    /// Final location of the snapshot once closed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn publish(&self, writer: BufWriter<File>) -> FsmResult<()> {
        let file = writer
            .into_inner()
            .map_err(|e| LogKvError::io_at(&self.tmp_path, e.into_error(), "Failed to flush snapshot"))?;
        durable_sync(&file).map_err(|e| LogKvError::io_at(&self.tmp_path, e, "Failed to sync snapshot"))?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)
            .map_err(|e| LogKvError::io_at(&self.path, e, "Failed to publish snapshot"))?;
        if let Some(dir) = self.path.parent() {
            durable_sync_dir(dir).map_err(|e| LogKvError::io_at(dir, e, "Failed to sync snapshot directory"))?;
        }
        Ok(())
    }

    fn finished(&self) -> FsmError {
        FsmError::SinkFinished { id: self.id.clone(), state: self.state }
    }
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, self.finished())),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn close(&mut self) -> FsmResult<()> {
        let writer = self.writer.take().ok_or_else(|| self.finished())?;
        if let Err(e) = self.publish(writer) {
            self.state = "cancelled";
            let _ = fs::remove_file(&self.tmp_path);
            return Err(e);
        }

        self.state = "closed";
        tracing::debug!(id = %self.id, path = %self.path.display(), "snapshot sink closed");
        Ok(())
    }

    fn cancel(&mut self) -> FsmResult<()> {
        if self.writer.take().is_none() {
            return Ok(());
        }
        self.state = "cancelled";
        match fs::remove_file(&self.tmp_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LogKvError::io_at(&self.tmp_path, e, "Failed to discard snapshot").into()),
        }
    }
}

impl Drop for FileSnapshotSink {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(e) = self.cancel() {
                tracing::warn!(id = %self.id, error = %e, "failed to discard unfinished snapshot");
            }
        }
    }
}
