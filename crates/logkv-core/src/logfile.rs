//! Log file storage layer
//!
//! The log is one append-only file of back-to-back records (see `format`).
//! A single `LogWriter` owns the append handle; readers open the file by
//! path and seek to an indexed offset, so point reads never contend with
//! the writer's handle.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{LogKvError, LogKvResult};
use crate::format::{self, Record, RecordReader, ReplaySummary};
use crate::id::Identifier;
use crate::platform_durability::{durable_sync, durable_sync_dir};

/// Appends records to the log file.
pub struct LogWriter {
    file: File,
    path: PathBuf,
    size: u64,
}

impl LogWriter {
    /// Open (creating if needed) the log file at `path`.
    pub fn open(path: &Path) -> LogKvResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| LogKvError::io_at(parent, e, "Failed to create log directory"))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| LogKvError::io_at(path, e, "Failed to open log file"))?;

        let size = file
            .metadata()
            .map_err(|e| LogKvError::io_at(path, e, "Failed to stat log file"))?
            .len();

        Ok(Self { file, path: path.to_path_buf(), size })
    }

    /// Append records back to back with one write. Returns each record's
    /// offset, in input order.
    ///
    /// A failed write is rolled back to the previous end of file so no torn
    /// record is left behind for the next append to land after.
    pub fn append_batch<'a, I>(&mut self, records: I) -> LogKvResult<Vec<u64>>
    where
        I: IntoIterator<Item = (&'a Identifier, &'a [u8])>,
    {
        let mut buffer = Vec::new();
        let mut offsets = Vec::new();
        for (id, payload) in records {
            offsets.push(self.size + buffer.len() as u64);
            format::encode_into(&mut buffer, id, payload);
        }
        if buffer.is_empty() {
            return Ok(offsets);
        }

        if let Err(e) = self.file.write_all(&buffer) {
            let err = LogKvError::io_at(&self.path, e, "Log append failed");
            if let Err(rollback) = self.file.set_len(self.size) {
                tracing::error!(
                    path = %self.path.display(),
                    size = self.size,
                    error = %rollback,
                    "failed to roll back partial append"
                );
            }
            return Err(err);
        }

        self.size += buffer.len() as u64;
        Ok(offsets)
    }

    /// Copy everything `reader` yields onto the end of the log.
    pub fn append_raw<R: Read>(&mut self, reader: &mut R) -> LogKvResult<u64> {
        let copied = std::io::copy(reader, &mut self.file)
            .map_err(|e| LogKvError::io_at(&self.path, e, "Log raw append failed"))?;
        self.size += copied;
        Ok(copied)
    }

    /// Durably sync the log to persistent storage.
    pub fn sync(&self) -> LogKvResult<()> {
        durable_sync(&self.file).map_err(|e| LogKvError::io_at(&self.path, e, "Log durable_sync failed"))
    }

    /// Cut the log back to `len` bytes and sync.
    pub fn truncate_to(&mut self, len: u64) -> LogKvResult<()> {
        self.file
            .set_len(len)
            .map_err(|e| LogKvError::io_at(&self.path, e, "Log truncate failed"))?;
        self.size = len;
        self.sync()
    }

    /// Empty the log.
    pub fn truncate(&mut self) -> LogKvResult<()> {
        self.truncate_to(0)
    }

    /// Move this log over `target`, replacing whatever file is there, and
    /// keep appending under the new name. The rename is the commit point; a
    /// failed directory sync afterwards is logged, not returned.
    pub fn rename_over(&mut self, target: &Path) -> LogKvResult<()> {
        fs::rename(&self.path, target).map_err(|e| LogKvError::io_at(target, e, "Failed to replace log file"))?;
        self.path = target.to_path_buf();
        if let Err(e) = sync_parent_dir(target) {
            tracing::error!(path = %target.display(), error = %e, "log replaced but directory sync failed");
        }
        Ok(())
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `<log>.<suffix>`, next to the log so renames stay on one filesystem.
pub(crate) fn sibling_path(log_path: &Path, suffix: &str) -> PathBuf {
    let mut name = log_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    log_path.with_file_name(name)
}

/// `<log>.restore`, where a snapshot restore builds the replacement log.
pub fn replacement_path(log_path: &Path) -> PathBuf {
    sibling_path(log_path, "restore")
}

/// Read a single record at `offset`.
pub fn read_at(path: &Path, offset: u64, max_payload: u64) -> LogKvResult<Record> {
    let mut reader = reader_at(path, offset, max_payload)?;
    match reader.next_record()? {
        Some(record) => Ok(record),
        None => Err(LogKvError::Truncated { offset, expected: format::HEADER_SIZE as u64, available: 0 }),
    }
}

/// Sequential record reader starting at `offset`.
pub fn reader_at(path: &Path, offset: u64, max_payload: u64) -> LogKvResult<RecordReader<BufReader<File>>> {
    let mut file = File::open(path).map_err(|e| LogKvError::io_at(path, e, "Failed to open log file"))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| LogKvError::io_at(path, e, "Failed to seek log file"))?;
    Ok(RecordReader::new(BufReader::new(file), offset).with_max_payload(max_payload))
}

/// Read the raw bytes `[0, len)` of the log.
pub fn read_prefix(path: &Path, len: u64) -> LogKvResult<Vec<u8>> {
    let file = File::open(path).map_err(|e| LogKvError::io_at(path, e, "Failed to open log file"))?;
    let mut bytes = Vec::with_capacity(len as usize);
    file.take(len)
        .read_to_end(&mut bytes)
        .map_err(|e| LogKvError::io_at(path, e, "Failed to read log file"))?;
    if (bytes.len() as u64) < len {
        return Err(LogKvError::Truncated { offset: bytes.len() as u64, expected: len, available: bytes.len() as u64 });
    }
    Ok(bytes)
}

/// Replay the whole log from offset 0, calling `visit(id, payload, offset)`
/// for every record in file order.
pub fn replay<F>(path: &Path, max_payload: u64, visit: F) -> LogKvResult<ReplaySummary>
where
    F: FnMut(Identifier, &[u8], u64) -> LogKvResult<()>,
{
    let file = File::open(path).map_err(|e| LogKvError::io_at(path, e, "Failed to open log file for replay"))?;
    format::decode_all(BufReader::new(file), 0, max_payload, visit)
}

/// Sync the directory holding `path` so renames and truncations inside it
/// are persisted.
pub fn sync_parent_dir(path: &Path) -> LogKvResult<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            durable_sync_dir(parent).map_err(|e| LogKvError::io_at(parent, e, "Failed to sync directory"))
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{encoded_len, MAX_PAYLOAD_SIZE};
    use tempfile::TempDir;

    fn id(ts: u32, counter: u64) -> Identifier {
        Identifier::from_parts(ts, counter)
    }

    fn append_one(writer: &mut LogWriter, id: &Identifier, payload: &[u8]) -> u64 {
        writer.append_batch(std::iter::once((id, payload))).unwrap()[0]
    }

    #[test]
    fn test_append_read_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.log");
        let mut writer = LogWriter::open(&path).unwrap();

        let first = append_one(&mut writer, &id(1, 1), b"hello");
        let second = append_one(&mut writer, &id(1, 2), b"world!");
        writer.sync().unwrap();

        assert_eq!(first, 0);
        assert_eq!(second, encoded_len(5));
        assert_eq!(writer.size(), encoded_len(5) + encoded_len(6));

        let record = read_at(&path, second, MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(record.id, id(1, 2));
        assert_eq!(record.payload, b"world!");
    }

    #[test]
    fn test_batch_offsets() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.log");
        let mut writer = LogWriter::open(&path).unwrap();

        let ids = [id(5, 1), id(5, 2), id(6, 3)];
        let payloads: [&[u8]; 3] = [b"a", b"", b"ccc"];
        let offsets = writer.append_batch(ids.iter().zip(payloads.iter().copied())).unwrap();
        assert_eq!(offsets, vec![0, encoded_len(1), encoded_len(1) + encoded_len(0)]);

        for (i, offset) in offsets.iter().enumerate() {
            let record = read_at(&path, *offset, MAX_PAYLOAD_SIZE).unwrap();
            assert_eq!(record.id, ids[i]);
            assert_eq!(record.payload, payloads[i]);
        }

        assert!(writer.append_batch(std::iter::empty()).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("data.log");
        {
            let mut writer = LogWriter::open(&path).unwrap();
            append_one(&mut writer, &id(1, 1), b"persist");
            writer.sync().unwrap();
        }
        let mut writer = LogWriter::open(&path).unwrap();
        assert_eq!(writer.size(), encoded_len(7));
        let offset = append_one(&mut writer, &id(1, 2), b"next");
        assert_eq!(offset, encoded_len(7));
    }

    #[test]
    fn test_replay_visits_in_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.log");
        let mut writer = LogWriter::open(&path).unwrap();
        for n in 1..=4u64 {
            append_one(&mut writer, &id(10, n), format!("p{}", n).as_bytes());
        }

        let mut seen = Vec::new();
        let summary = replay(&path, MAX_PAYLOAD_SIZE, |id, payload, offset| {
            seen.push((id.counter(), payload.to_vec(), offset));
            Ok(())
        })
        .unwrap();

        assert_eq!(summary.records, 4);
        assert_eq!(summary.end_offset, writer.size());
        assert_eq!(seen.iter().map(|s| s.0).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(seen[3].2, 3 * encoded_len(2));
    }

    #[test]
    fn test_replay_reports_torn_tail() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.log");
        let mut writer = LogWriter::open(&path).unwrap();
        append_one(&mut writer, &id(1, 1), b"complete");
        let full = fs::read(&path).unwrap();

        let mut torn = full.clone();
        torn.extend_from_slice(&format::encode(&id(1, 2), b"partial")[..12]);
        fs::write(&path, &torn).unwrap();

        let mut visited = 0;
        let result = replay(&path, MAX_PAYLOAD_SIZE, |_, _, _| {
            visited += 1;
            Ok(())
        });
        assert_eq!(visited, 1);
        assert!(matches!(result, Err(LogKvError::Truncated { offset, .. }) if offset == full.len() as u64));
    }

    #[test]
    fn test_truncate_and_raw_append() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.log");
        let mut writer = LogWriter::open(&path).unwrap();
        append_one(&mut writer, &id(1, 1), b"old");

        let replacement = format::encode(&id(2, 1), b"new");
        writer.truncate().unwrap();
        assert_eq!(writer.size(), 0);
        writer.append_raw(&mut &replacement[..]).unwrap();
        assert_eq!(writer.size(), replacement.len() as u64);

        let record = read_at(&path, 0, MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(record.id, id(2, 1));
        assert_eq!(read_prefix(&path, writer.size()).unwrap(), replacement);
    }

    #[test]
    fn test_read_past_end() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.log");
        let mut writer = LogWriter::open(&path).unwrap();
        append_one(&mut writer, &id(1, 1), b"x");

        assert!(matches!(read_at(&path, writer.size(), MAX_PAYLOAD_SIZE), Err(LogKvError::Truncated { .. })));
        assert!(read_prefix(&path, writer.size() + 1).is_err());
    }

    #[test]
    fn test_rename_over_replaces_target() {
        let tmp = TempDir::new().unwrap();
        let live = tmp.path().join("data.log");
        let staged_path = replacement_path(&live);
        assert_eq!(staged_path, tmp.path().join("data.log.restore"));

        let mut old = LogWriter::open(&live).unwrap();
        append_one(&mut old, &id(1, 1), b"old");

        let mut staged = LogWriter::open(&staged_path).unwrap();
        append_one(&mut staged, &id(2, 1), b"new");
        staged.rename_over(&live).unwrap();

        assert_eq!(staged.path(), live.as_path());
        assert!(!staged_path.exists());
        let offset = append_one(&mut staged, &id(2, 2), b"after");
        assert_eq!(read_at(&live, 0, MAX_PAYLOAD_SIZE).unwrap().payload, b"new");
        assert_eq!(read_at(&live, offset, MAX_PAYLOAD_SIZE).unwrap().payload, b"after");
    }

    #[test]
    fn test_open_missing_dir_error_carries_path() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let path = blocker.join("data.log");

        match LogWriter::open(&path) {
            Err(LogKvError::Io { path: Some(p), .. }) => assert!(p.starts_with(&blocker)),
            other => panic!("expected Io error, got {:?}", other.map(|w| w.size())),
        }
    }
}
