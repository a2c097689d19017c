//! Compaction — dropping the log's prefix
//!
//! Deleting old records means cutting every byte before some record
//! boundary `X`. The surviving suffix is staged in a `.bak` sibling so a
//! crash at any point leaves a recoverable state:
//!
//! 1. Copy `[X, EOF)` to `<log>.bak.partial`, durable_sync it
//! 2. Rename it to `<log>.bak` and sync the directory (the commit point)
//! 3. Truncate the log to zero, copy the backup back in, durable_sync
//! 4. Remove the backup and sync the directory
//!
//! If the process crashes:
//! - Before step 2: the log is intact, the partial file is orphaned and removed at open
//! - After step 2: `recover_interrupted` finishes steps 3 and 4 at open
//!
//! `recover_interrupted` also discards a replacement log left behind by a
//! snapshot restore that never reached its rename.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{LogKvError, LogKvResult};
use crate::logfile::{replacement_path, sibling_path, sync_parent_dir, LogWriter};
use crate::platform_durability::durable_sync;

/// Outcome of a prefix compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Durable records dropped
    pub removed_records: u64,
    /// Bytes dropped from the front of the log
    pub removed_bytes: u64,
    /// Durable records left in the log
    pub remaining_records: u64,
    /// Log size after compaction
    pub remaining_bytes: u64,
}

impl CompactionReport {
    /// Fraction of the original log that was reclaimed (0.0 when nothing was).
    pub fn reclaimed_ratio(&self) -> f64 {
        let original = self.removed_bytes + self.remaining_bytes;
        if original == 0 {
            return 0.0;
        }
        self.removed_bytes as f64 / original as f64
    }
}

/// `<log>.bak`
pub fn backup_path(log_path: &Path) -> PathBuf {
    sibling_path(log_path, "bak")
}

fn staging_path(log_path: &Path) -> PathBuf {
    sibling_path(log_path, "bak.partial")
}

/// Drop every byte of the log before `cut`. Returns the bytes removed.
///
/// `cut` must be a record boundary. The caller holds whatever locks keep
/// readers and other writers off the log for the duration.
pub fn compact_prefix(log: &mut LogWriter, cut: u64) -> LogKvResult<u64> {
    let log_path = log.path().to_path_buf();
    let original = log.size();
    if cut == 0 {
        return Ok(0);
    }
    if cut > original {
        return Err(LogKvError::CorruptRecord {
            offset: cut,
            reason: format!("compaction cut {} beyond end of log {}", cut, original),
        });
    }

    let staging = staging_path(&log_path);
    let backup = backup_path(&log_path);

    // Step 1: stage the surviving suffix
    {
        let mut source = File::open(&log_path)
            .map_err(|e| LogKvError::io_at(&log_path, e, "Failed to open log for compaction"))?;
        source
            .seek(SeekFrom::Start(cut))
            .map_err(|e| LogKvError::io_at(&log_path, e, "Failed to seek log for compaction"))?;

        let mut staged = create_truncated(&staging)?;
        std::io::copy(&mut source, &mut staged)
            .map_err(|e| LogKvError::io_at(&staging, e, "Failed to write compaction backup"))?;
        durable_sync(&staged).map_err(|e| LogKvError::io_at(&staging, e, "Failed to sync compaction backup"))?;
    }

    // Step 2: commit the backup
    fs::rename(&staging, &backup)
        .map_err(|e| LogKvError::io_at(&backup, e, "Failed to rename compaction backup"))?;
    sync_parent_dir(&log_path)?;

    // Steps 3 and 4
    restore_from_backup(log, &backup)?;

    Ok(original - log.size())
}

/// Finish a compaction that crashed after its backup was committed.
/// Returns true if there was one to finish.
pub fn recover_interrupted(log: &mut LogWriter) -> LogKvResult<bool> {
    let log_path = log.path().to_path_buf();

    let staging = staging_path(&log_path);
    if staging.exists() {
        fs::remove_file(&staging)
            .map_err(|e| LogKvError::io_at(&staging, e, "Failed to remove stale compaction staging file"))?;
    }

    let replacement = replacement_path(&log_path);
    if replacement.is_file() {
        tracing::warn!(path = %replacement.display(), "discarding replacement log from interrupted restore");
        fs::remove_file(&replacement)
            .map_err(|e| LogKvError::io_at(&replacement, e, "Failed to remove stale restore file"))?;
    }

    let backup = backup_path(&log_path);
    if !backup.exists() {
        return Ok(false);
    }

    tracing::warn!(
        path = %log_path.display(),
        backup = %backup.display(),
        "finishing interrupted compaction from backup"
    );
    restore_from_backup(log, &backup)?;
    Ok(true)
}

fn restore_from_backup(log: &mut LogWriter, backup: &Path) -> LogKvResult<()> {
    let mut source =
        File::open(backup).map_err(|e| LogKvError::io_at(backup, e, "Failed to open compaction backup"))?;

    log.truncate()?;
    log.append_raw(&mut source)?;
    log.sync()?;

    fs::remove_file(backup).map_err(|e| LogKvError::io_at(backup, e, "Failed to remove compaction backup"))?;
    sync_parent_dir(log.path())
}

fn create_truncated(path: &Path) -> LogKvResult<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| LogKvError::io_at(path, e, "Failed to create compaction backup"))
}
