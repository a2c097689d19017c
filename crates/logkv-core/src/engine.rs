//! Core storage engine — the heart of LogKV.
//!
//! LogKvEngine combines an append-only log file, an in-memory Indexer and a
//! write-back cache, fed by a single ingest worker and drained by a
//! background flush loop.
//!
//! **Write path**: enqueue, then the ingest worker assigns the Identifier and
//! fills the cache. Never waits on disk.
//! **Flush**: cache snapshot, log append (outside the gate), then index update
//! and cache eviction together under the gate.
//! **Read path**: cache first (read-your-write), then primary index plus a
//! positioned file read.
//!
//! Lock order: `flush_lock` → `gate` → `log` → `cache`.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::compaction::{self, CompactionReport};
use crate::config::Config;
use crate::error::{LogKvError, LogKvResult};
use crate::flush::{self, FlushCounters, FlushHandle, FlushStats, FlushTarget};
use crate::format::{Record, RecordReader, ReplaySummary};
use crate::id::Identifier;
use crate::indexer::{IndexSnapshot, Indexer};
use crate::ingest::{self, Cache, IngestHandle, Sequence, WriteTicket};
use crate::logfile::{self, LogWriter};
use crate::skiplist::{KeyRange, SkipList};
use crate::trace::{JsonFieldExtractor, NoTrace, TraceExtractor, TraceValue};

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Replaying the log (at open) or restoring a snapshot
    Starting = 0,
    /// Ingest worker and flush loop active
    Running = 1,
    /// Queue closed, draining and flushing
    Closing = 2,
    /// Terminal
    Closed = 3,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EngineState::Starting,
            1 => EngineState::Running,
            2 => EngineState::Closing,
            _ => EngineState::Closed,
        }
    }
}

/// A record found through the trace index.
#[derive(Debug, Clone, PartialEq)]
pub struct TracedRecord {
    pub tag: TraceValue,
    pub id: Identifier,
    pub payload: Vec<u8>,
}

/// Result of `batch_get`: payloads found before the first failure, and
/// that failure if there was one.
#[derive(Debug, Clone)]
pub struct BatchGet {
    pub payloads: Vec<Vec<u8>>,
    pub error: Option<LogKvError>,
}

/// Consistent copy of the engine's durable state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotView {
    /// Both indexes, as of the copy
    pub index: IndexSnapshot,
    /// Raw log bytes `[0, len)` matching `index`
    pub log: Vec<u8>,
}

/// State shared between the engine handle and its background threads.
struct Shared {
    path: PathBuf,
    config: Config,
    /// Held for write while the primary index or log offsets change
    gate: RwLock<()>,
    /// Serializes flush cycles, compaction and restore
    flush_lock: Mutex<()>,
    log: Mutex<LogWriter>,
    cache: Arc<Cache>,
    indexer: Arc<Indexer>,
    sequence: Arc<Sequence>,
    counters: Arc<FlushCounters>,
    state: AtomicU8,
}

impl Shared {
    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Write every cached record to the log, then index and evict them.
    fn flush_cached(&self) -> LogKvResult<usize> {
        let _flush = self.flush_lock.lock();

        let batch: Vec<(Identifier, Vec<u8>)> =
            self.cache.read().iter().map(|(id, payload)| (*id, payload.clone())).collect();
        if batch.is_empty() {
            return Ok(0);
        }

        // I/O phase: readers proceed, offsets already indexed are unaffected
        let offsets = {
            let mut log = self.log.lock();
            let start = log.size();
            let offsets = log.append_batch(batch.iter().map(|(id, payload)| (id, payload.as_slice())))?;
            if self.config.sync_on_flush {
                if let Err(e) = log.sync() {
                    // Un-write the batch so the retry does not duplicate it
                    if let Err(rollback) = log.truncate_to(start) {
                        tracing::error!(error = %rollback, "failed to roll back unsynced flush batch");
                    }
                    return Err(e);
                }
            }
            offsets
        };

        // Index phase: record offsets and evict in one critical section
        let _gate = self.gate.write();
        self.indexer.set_many(batch.iter().map(|(id, _)| *id).zip(offsets));
        let mut cache = self.cache.write();
        for (id, _) in &batch {
            cache.remove(id);
        }
        Ok(batch.len())
    }
}

impl FlushTarget for Shared {
    fn pending(&self) -> usize {
        self.cache.read().len()
    }

    fn flush_cycle(&self) -> LogKvResult<usize> {
        self.flush_cached()
    }
}

/// Core storage engine: append-only log + skip-list index + write-back cache.
///
/// All public methods take `&self` for concurrent access. Writes return as
/// soon as the payload is queued; reads see the cache immediately and the
/// log once flushed.
pub struct LogKvEngine {
    shared: Arc<Shared>,
    ingest: RwLock<Option<IngestHandle>>,
    flusher: Mutex<Option<FlushHandle>>,
}

impl LogKvEngine {
    /// Open or create the log at `path`, replay it, and start the ingest
    /// worker and flush loop.
    ///
    /// Each of `config.trace_fields` becomes a trace index of that name.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> LogKvResult<Self> {
        let extractor: Arc<dyn TraceExtractor> = if config.trace_fields.is_empty() {
            Arc::new(NoTrace)
        } else {
            Arc::new(JsonFieldExtractor::new(config.trace_fields.iter().cloned()))
        };
        Self::open_with_extractor(path, config, extractor)
    }

    /// Open with a custom trace extractor.
    pub fn open_with_extractor<P: AsRef<Path>>(
        path: P,
        config: Config,
        extractor: Arc<dyn TraceExtractor>,
    ) -> LogKvResult<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let started = Instant::now();

        let mut log = LogWriter::open(&path)?;
        compaction::recover_interrupted(&mut log)?;

        let indexer = Arc::new(Indexer::new());
        let sequence = Arc::new(Sequence::new());
        let summary = replay_into(&mut log, &config, &indexer, extractor.as_ref(), &sequence)?;

        tracing::info!(
            path = %path.display(),
            records = summary.records,
            bytes = summary.end_offset,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "log replayed"
        );

        let cache = Arc::new(Cache::new(SkipList::new()));
        let shared = Arc::new(Shared {
            path,
            config,
            gate: RwLock::new(()),
            flush_lock: Mutex::new(()),
            log: Mutex::new(log),
            cache: Arc::clone(&cache),
            indexer: Arc::clone(&indexer),
            sequence: Arc::clone(&sequence),
            counters: Arc::new(FlushCounters::new()),
            state: AtomicU8::new(EngineState::Starting as u8),
        });

        let ingest = ingest::start_ingest(cache, indexer, extractor, sequence)?;
        let flusher = flush::start_flush_loop(
            Arc::clone(&shared),
            Arc::clone(&shared.counters),
            shared.config.flush_interval,
            shared.config.flush_threshold,
        )?;

        shared.state.store(EngineState::Running as u8, Ordering::Release);

        Ok(Self {
            shared,
            ingest: RwLock::new(Some(ingest)),
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Accept a payload. Returns once it is queued; the ticket resolves to
    /// its Identifier when the record becomes readable.
    pub fn set(&self, payload: &[u8]) -> LogKvResult<WriteTicket> {
        self.submit(None, payload)
    }

    /// Accept a payload under a caller-assigned Identifier.
    ///
    /// The counter is always kept. If `id` does not sort after every
    /// identifier already accepted, its timestamp is raised until it does;
    /// the ticket resolves to the identifier actually stored.
    pub fn set_with_id(&self, id: Identifier, payload: &[u8]) -> LogKvResult<WriteTicket> {
        self.submit(Some(id), payload)
    }

    /// Queue each payload in turn. Stops at the first rejected payload;
    /// payloads queued before it stay queued.
    pub fn batch_set<I, T>(&self, payloads: I) -> LogKvResult<Vec<WriteTicket>>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        payloads.into_iter().map(|p| self.set(p.as_ref())).collect()
    }

    fn submit(&self, id: Option<Identifier>, payload: &[u8]) -> LogKvResult<WriteTicket> {
        if matches!(self.state(), EngineState::Closing | EngineState::Closed) {
            return Err(LogKvError::Closed);
        }
        let max = self.shared.config.max_payload_size;
        if payload.len() as u64 > max {
            return Err(LogKvError::OversizedRecord { size: payload.len() as u64, max });
        }
        let ingest = self.ingest.read();
        ingest.as_ref().ok_or(LogKvError::Closed)?.submit(id, payload.to_vec())
    }

    /// Payload of `id`, from the cache or the log.
    pub fn get(&self, id: &Identifier) -> LogKvResult<Vec<u8>> {
        let _gate = self.shared.gate.read();
        if let Some(payload) = self.shared.cache.read().get(id) {
            return Ok(payload.clone());
        }

        let offset = self.shared.indexer.get(id).ok_or(LogKvError::NotFound)?;
        let record = logfile::read_at(&self.shared.path, offset, self.shared.config.max_payload_size)?;
        if record.id != *id {
            return Err(LogKvError::CorruptRecord {
                offset,
                reason: format!("index points at {} but record holds {}", id, record.id),
            });
        }
        Ok(record.payload)
    }

    /// `get` each id in order, stopping at the first error.
    pub fn batch_get(&self, ids: &[Identifier]) -> BatchGet {
        let mut payloads = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(id) {
                Ok(payload) => payloads.push(payload),
                Err(e) => return BatchGet { payloads, error: Some(e) },
            }
        }
        BatchGet { payloads, error: None }
    }

    /// Durable records with `start <= id <= end`, ascending, at most
    /// `config.scan_limit` of them. Unflushed writes are not visible.
    pub fn scan(&self, start: &Identifier, end: &Identifier) -> LogKvResult<Vec<Record>> {
        self.scan_with_limit(start, end, self.shared.config.scan_limit)
    }

    /// `scan` with an explicit limit.
    pub fn scan_with_limit(&self, start: &Identifier, end: &Identifier, limit: usize) -> LogKvResult<Vec<Record>> {
        let _gate = self.shared.gate.read();
        let mut records = Vec::new();
        if limit == 0 || start > end {
            return Ok(records);
        }

        let Some((_, offset)) = self.shared.indexer.get_first_at_or_after_id(start) else {
            return Ok(records);
        };

        let mut reader = logfile::reader_at(&self.shared.path, offset, self.shared.config.max_payload_size)?;
        loop {
            match reader.next_record() {
                Ok(Some(record)) => {
                    if record.id > *end {
                        break;
                    }
                    records.push(record);
                    if records.len() >= limit {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e @ (LogKvError::Truncated { .. } | LogKvError::CorruptRecord { .. })) => {
                    tracing::warn!(error = %e, returned = records.len(), "scan stopped at unreadable record");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Every live record tagged `tag` in the trace index `index`, ascending
    /// by Identifier.
    pub fn get_with_index(&self, index: &str, tag: &TraceValue) -> LogKvResult<Vec<(Identifier, Vec<u8>)>> {
        let ids = {
            let cache = self.shared.cache.read();
            self.shared.indexer.get_trace_live(index, tag, |id| cache.contains_key(id))
        };
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id) {
                Ok(payload) => found.push((id, payload)),
                // Compacted since the trace lookup
                Err(LogKvError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// Live records for every tag of `index` in `range`, ascending by tag,
    /// at most `config.scan_limit` of them.
    pub fn scan_with_index(&self, index: &str, range: &KeyRange<TraceValue>) -> LogKvResult<Vec<TracedRecord>> {
        let limit = self.shared.config.scan_limit;
        let mut found = Vec::new();
        for (tag, _) in self.shared.indexer.trace_range(index, range) {
            for (id, payload) in self.get_with_index(index, &tag)? {
                found.push(TracedRecord { tag: tag.clone(), id, payload });
                if found.len() >= limit {
                    return Ok(found);
                }
            }
        }
        Ok(found)
    }

    /// Drop every durable record whose timestamp is before `before_ts`.
    ///
    /// Stops the world: no reads, writes or flushes run until the log has
    /// been rewritten and the primary index rebuilt. Trace entries for the
    /// removed records are dropped as well.
    pub fn delete(&self, before_ts: u32) -> LogKvResult<CompactionReport> {
        if self.state() == EngineState::Closed {
            return Err(LogKvError::Closed);
        }
        let started = Instant::now();
        let _flush = self.shared.flush_lock.lock();
        let _gate = self.shared.gate.write();
        let mut log = self.shared.log.lock();

        let before_records = self.shared.indexer.len() as u64;
        let Some((last_id, offset)) = self.shared.indexer.get_last_before(before_ts) else {
            return Ok(CompactionReport {
                removed_records: 0,
                removed_bytes: 0,
                remaining_records: before_records,
                remaining_bytes: log.size(),
            });
        };

        let max_payload = self.shared.config.max_payload_size;
        let cut = logfile::read_at(log.path(), offset, max_payload)?.end_offset();
        let removed_bytes = compaction::compact_prefix(&mut log, cut)?;

        // Every surviving offset moved
        let mut entries = Vec::new();
        logfile::replay(log.path(), max_payload, |id, _, offset| {
            entries.push((id, offset));
            Ok(())
        })?;
        let remaining_records = entries.len() as u64;
        self.shared.indexer.rebuild_primary(entries);

        // Unflushed records older than the cut are still readable
        let pruned_trace_ids = {
            let cache = self.shared.cache.read();
            self.shared
                .indexer
                .prune_trace_before(&Identifier::lower_bound(before_ts), |id| cache.contains_key(id))
        };

        let report = CompactionReport {
            removed_records: before_records.saturating_sub(remaining_records),
            removed_bytes,
            remaining_records,
            remaining_bytes: log.size(),
        };
        tracing::info!(
            before_ts,
            last_removed = %last_id,
            removed_records = report.removed_records,
            removed_bytes = report.removed_bytes,
            reclaimed_ratio = report.reclaimed_ratio(),
            remaining_records = report.remaining_records,
            pruned_trace_ids,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "log prefix compacted"
        );
        Ok(report)
    }

    /// Force one flush cycle. Returns the number of records written.
    pub fn flush(&self) -> LogKvResult<usize> {
        flush::run_cycle(self.shared.as_ref(), &self.shared.counters)
    }

    /// Consistent copy of the index and the log, taken after a flush so
    /// every accepted write is included.
    pub fn snapshot_view(&self) -> LogKvResult<SnapshotView> {
        self.flush()?;
        let _flush = self.shared.flush_lock.lock();
        let _gate = self.shared.gate.read();

        let index = self.shared.indexer.snapshot();
        let len = self.shared.log.lock().size();
        let log = logfile::read_prefix(&self.shared.path, len)?;
        Ok(SnapshotView { index, log })
    }

    /// Replace all state with the snapshot in `index` + `log`.
    ///
    /// The incoming log is fully decoded, then written and synced to a
    /// `<log>.restore` sibling before anything live is touched. Renaming it
    /// over the log is the commit point, so any failure before that leaves
    /// the engine as it was. Unflushed writes are discarded.
    pub fn restore<R: Read>(&self, index: &IndexSnapshot, log: R) -> LogKvResult<u64> {
        let max_payload = self.shared.config.max_payload_size;
        let records = RecordReader::new(log, 0)
            .with_max_payload(max_payload)
            .collect::<LogKvResult<Vec<Record>>>()?;

        let _flush = self.shared.flush_lock.lock();
        if self.state() != EngineState::Running {
            return Err(LogKvError::Closed);
        }

        // Readers and writers carry on against the live log meanwhile
        let staging = logfile::replacement_path(&self.shared.path);
        let (staged, offsets) = match stage_replacement(&staging, &records) {
            Ok(staged) => staged,
            Err(e) => {
                discard_replacement(&staging);
                return Err(e);
            }
        };

        let _gate = self.shared.gate.write();
        let mut writer = self.shared.log.lock();

        if self
            .shared
            .state
            .compare_exchange(
                EngineState::Running as u8,
                EngineState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            drop(staged);
            discard_replacement(&staging);
            return Err(LogKvError::Closed);
        }

        let result = self.install_replacement(&mut writer, staged, offsets, index, &records);

        // A close that began meanwhile keeps its state
        let _ = self.shared.state.compare_exchange(
            EngineState::Starting as u8,
            EngineState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        result
    }

    fn install_replacement(
        &self,
        writer: &mut LogWriter,
        mut staged: LogWriter,
        offsets: Vec<u64>,
        index: &IndexSnapshot,
        records: &[Record],
    ) -> LogKvResult<u64> {
        if let Err(e) = staged.rename_over(&self.shared.path) {
            let leftover = staged.path().to_path_buf();
            drop(staged);
            discard_replacement(&leftover);
            return Err(e);
        }
        *writer = staged;

        self.shared.cache.write().clear();
        self.shared.indexer.clear();
        for record in records {
            self.shared.sequence.observe(&record.id);
        }
        self.shared.indexer.rebuild_primary(records.iter().map(|r| r.id).zip(offsets));
        self.shared.indexer.restore_trace(index);

        if index.primary.len() != records.len() {
            tracing::warn!(
                indexed = index.primary.len(),
                records = records.len(),
                "snapshot index disagrees with its log; primary index rebuilt from the log"
            );
        }
        Ok(records.len() as u64)
    }

    /// Stop accepting writes, drain the ingest queue, and flush everything.
    /// Idempotent.
    pub fn close(&self) -> LogKvResult<()> {
        let began = self.shared.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            match EngineState::from_u8(s) {
                EngineState::Starting | EngineState::Running => Some(EngineState::Closing as u8),
                _ => None,
            }
        });
        if began.is_err() {
            return Ok(());
        }

        if let Some(ingest) = self.ingest.write().take() {
            ingest.close();
        }
        if let Some(flusher) = self.flusher.lock().take() {
            flusher.shutdown();
        }

        let result = self.flush().and_then(|flushed| {
            self.shared.log.lock().sync()?;
            Ok(flushed)
        });
        self.shared.state.store(EngineState::Closed as u8, Ordering::Release);

        match &result {
            Ok(flushed) => tracing::info!(path = %self.shared.path.display(), flushed, "engine closed"),
            Err(e) => tracing::error!(path = %self.shared.path.display(), error = %e, "final flush failed"),
        }
        result.map(|_| ())
    }

    /// Lifecycle state.
    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Number of durable (indexed) records.
    pub fn len(&self) -> usize {
        self.shared.indexer.len()
    }

    /// Returns true if nothing is durable or cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.cached_len() == 0
    }

    /// Records accepted but not yet flushed.
    pub fn cached_len(&self) -> usize {
        self.shared.cache.read().len()
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Current log size in bytes.
    pub fn log_size(&self) -> u64 {
        self.shared.log.lock().size()
    }

    pub fn flush_stats(&self) -> FlushStats {
        self.shared.counters.stats()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

impl Drop for LogKvEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "close on drop failed");
        }
    }
}

/// Write `records` into a fresh log at `path` and sync it.
fn stage_replacement(path: &Path, records: &[Record]) -> LogKvResult<(LogWriter, Vec<u64>)> {
    let mut staged = LogWriter::open(path)?;
    staged.truncate()?;
    let offsets = staged.append_batch(records.iter().map(|r| (&r.id, r.payload.as_slice())))?;
    staged.sync()?;
    Ok((staged, offsets))
}

fn discard_replacement(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove replacement log"),
    }
}

/// Rebuild the indexes from the log, seeding `sequence` with the highest
/// identifier seen.
fn replay_into(
    log: &mut LogWriter,
    config: &Config,
    indexer: &Indexer,
    extractor: &dyn TraceExtractor,
    sequence: &Sequence,
) -> LogKvResult<ReplaySummary> {
    let mut entries = Vec::new();
    let result = logfile::replay(log.path(), config.max_payload_size, |id, payload, offset| {
        entries.push((id, offset));
        sequence.observe(&id);
        for (index, tag) in extractor.extract(payload) {
            indexer.set_trace(&index, tag, &[id]);
        }
        Ok(())
    });

    let summary = match result {
        Ok(summary) => summary,
        Err(LogKvError::Truncated { offset, expected, available }) if config.repair_torn_tail => {
            tracing::warn!(
                path = %log.path().display(),
                offset,
                expected,
                available,
                dropped_bytes = log.size().saturating_sub(offset),
                "truncating torn record at end of log"
            );
            log.truncate_to(offset)?;
            ReplaySummary { records: entries.len() as u64, end_offset: offset }
        }
        Err(e) => return Err(e),
    };

    indexer.rebuild_primary(entries);
    Ok(summary)
}
