//! Ingest worker — the single writer of the write-back cache
//!
//! Callers push payloads onto an unbounded channel and return immediately.
//! One background thread drains it in order: it assigns each record its
//! Identifier, inserts it into the cache, records its trace tags and
//! answers the caller's `WriteTicket`.
//!
//! Because exactly one thread assigns Identifiers, assignment needs no lock
//! and acceptance order equals Identifier order, including for
//! caller-supplied identifiers (see `Sequence::admit`).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;

use crate::error::{LogKvError, LogKvResult};
use crate::id::{unix_now, Identifier};
use crate::indexer::Indexer;
use crate::skiplist::SkipList;
use crate::trace::TraceExtractor;

/// The write-back cache: accepted records not yet flushed, in id order.
pub type Cache = RwLock<SkipList<Identifier, Vec<u8>>>;

/// Last assigned `(timestamp, counter)` pair.
///
/// Owned by the engine and seeded from replay so identifiers keep rising
/// across restarts. Only the ingest worker assigns from it; restore and
/// caller-supplied identifiers only ever push it forward.
#[derive(Debug, Default)]
pub struct Sequence {
    last_ts: AtomicU32,
    last_counter: AtomicU64,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next identifier at wall-clock second `now`. The timestamp never goes
    /// backwards even if the clock does.
    pub fn next_at(&self, now: u32) -> Identifier {
        let ts = self.last_ts.fetch_max(now, Ordering::AcqRel).max(now);
        let counter = self.last_counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        Identifier::from_parts(ts, counter)
    }

    /// Fit a caller-supplied identifier into the sequence. The counter is
    /// kept; the timestamp is raised when needed so the result sorts after
    /// every identifier handed out before it.
    pub fn admit(&self, id: Identifier) -> Identifier {
        let last_ts = self.last_ts.load(Ordering::Acquire);
        let last_counter = self.last_counter.load(Ordering::Acquire);
        let admitted = if id.timestamp() > last_ts {
            id
        } else if id.counter() > last_counter {
            Identifier::from_parts(last_ts, id.counter())
        } else if last_ts < u32::MAX {
            Identifier::from_parts(last_ts + 1, id.counter())
        } else {
            Identifier::from_parts(last_ts, last_counter.wrapping_add(1))
        };
        self.observe(&admitted);
        admitted
    }

    /// Push the sequence forward past `id`.
    pub fn observe(&self, id: &Identifier) {
        self.last_ts.fetch_max(id.timestamp(), Ordering::AcqRel);
        self.last_counter.fetch_max(id.counter(), Ordering::AcqRel);
    }

    pub fn last_counter(&self) -> u64 {
        self.last_counter.load(Ordering::Acquire)
    }
}

/// Resolves to the Identifier of an accepted write once the ingest worker
/// has placed it in the cache.
#[derive(Debug)]
pub struct WriteTicket {
    rx: Receiver<Identifier>,
}

impl WriteTicket {
    /// Block until the record is visible to `get`.
    pub fn wait(self) -> LogKvResult<Identifier> {
        self.rx.recv().map_err(|_| LogKvError::Closed)
    }
}

struct IngestRequest {
    id: Option<Identifier>,
    payload: Vec<u8>,
    respond_to: Sender<Identifier>,
}

/// Handle to the running ingest worker.
pub struct IngestHandle {
    tx: Option<Sender<IngestRequest>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl IngestHandle {
    /// Queue a payload. `id` replaces the generated identifier, subject to
    /// `Sequence::admit`.
    pub fn submit(&self, id: Option<Identifier>, payload: Vec<u8>) -> LogKvResult<WriteTicket> {
        let tx = self.tx.as_ref().ok_or(LogKvError::Closed)?;
        let (respond_to, rx) = unbounded();
        tx.send(IngestRequest { id, payload, respond_to }).map_err(|_| LogKvError::Closed)?;
        Ok(WriteTicket { rx })
    }

    /// Close the queue and wait for the worker to drain it.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Dropping the last sender ends the worker's loop once drained
        self.tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IngestHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the ingest worker.
pub fn start_ingest(
    cache: Arc<Cache>,
    indexer: Arc<Indexer>,
    extractor: Arc<dyn TraceExtractor>,
    sequence: Arc<Sequence>,
) -> LogKvResult<IngestHandle> {
    let (tx, rx) = unbounded::<IngestRequest>();

    let thread = thread::Builder::new()
        .name("logkv-ingest".to_string())
        .spawn(move || ingest_loop(rx, cache, indexer, extractor, sequence))
        .map_err(|e| LogKvError::Io {
            path: None,
            kind: e.kind(),
            message: format!("Failed to spawn ingest thread: {}", e),
        })?;

    Ok(IngestHandle { tx: Some(tx), thread: Some(thread) })
}

fn ingest_loop(
    rx: Receiver<IngestRequest>,
    cache: Arc<Cache>,
    indexer: Arc<Indexer>,
    extractor: Arc<dyn TraceExtractor>,
    sequence: Arc<Sequence>,
) {
    let mut accepted = 0u64;
    for request in rx.iter() {
        let id = match request.id {
            Some(requested) => {
                let id = sequence.admit(requested);
                if id != requested {
                    tracing::debug!(requested = %requested, assigned = %id, "raised out-of-order identifier");
                }
                id
            }
            None => sequence.next_at(unix_now()),
        };

        let tags = extractor.extract(&request.payload);
        // Cached before tagging so a concurrent trace prune sees it as pending
        cache.write().insert(id, request.payload);
        for (index, tag) in tags {
            indexer.set_trace(&index, tag, &[id]);
        }
        accepted += 1;

        // The caller may have dropped its ticket
        let _ = request.respond_to.send(id);
    }
    tracing::debug!(accepted, "ingest worker drained and stopped");
}
