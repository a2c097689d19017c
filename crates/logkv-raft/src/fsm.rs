//! Raft finite-state machine over a LogKV engine
//!
//! The consensus layer drives three callbacks: `apply` for every committed
//! entry (never concurrently with another `apply`), `snapshot` when it wants
//! to truncate its own log, and `restore` when a follower installs a
//! snapshot from the leader.

use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use logkv_core::id::unix_now;
use logkv_core::{Identifier, LogKvEngine};

use crate::error::FsmResult;
use crate::snapshot::{self, FsmSnapshot, LogKvSnapshot};

/// A committed entry from the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Raft log index
    pub index: u64,
    /// Opaque client payload
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: u64, data: impl Into<Vec<u8>>) -> Self {
        Self { index, data: data.into() }
    }
}

/// The record stored for an applied entry, returned to the consensus layer
/// as the apply result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRecord {
    /// Raft log index the record came from
    pub index: u64,
    /// Identifier the record is stored under
    pub id: Identifier,
    pub payload: Vec<u8>,
}

/// Callback contract between a consensus module and the state it replicates.
pub trait StateMachine: Send + Sync {
    type Snapshot: FsmSnapshot;

    /// Apply one committed entry. `None` for entries that carry no record.
    fn apply(&self, entry: &LogEntry) -> FsmResult<Option<AppliedRecord>>;

    /// Capture a point-in-time snapshot of the state.
    fn snapshot(&self) -> FsmResult<Self::Snapshot>;

    /// Replace all state with the snapshot read from `reader`.
    fn restore(&self, reader: &mut dyn Read) -> FsmResult<()>;
}

/// State machine that stores each committed entry as a LogKV record whose
/// Identifier counter is the Raft log index.
pub struct LogKvFsm {
    engine: Arc<LogKvEngine>,
}

impl LogKvFsm {
    pub fn new(engine: Arc<LogKvEngine>) -> Self {
        Self { engine }
    }

    /// The engine this state machine writes to.
    pub fn engine(&self) -> &Arc<LogKvEngine> {
        &self.engine
    }
}

impl StateMachine for LogKvFsm {
    type Snapshot = LogKvSnapshot;

    fn apply(&self, entry: &LogEntry) -> FsmResult<Option<AppliedRecord>> {
        // No-op and barrier entries
        if entry.data.is_empty() {
            return Ok(None);
        }

        let id = Identifier::from_parts(unix_now(), entry.index);
        let id = self.engine.set_with_id(id, &entry.data)?.wait()?;
        Ok(Some(AppliedRecord { index: entry.index, id, payload: entry.data.clone() }))
    }

    fn snapshot(&self) -> FsmResult<LogKvSnapshot> {
        let start = Instant::now();
        let view = self.engine.snapshot_view()?;
        let records = view.index.primary.len();
        let snapshot = LogKvSnapshot::new(view.index.to_bytes()?, view.log);

        tracing::info!(
            records,
            log_bytes = snapshot.log_len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "snapshot taken"
        );
        Ok(snapshot)
    }

    fn restore(&self, reader: &mut dyn Read) -> FsmResult<()> {
        let start = Instant::now();
        let index = snapshot::read_index(reader)?;
        let records = self.engine.restore(&index, reader)?;

        tracing::info!(
            records,
            trace_indexes = index.trace.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "snapshot restored"
        );
        Ok(())
    }
}
