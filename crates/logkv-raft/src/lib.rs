//! Raft state-machine adapter for LogKV
//!
//! Lets a consensus module replicate a LogKV engine through the usual
//! Apply/Snapshot/Restore callback contract.
//!
//! # Architecture
//!
//! - `apply` stores each committed entry under an Identifier whose counter
//!   is the entry's Raft log index, and waits until it is readable
//! - `snapshot` flushes the engine and copies its index and log
//! - `persist` streams `[index length][index][crc32c][raw log]` into a sink
//! - `restore` verifies the index checksum, then replaces the engine's log
//!   and index atomically
//!
//! Leader election, replication and transport are left to the consensus
//! implementation driving the [`StateMachine`] trait.

pub mod error;
pub mod fsm;
pub mod sink;
pub mod snapshot;

pub use error::{FsmError, FsmResult};
pub use fsm::{AppliedRecord, LogEntry, LogKvFsm, StateMachine};
pub use sink::{FileSnapshotSink, SnapshotSink};
pub use snapshot::{FsmSnapshot, LogKvSnapshot};
