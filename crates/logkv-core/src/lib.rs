//! LogKV Core — append-only log storage engine
//!
//! Records are appended to a single log file, located through an in-memory
//! skip-list index, and recovered after a crash by replaying the file.
//!
//! # Architecture
//!
//! - **Write path**: queue to a single ingest worker, which assigns a
//!   time-ordered `Identifier` and places the record in a write-back cache
//! - **Flush loop**: background drain of the cache into the log and the index
//! - **Read path**: cache first, then index offset plus positioned file read
//! - **Compaction**: drop every record before a timestamp, rebuild the index
//!
//! Replication adapters live in separate crates (e.g. logkv-raft).

pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod flush;
pub mod format;
pub mod id;
pub mod indexer;
pub mod ingest;
pub mod logfile;
pub mod platform_durability;
pub mod skiplist;
pub mod trace;

// Re-export key types for convenience
pub use compaction::CompactionReport;
pub use config::Config;
pub use engine::{BatchGet, EngineState, LogKvEngine, SnapshotView, TracedRecord};
pub use error::{LogKvError, LogKvResult};
pub use flush::FlushStats;
pub use format::Record;
pub use id::Identifier;
pub use indexer::{IndexSnapshot, Indexer};
pub use ingest::WriteTicket;
pub use skiplist::{KeyRange, SkipList};
pub use trace::{JsonFieldExtractor, NoTrace, TraceExtractor, TraceValue};
