//! In-memory indexes over the log
//!
//! The primary index maps every durable Identifier to the offset of its
//! record. It is never persisted: startup replay and compaction rebuild it
//! from the file. The trace index holds one map per named index, from a
//! trace tag to the identifiers written under it, and is advisory only.
//! Identifier lists stay sorted ascending and free of duplicates.
//!
//! Both sit behind their own RwLock; they are logically unrelated.

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{LogKvError, LogKvResult};
use crate::id::Identifier;
use crate::skiplist::{KeyRange, SkipList};
use crate::trace::TraceValue;

/// Point-in-time copy of both indexes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// `(id, offset)` in ascending id order
    pub primary: Vec<(Identifier, u64)>,
    /// `(index name, [(tag, ids)])`, ascending by name then tag
    pub trace: Vec<(String, Vec<(TraceValue, Vec<Identifier>)>)>,
}

impl IndexSnapshot {
    /// Compact binary encoding.
    pub fn to_bytes(&self) -> LogKvResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| LogKvError::SnapshotCorrupted(format!("encode index: {}", e)))
    }

    /// Inverse of `to_bytes`.
    pub fn from_bytes(bytes: &[u8]) -> LogKvResult<Self> {
        bincode::deserialize(bytes).map_err(|e| LogKvError::SnapshotCorrupted(format!("decode index: {}", e)))
    }
}

type TraceMap = HashMap<TraceValue, Vec<Identifier>>;

/// Insert keeping `list` sorted and unique. Ids normally arrive in
/// ascending order, which is a plain push.
fn insert_sorted(list: &mut Vec<Identifier>, id: Identifier) {
    match list.last() {
        Some(last) if *last >= id => {
            if let Err(pos) = list.binary_search(&id) {
                list.insert(pos, id);
            }
        }
        _ => list.push(id),
    }
}

/// Primary + trace index pair.
pub struct Indexer {
    primary: RwLock<SkipList<Identifier, u64>>,
    trace: RwLock<HashMap<String, TraceMap>>,
}

impl Indexer {
    pub fn new() -> Self {
        Self {
            primary: RwLock::new(SkipList::new()),
            trace: RwLock::new(HashMap::new()),
        }
    }

    /// Record the offset of a durable record.
    pub fn set(&self, id: Identifier, offset: u64) {
        self.primary.write().insert(id, offset);
    }

    /// Record a batch of offsets under one lock acquisition.
    pub fn set_many<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (Identifier, u64)>,
    {
        let mut primary = self.primary.write();
        for (id, offset) in entries {
            primary.insert(id, offset);
        }
    }

    /// Offset of `id`'s record.
    pub fn get(&self, id: &Identifier) -> Option<u64> {
        self.primary.read().get(id).copied()
    }

    /// Number of durable records indexed.
    pub fn len(&self) -> usize {
        self.primary.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.read().is_empty()
    }

    /// First record with `timestamp >= ts`.
    pub fn get_first_at_or_after(&self, ts: u32) -> Option<(Identifier, u64)> {
        self.get_first_at_or_after_id(&Identifier::lower_bound(ts))
    }

    /// First record with id `>= start`.
    pub fn get_first_at_or_after_id(&self, start: &Identifier) -> Option<(Identifier, u64)> {
        let range = KeyRange::inclusive(*start, Identifier::MAX);
        self.primary.read().first_in_range(&range).map(|(id, off)| (*id, *off))
    }

    /// Last record with `timestamp < ts`.
    pub fn get_last_before(&self, ts: u32) -> Option<(Identifier, u64)> {
        let range = KeyRange::half_open(Identifier::MIN, Identifier::lower_bound(ts));
        self.primary.read().last_in_range(&range).map(|(id, off)| (*id, *off))
    }

    /// Replace the primary index wholesale.
    pub fn rebuild_primary<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (Identifier, u64)>,
    {
        let mut fresh = SkipList::new();
        for (id, offset) in entries {
            fresh.insert(id, offset);
        }
        *self.primary.write() = fresh;
    }

    /// Add `ids` under `tag` in the trace index `index`, skipping ids
    /// already listed.
    pub fn set_trace(&self, index: &str, tag: TraceValue, ids: &[Identifier]) {
        let mut trace = self.trace.write();
        let list = trace.entry_ref(index).or_default().entry(tag).or_default();
        for id in ids {
            insert_sorted(list, *id);
        }
    }

    /// Every identifier recorded under `tag` in `index`, including ones
    /// whose records have since been compacted away.
    pub fn get_trace(&self, index: &str, tag: &TraceValue) -> Vec<Identifier> {
        self.trace
            .read()
            .get(index)
            .and_then(|tags| tags.get(tag))
            .cloned()
            .unwrap_or_default()
    }

    /// Identifiers under `tag` that are durable or for which `pending`
    /// says a record still exists elsewhere (e.g. in the write cache).
    pub fn get_trace_live<F>(&self, index: &str, tag: &TraceValue, pending: F) -> Vec<Identifier>
    where
        F: Fn(&Identifier) -> bool,
    {
        let ids = self.get_trace(index, tag);
        let primary = self.primary.read();
        ids.into_iter().filter(|id| primary.contains_key(id) || pending(id)).collect()
    }

    /// `(tag, ids)` for every tag of `index` in `range`, ascending by tag.
    pub fn trace_range(&self, index: &str, range: &KeyRange<TraceValue>) -> Vec<(TraceValue, Vec<Identifier>)> {
        if !range.is_valid() {
            return Vec::new();
        }
        let trace = self.trace.read();
        let Some(tags) = trace.get(index) else {
            return Vec::new();
        };
        let mut hits: Vec<(TraceValue, Vec<Identifier>)> = tags
            .iter()
            .filter(|(tag, _)| range.contains(tag))
            .map(|(tag, ids)| (tag.clone(), ids.clone()))
            .collect();
        hits.sort_by(|(a, _), (b, _)| a.cmp(b));
        hits
    }

    /// Number of distinct tags across all trace indexes.
    pub fn trace_len(&self) -> usize {
        self.trace.read().values().map(|tags| tags.len()).sum()
    }

    /// Forget ids older than `cutoff` unless `pending` says their record
    /// still exists. Tags and indexes left empty are dropped. Returns the
    /// number of ids removed.
    pub fn prune_trace_before<F>(&self, cutoff: &Identifier, pending: F) -> usize
    where
        F: Fn(&Identifier) -> bool,
    {
        let mut trace = self.trace.write();
        let mut removed = 0;
        for tags in trace.values_mut() {
            for ids in tags.values_mut() {
                let before = ids.len();
                ids.retain(|id| id >= cutoff || pending(id));
                removed += before - ids.len();
            }
            tags.retain(|_, ids| !ids.is_empty());
        }
        trace.retain(|_, tags| !tags.is_empty());
        removed
    }

    /// Consistent copy of both indexes. Holds both read locks for the
    /// duration of the copy.
    pub fn snapshot(&self) -> IndexSnapshot {
        let primary = self.primary.read();
        let trace = self.trace.read();

        let mut trace_entries: Vec<(String, Vec<(TraceValue, Vec<Identifier>)>)> = trace
            .iter()
            .map(|(name, tags)| {
                let mut entries: Vec<(TraceValue, Vec<Identifier>)> =
                    tags.iter().map(|(tag, ids)| (tag.clone(), ids.clone())).collect();
                entries.sort_by(|(a, _), (b, _)| a.cmp(b));
                (name.clone(), entries)
            })
            .collect();
        trace_entries.sort_by(|(a, _), (b, _)| a.cmp(b));

        IndexSnapshot {
            primary: primary.iter().map(|(id, off)| (*id, *off)).collect(),
            trace: trace_entries,
        }
    }

    /// Replace the trace index with the one in `snapshot`.
    pub fn restore_trace(&self, snapshot: &IndexSnapshot) {
        let mut trace = self.trace.write();
        trace.clear();
        for (name, entries) in &snapshot.trace {
            let tags = trace.entry_ref(name.as_str()).or_default();
            for (tag, ids) in entries {
                let mut ids = ids.clone();
                ids.sort_unstable();
                ids.dedup();
                tags.insert(tag.clone(), ids);
            }
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.primary.write().clear();
        self.trace.write().clear();
    }
}

impl Default for Indexer {
    fn default() -> Self {
        Self::new()
    }
}
