//! Integration tests: LogKV driven through the Raft state-machine contract.
//!
//! These tests exercise the full Apply -> Snapshot -> Persist -> Restore
//! pipeline against real engines on disk.

use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::sync::Arc;

use tempfile::TempDir;

use logkv_core::{Config, Identifier, LogKvEngine, LogKvError, TraceValue};
use logkv_raft::{
    FileSnapshotSink, FsmError, FsmSnapshot, LogEntry, LogKvFsm, SnapshotSink, StateMachine,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_fsm(dir: &TempDir, name: &str) -> LogKvFsm {
    let config = Config::default().with_trace_field("session");
    let engine = LogKvEngine::open(dir.path().join(name), config).unwrap();
    LogKvFsm::new(Arc::new(engine))
}

fn apply_all(fsm: &LogKvFsm, entries: &[(u64, &str)]) -> Vec<Identifier> {
    entries
        .iter()
        .map(|(index, data)| fsm.apply(&LogEntry::new(*index, data.as_bytes().to_vec())).unwrap().unwrap().id)
        .collect()
}

fn persist_to_file(fsm: &LogKvFsm, dir: &TempDir, id: &str) -> std::path::PathBuf {
    let mut snapshot = fsm.snapshot().unwrap();
    let mut sink = FileSnapshotSink::create(&dir.path().join("snapshots"), id).unwrap();
    snapshot.persist(&mut sink).unwrap();
    snapshot.release();
    sink.path().to_path_buf()
}

const ENTRIES: &[(u64, &str)] = &[
    (1, r#"{"session":"alpha","op":"login"}"#),
    (2, r#"{"session":"beta","op":"login"}"#),
    (3, r#"{"session":"alpha","op":"read"}"#),
    (4, "plain bytes without a session"),
    (5, r#"{"session":"alpha","op":"logout"}"#),
];

// ---------------------------------------------------------------------------
// Snapshot / Restore
// ---------------------------------------------------------------------------

#[test]
fn test_snapshot_restore_into_fresh_engine() {
    let dir = TempDir::new().unwrap();
    let leader = open_fsm(&dir, "leader.log");
    let ids = apply_all(&leader, ENTRIES);

    let path = persist_to_file(&leader, &dir, "1-5");

    let follower = open_fsm(&dir, "follower.log");
    let mut reader = BufReader::new(File::open(&path).unwrap());
    follower.restore(&mut reader).unwrap();

    for id in &ids {
        assert_eq!(follower.engine().get(id).unwrap(), leader.engine().get(id).unwrap());
    }
    assert_eq!(follower.engine().len(), ENTRIES.len());
    assert_eq!(follower.engine().log_size(), leader.engine().log_size());
}

#[test]
fn test_snapshot_restore_into_same_engine() {
    let dir = TempDir::new().unwrap();
    let fsm = open_fsm(&dir, "node.log");
    let ids = apply_all(&fsm, ENTRIES);

    let path = persist_to_file(&fsm, &dir, "1-5");

    // Entries applied after the snapshot are discarded by the restore
    let late = apply_all(&fsm, &[(6, "applied after snapshot")]);

    let mut reader = File::open(&path).unwrap();
    fsm.restore(&mut reader).unwrap();

    for (id, (_, data)) in ids.iter().zip(ENTRIES) {
        assert_eq!(fsm.engine().get(id).unwrap(), data.as_bytes());
    }
    assert!(matches!(fsm.engine().get(&late[0]), Err(LogKvError::NotFound)));
}

#[test]
fn test_restore_carries_trace_index() {
    let dir = TempDir::new().unwrap();
    let leader = open_fsm(&dir, "leader.log");
    apply_all(&leader, ENTRIES);
    let path = persist_to_file(&leader, &dir, "trace");

    let follower = open_fsm(&dir, "follower.log");
    follower.restore(&mut File::open(&path).unwrap()).unwrap();

    let alpha = follower.engine().get_with_index("session", &TraceValue::Str("alpha".into())).unwrap();
    let payloads: Vec<&[u8]> = alpha.iter().map(|(_, p)| p.as_slice()).collect();
    assert_eq!(payloads, vec![ENTRIES[0].1.as_bytes(), ENTRIES[2].1.as_bytes(), ENTRIES[4].1.as_bytes()]);
}

#[test]
fn test_restore_carries_every_named_index() {
    let dir = TempDir::new().unwrap();
    let config = Config::default().with_trace_field("session").with_trace_field("op");
    let leader = LogKvFsm::new(Arc::new(LogKvEngine::open(dir.path().join("leader.log"), config.clone()).unwrap()));
    apply_all(&leader, ENTRIES);
    let path = persist_to_file(&leader, &dir, "named");

    let follower = LogKvFsm::new(Arc::new(LogKvEngine::open(dir.path().join("follower.log"), config).unwrap()));
    follower.restore(&mut File::open(&path).unwrap()).unwrap();

    let logins = follower.engine().get_with_index("op", &TraceValue::from("login")).unwrap();
    assert_eq!(logins.len(), 2);
    let beta = follower.engine().get_with_index("session", &TraceValue::from("beta")).unwrap();
    assert_eq!(beta, vec![(logins[1].0, ENTRIES[1].1.as_bytes().to_vec())]);
}

#[test]
fn test_restored_engine_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let leader = open_fsm(&dir, "leader.log");
    let ids = apply_all(&leader, ENTRIES);
    let path = persist_to_file(&leader, &dir, "reopen");

    let follower_log = dir.path().join("follower.log");
    {
        let follower = open_fsm(&dir, "follower.log");
        follower.restore(&mut File::open(&path).unwrap()).unwrap();
        follower.engine().close().unwrap();
    }

    let reopened = LogKvEngine::open(&follower_log, Config::default()).unwrap();
    for (id, (_, data)) in ids.iter().zip(ENTRIES) {
        assert_eq!(reopened.get(id).unwrap(), data.as_bytes());
    }

    // Sequence resumes past the restored log indexes
    let next = reopened.set(b"next").unwrap().wait().unwrap();
    assert!(next.counter() > 5);
}

// ---------------------------------------------------------------------------
// Corruption
// ---------------------------------------------------------------------------

#[test]
fn test_corrupted_checksum_rejected() {
    let dir = TempDir::new().unwrap();
    let leader = open_fsm(&dir, "leader.log");
    apply_all(&leader, ENTRIES);
    let path = persist_to_file(&leader, &dir, "corrupt");

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[10] ^= 0x5A;

    let follower = open_fsm(&dir, "follower.log");
    let existing = apply_all(&follower, &[(1, "follower state")]);
    follower.engine().flush().unwrap();

    let err = follower.restore(&mut Cursor::new(bytes)).unwrap_err();
    assert!(matches!(err, FsmError::Engine(LogKvError::SnapshotCorrupted(_))), "{err}");
    assert_eq!(follower.engine().get(&existing[0]).unwrap(), b"follower state");
}

#[test]
fn test_truncated_log_section_rejected() {
    let dir = TempDir::new().unwrap();
    let leader = open_fsm(&dir, "leader.log");
    apply_all(&leader, ENTRIES);
    let path = persist_to_file(&leader, &dir, "short");

    let mut bytes = Vec::new();
    File::open(&path).unwrap().read_to_end(&mut bytes).unwrap();
    bytes.truncate(bytes.len() - 3);

    let follower = open_fsm(&dir, "follower.log");
    let err = follower.restore(&mut Cursor::new(bytes)).unwrap_err();
    assert!(matches!(err, FsmError::Engine(LogKvError::Truncated { .. })), "{err}");
    assert!(follower.engine().is_empty());
}

// ---------------------------------------------------------------------------
// Apply / Sink lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_empty_entries_are_skipped() {
    let dir = TempDir::new().unwrap();
    let fsm = open_fsm(&dir, "node.log");

    assert!(fsm.apply(&LogEntry::new(1, Vec::new())).unwrap().is_none());
    let applied = fsm.apply(&LogEntry::new(2, b"real".to_vec())).unwrap().unwrap();
    fsm.engine().flush().unwrap();

    assert_eq!(fsm.engine().len(), 1);
    assert_eq!(applied.id.counter(), 2);
}

#[test]
fn test_cancelled_sink_leaves_nothing() {
    let dir = TempDir::new().unwrap();
    let snap_dir = dir.path().join("snapshots");

    let mut sink = FileSnapshotSink::create(&snap_dir, "cancelled").unwrap();
    std::io::Write::write_all(&mut sink, b"partial snapshot").unwrap();
    sink.cancel().unwrap();

    assert_eq!(std::fs::read_dir(&snap_dir).unwrap().count(), 0);
}
