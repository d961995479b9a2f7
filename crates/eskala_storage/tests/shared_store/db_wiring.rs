#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use eskala_kernel_contracts::actor::{ActorContext, UserId};
use eskala_kernel_contracts::versioned::{
    ConfigKey, ConfigValue, EntryInitInput, EntryVersion, SubjectTable, SupersedeInput,
};
use eskala_kernel_contracts::Timestamp;
use eskala_storage::shared::SharedConfigStore;
use eskala_storage::store::StorageError;

fn t(secs: i64) -> Timestamp {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn table() -> SubjectTable {
    SubjectTable::new("fx_rates").unwrap()
}

fn key() -> ConfigKey {
    ConfigKey::new("fx_HNL_USD").unwrap()
}

fn init_input() -> EntryInitInput {
    EntryInitInput::v1(
        table(),
        key(),
        ConfigValue::new("25.00").unwrap(),
        Some("HNL to USD".to_string()),
        t(100),
    )
    .unwrap()
}

fn bump(value: String, at: i64, user: u64, expected: Option<u32>) -> SupersedeInput {
    SupersedeInput::v1(
        table(),
        key(),
        ConfigValue::new(value).unwrap(),
        t(at),
        "concurrent update".to_string(),
        ActorContext::v1(Some(UserId(user)), None).unwrap(),
        expected.map(EntryVersion),
    )
    .unwrap()
}

fn temp_journal(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir()
        .join(format!("eskala_storage_{tag}_{}_{nanos}", std::process::id()))
        .join("journal.jsonl")
}

fn cleanup(path: &PathBuf) {
    if let Some(dir) = path.parent() {
        let _ = fs::remove_dir_all(dir);
    }
}

#[test]
fn at_shared_db_01_concurrent_writers_serialize_into_contiguous_versions() {
    let shared = SharedConfigStore::in_memory();
    shared.initialize(init_input()).unwrap();

    let handles: Vec<_> = (1..=8u64)
        .map(|n| {
            let s = shared.clone();
            thread::spawn(move || s.supersede(bump(format!("25.{n:02}"), 200, n, None), t(200)))
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }

    shared
        .read(|s| {
            let history = s.entry_history(&table(), &key());
            assert_eq!(history.len(), 9);
            assert_eq!(history[0].version, EntryVersion(9));
            assert_eq!(history.iter().filter(|e| e.is_open()).count(), 1);
            assert_eq!(s.audit_records().len(), 8);
            s.verify_all().unwrap();
        })
        .unwrap();
}

#[test]
fn at_shared_db_02_expected_version_lets_exactly_one_writer_win() {
    let shared = SharedConfigStore::in_memory();
    shared.initialize(init_input()).unwrap();

    let handles: Vec<_> = (1..=6u64)
        .map(|n| {
            let s = shared.clone();
            thread::spawn(move || {
                s.supersede(bump(format!("26.{n:02}"), 300, n, Some(1)), t(300))
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().filter(|r| r.is_err()).all(|r| matches!(
        r,
        Err(StorageError::StaleVersion {
            expected: 1,
            found: 2,
            ..
        })
    )));
    shared
        .read(|s| {
            assert_eq!(s.entry_history(&table(), &key()).len(), 2);
            assert_eq!(s.audit_records().len(), 1);
        })
        .unwrap();
}

#[test]
fn at_shared_db_03_readers_never_observe_two_open_rows() {
    let shared = SharedConfigStore::in_memory();
    shared.initialize(init_input()).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let s = shared.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut observations = 0usize;
            while !done.load(Ordering::Acquire) {
                let open = s
                    .read(|st| {
                        st.entry_history(&table(), &key())
                            .iter()
                            .filter(|e| e.is_open())
                            .count()
                    })
                    .unwrap();
                assert_eq!(open, 1);
                observations += 1;
            }
            observations
        })
    };

    for n in 1..=50i64 {
        shared
            .supersede(bump(format!("{}.00", 25 + n), 100 + n, 1, None), t(100 + n))
            .unwrap();
    }
    done.store(true, Ordering::Release);
    reader.join().unwrap();

    shared
        .read(|s| {
            assert_eq!(
                s.current_entry(&table(), &key()).unwrap().version,
                EntryVersion(51)
            );
        })
        .unwrap();
}

#[test]
fn at_shared_db_04_journal_replay_restores_state() {
    let path = temp_journal("replay");
    {
        let shared = SharedConfigStore::open_journaled(&path).unwrap();
        assert!(shared.is_journaled().unwrap());
        shared.initialize(init_input()).unwrap();
        shared
            .supersede(bump("25.50".to_string(), 150, 7, None), t(160))
            .unwrap();
        shared
            .supersede(bump("25.75".to_string(), 170, 8, Some(2)), t(180))
            .unwrap();
    }

    let reopened = SharedConfigStore::open_journaled(&path).unwrap();
    reopened
        .read(|s| {
            let current = s.current_entry(&table(), &key()).unwrap();
            assert_eq!(current.version, EntryVersion(3));
            assert_eq!(current.value.as_str(), "25.75");
            assert_eq!(
                s.entry_as_of(&table(), &key(), t(155)).unwrap().value.as_str(),
                "25.50"
            );
            assert_eq!(s.audit_records().len(), 2);
            assert_eq!(s.audit_records()[1].changed_by, Some(UserId(8)));
        })
        .unwrap();

    // Ids continue after replay.
    let out = reopened
        .supersede(bump("26.00".to_string(), 190, 9, None), t(190))
        .unwrap();
    assert_eq!(out.opened_entry.entry_id.0, 4);
    assert_eq!(out.audit_record_id.0, 3);

    cleanup(&path);
}

#[test]
fn at_shared_db_05_rejected_write_leaves_journal_untouched() {
    let path = temp_journal("reject");
    let shared = SharedConfigStore::open_journaled(&path).unwrap();
    shared.initialize(init_input()).unwrap();
    let before = fs::read_to_string(&path).unwrap();

    assert!(matches!(
        shared.supersede(bump("24.00".to_string(), 50, 7, None), t(60)),
        Err(StorageError::TemporalOrderViolation { .. })
    ));
    assert!(matches!(
        shared.initialize(init_input()),
        Err(StorageError::DuplicateKey { .. })
    ));
    assert_eq!(fs::read_to_string(&path).unwrap(), before);
    assert_eq!(before.lines().count(), 1);
    assert!(before.starts_with("{\"schema_version\":1,"));

    cleanup(&path);
}

#[test]
fn at_shared_db_06_corrupt_journal_fails_with_line_number() {
    let path = temp_journal("corrupt");
    {
        let shared = SharedConfigStore::open_journaled(&path).unwrap();
        shared.initialize(init_input()).unwrap();
    }
    let mut contents = fs::read_to_string(&path).unwrap();
    contents.push_str("{not json}\n");
    fs::write(&path, contents).unwrap();

    match SharedConfigStore::open_journaled(&path) {
        Err(StorageError::Journal { message, .. }) => {
            assert!(message.contains("line 2"), "{message}");
        }
        other => panic!("expected journal error, got {other:?}"),
    }

    cleanup(&path);
}

#[test]
fn at_shared_db_07_unknown_schema_version_is_rejected() {
    let path = temp_journal("schema");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "{\"schema_version\":99,\"mutation\":null}\n").unwrap();

    assert!(matches!(
        SharedConfigStore::open_journaled(&path),
        Err(StorageError::Journal { .. })
    ));

    cleanup(&path);
}
