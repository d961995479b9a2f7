#![forbid(unsafe_code)]

use chrono::{TimeZone, Utc};
use eskala_kernel_contracts::actor::{ActorContext, UserId};
use eskala_kernel_contracts::audit::{AuditAction, AuditDiff, AuditRecordId, AuditRecordInput};
use eskala_kernel_contracts::versioned::{
    ConfigKey, ConfigValue, EntryId, EntryInitInput, EntryVersion, SubjectTable, SupersedeInput,
};
use eskala_kernel_contracts::Timestamp;
use eskala_storage::audit::AuditTrail;
use eskala_storage::repo::{AuditLogTablesRepo, VersionedEntryTablesRepo};
use eskala_storage::shared::SharedConfigStore;
use eskala_storage::store::{StorageError, VersionedConfigStore};

fn t(secs: i64) -> Timestamp {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn table(name: &str) -> SubjectTable {
    SubjectTable::new(name).unwrap()
}

fn init_input(tbl: &str, k: &str, value: &str) -> EntryInitInput {
    EntryInitInput::v1(
        table(tbl),
        ConfigKey::new(k).unwrap(),
        ConfigValue::new(value).unwrap(),
        None,
        t(0),
    )
    .unwrap()
}

fn bump(tbl: &str, k: &str, value: &str, at: i64, user: u64) -> SupersedeInput {
    SupersedeInput::v1(
        table(tbl),
        ConfigKey::new(k).unwrap(),
        ConfigValue::new(value).unwrap(),
        t(at),
        format!("set to {value}"),
        ActorContext::v1(Some(UserId(user)), None).unwrap(),
        None,
    )
    .unwrap()
}

fn note(new_value: &str) -> AuditDiff {
    AuditDiff {
        old_value: None,
        new_value: new_value.to_string(),
        old_version: None,
        new_version: EntryVersion::FIRST,
        reason: "imported from spreadsheet".to_string(),
        effective_at: None,
        actor_display_name: Some("importer".to_string()),
    }
}

#[test]
fn at_audit_db_01_one_record_per_supersede_newest_first() {
    let mut s = VersionedConfigStore::new_in_memory();
    s.initialize_entry_row(init_input("fx_rates", "fx_HNL_USD", "25.00"))
        .unwrap();
    let mut opened = Vec::new();
    for (i, v) in ["25.10", "25.20", "25.30"].iter().enumerate() {
        let out = s
            .supersede_entry_row(bump("fx_rates", "fx_HNL_USD", v, 10 * (i as i64 + 1), 3), t(100))
            .unwrap();
        opened.push(out.opened_entry.entry_id);
    }

    assert_eq!(s.audit_rows().len(), 3);
    let ids: Vec<u64> = s.audit_rows().iter().map(|r| r.record_id.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let recent = s.recent_audit_rows(&table("fx_rates"), 2);
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].diff.new_value, "25.30");
    assert_eq!(recent[1].diff.new_value, "25.20");

    let by_subject = s.audit_rows_by_subject(&table("fx_rates"), opened[1]);
    assert_eq!(by_subject.len(), 1);
    assert_eq!(by_subject[0].diff.old_value.as_deref(), Some("25.10"));
    assert_eq!(by_subject[0].diff.new_value, "25.20");
}

#[test]
fn at_audit_db_02_initialize_writes_no_audit_row() {
    let mut s = VersionedConfigStore::new_in_memory();
    s.initialize_entry_row(init_input("formulas", "profit_investment_usd", "investment_l"))
        .unwrap();
    assert!(s.audit_rows().is_empty());
}

#[test]
fn at_audit_db_03_explicit_append_checks_subject_table() {
    let mut s = VersionedConfigStore::new_in_memory();
    let fx = s
        .initialize_entry_row(init_input("fx_rates", "fx_HNL_USD", "25.00"))
        .unwrap();

    let ok = AuditRecordInput::v1(
        table("fx_rates"),
        fx.entry_id,
        AuditAction::Other("IMPORTED".to_string()),
        note("25.00"),
        None,
        t(1),
    )
    .unwrap();
    assert_eq!(s.append_audit_row(ok).unwrap(), AuditRecordId(1));

    // Same entry id, wrong dataset.
    let wrong_table = AuditRecordInput::v1(
        table("formulas"),
        fx.entry_id,
        AuditAction::Other("IMPORTED".to_string()),
        note("25.00"),
        None,
        t(2),
    )
    .unwrap();
    assert!(matches!(
        s.append_audit_row(wrong_table),
        Err(StorageError::ForeignKeyViolation {
            table: "versioned_entries",
            ..
        })
    ));
    assert_eq!(s.audit_rows().len(), 1);
    assert_eq!(s.audit_rows()[0].action.as_str(), "IMPORTED");
}

#[test]
fn at_audit_db_04_records_cannot_be_overwritten() {
    let mut s = VersionedConfigStore::new_in_memory();
    s.initialize_entry_row(init_input("fx_rates", "fx_HNL_USD", "25.00"))
        .unwrap();
    s.supersede_entry_row(bump("fx_rates", "fx_HNL_USD", "26.00", 5, 9), t(5))
        .unwrap();
    let before = s.audit_rows().to_vec();
    assert!(matches!(
        s.attempt_overwrite_audit_record(AuditRecordId(1)),
        Err(StorageError::AppendOnlyViolation { table: "audit_log" })
    ));
    assert_eq!(s.audit_rows(), before.as_slice());
}

#[test]
fn at_audit_db_05_recent_is_scoped_to_dataset() {
    let mut s = VersionedConfigStore::new_in_memory();
    s.initialize_entry_row(init_input("fx_rates", "fx_HNL_USD", "25.00"))
        .unwrap();
    s.initialize_entry_row(init_input("formulas", "profit_l", "investment_l"))
        .unwrap();
    s.supersede_entry_row(bump("fx_rates", "fx_HNL_USD", "26.00", 5, 9), t(5))
        .unwrap();
    s.supersede_entry_row(bump("formulas", "profit_l", "investment_l * 2", 6, 9), t(6))
        .unwrap();
    s.supersede_entry_row(bump("fx_rates", "fx_HNL_USD", "27.00", 7, 9), t(7))
        .unwrap();

    let fx = s.recent_audit_rows(&table("fx_rates"), 10);
    assert_eq!(fx.len(), 2);
    assert!(fx.iter().all(|r| r.subject_table == table("fx_rates")));
    let formulas = s.recent_audit_rows(&table("formulas"), 10);
    assert_eq!(formulas.len(), 1);
    assert_eq!(formulas[0].diff.new_value, "investment_l * 2");
    assert!(s.recent_audit_rows(&table("fx_rates"), 0).is_empty());
}

#[test]
fn at_audit_db_06_trail_over_shared_store() {
    let shared = SharedConfigStore::in_memory();
    let trail = AuditTrail::new(shared.clone());
    let entry = shared
        .initialize(init_input("fx_rates", "fx_HNL_USD", "25.00"))
        .unwrap();

    let id = trail
        .append(
            AuditRecordInput::v1(
                table("fx_rates"),
                entry.entry_id,
                AuditAction::Other("IMPORTED".to_string()),
                note("25.00"),
                Some(UserId(4)),
                t(1),
            )
            .unwrap(),
        )
        .unwrap();
    assert_eq!(id, AuditRecordId(1));

    let rows = trail
        .query_by_subject(&table("fx_rates"), entry.entry_id)
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].changed_by, Some(UserId(4)));
    assert!(trail
        .query_by_subject(&table("fx_rates"), EntryId(404))
        .unwrap()
        .is_empty());
    assert_eq!(trail.query_recent(&table("fx_rates"), 5).unwrap().len(), 1);
}
