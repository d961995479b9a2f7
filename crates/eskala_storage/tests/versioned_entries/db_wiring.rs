#![forbid(unsafe_code)]

use chrono::{TimeZone, Utc};
use eskala_kernel_contracts::actor::{ActorContext, UserId};
use eskala_kernel_contracts::versioned::{
    ConfigKey, ConfigValue, EntryId, EntryInitInput, EntryVersion, SubjectTable, SupersedeInput,
};
use eskala_kernel_contracts::{ContractViolation, Timestamp};
use eskala_storage::repo::{AuditLogTablesRepo, VersionedEntryTablesRepo};
use eskala_storage::store::{StorageError, VersionedConfigStore};

fn t(secs: i64) -> Timestamp {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn table(name: &str) -> SubjectTable {
    SubjectTable::new(name).unwrap()
}

fn key(k: &str) -> ConfigKey {
    ConfigKey::new(k).unwrap()
}

fn init(s: &mut VersionedConfigStore, tbl: &str, k: &str, value: &str, at: i64) {
    s.initialize_entry_row(
        EntryInitInput::v1(
            table(tbl),
            key(k),
            ConfigValue::new(value).unwrap(),
            Some("HNL to USD".to_string()),
            t(at),
        )
        .unwrap(),
    )
    .unwrap();
}

fn supersede(
    tbl: &str,
    k: &str,
    value: &str,
    at: i64,
    reason: &str,
    actor: ActorContext,
) -> SupersedeInput {
    SupersedeInput::v1(
        table(tbl),
        key(k),
        ConfigValue::new(value).unwrap(),
        t(at),
        reason.to_string(),
        actor,
        None,
    )
    .unwrap()
}

fn alice() -> ActorContext {
    ActorContext::v1(Some(UserId(7)), Some("alice".to_string())).unwrap()
}

#[test]
fn at_vkvs_db_01_initialize_opens_version_one_once() {
    let mut s = VersionedConfigStore::new_in_memory();
    init(&mut s, "fx_rates", "fx_HNL_USD", "25.00", 100);

    let open = s.current_entry_row(&table("fx_rates"), &key("fx_HNL_USD")).unwrap();
    assert_eq!(open.version, EntryVersion::FIRST);
    assert_eq!(open.valid_from, t(100));
    assert!(open.valid_to.is_none());

    let dup = s.initialize_entry_row(
        EntryInitInput::v1(
            table("fx_rates"),
            key("fx_HNL_USD"),
            ConfigValue::new("30.00").unwrap(),
            None,
            t(200),
        )
        .unwrap(),
    );
    assert!(matches!(dup, Err(StorageError::DuplicateKey { .. })));
    assert_eq!(s.entry_rows().len(), 1);
}

#[test]
fn at_vkvs_db_02_supersede_closes_opens_and_audits() {
    let mut s = VersionedConfigStore::new_in_memory();
    init(&mut s, "fx_rates", "fx_HNL_USD", "25.00", 100);

    let out = s
        .supersede_entry_row(
            supersede(
                "fx_rates",
                "fx_HNL_USD",
                "25.50",
                150,
                "quarterly adjustment",
                alice(),
            ),
            t(160),
        )
        .unwrap();
    assert_eq!(out.old_version(), EntryVersion(1));
    assert_eq!(out.new_version(), EntryVersion(2));

    let history = s.entry_history_rows(&table("fx_rates"), &key("fx_HNL_USD"));
    assert_eq!(history.len(), 2);
    let (v2, v1) = (history[0], history[1]);
    assert_eq!(v1.valid_to, Some(t(150)));
    assert_eq!(v2.value.as_str(), "25.50");
    assert_eq!(v2.valid_from, t(150));
    assert!(v2.valid_to.is_none());
    assert_eq!(v2.description.as_deref(), Some("HNL to USD"));

    let audit = s.audit_rows();
    assert_eq!(audit.len(), 1);
    let rec = &audit[0];
    assert_eq!(rec.subject_table, table("fx_rates"));
    assert_eq!(rec.subject_key, v2.entry_id);
    assert_eq!(rec.changed_by, Some(UserId(7)));
    assert_eq!(rec.changed_at, t(160));
    assert_eq!(rec.diff.old_value.as_deref(), Some("25.00"));
    assert_eq!(rec.diff.new_value, "25.50");
    assert_eq!(rec.diff.old_version, Some(EntryVersion(1)));
    assert_eq!(rec.diff.new_version, EntryVersion(2));
    assert_eq!(rec.diff.reason, "quarterly adjustment");
    assert_eq!(rec.diff.actor_display_name.as_deref(), Some("alice"));
}

#[test]
fn at_vkvs_db_03_empty_reason_writes_nothing() {
    let mut s = VersionedConfigStore::new_in_memory();
    init(&mut s, "fx_rates", "fx_HNL_USD", "25.00", 100);

    // Built by hand to get past the `v1` constructor check.
    let input = SupersedeInput {
        table: table("fx_rates"),
        key: key("fx_HNL_USD"),
        new_value: ConfigValue::new("25.50").unwrap(),
        effective_at: t(150),
        reason: String::new(),
        actor: alice(),
        expected_version: None,
    };
    assert!(matches!(
        s.supersede_entry_row(input, t(160)),
        Err(StorageError::ContractViolation(
            ContractViolation::InvalidValue {
                field: "supersede_input.reason",
                ..
            }
        ))
    ));
    assert_eq!(s.entry_rows().len(), 1);
    assert!(s.audit_rows().is_empty());
    assert!(s
        .current_entry_row(&table("fx_rates"), &key("fx_HNL_USD"))
        .unwrap()
        .valid_to
        .is_none());
}

#[test]
fn at_vkvs_db_04_supersede_unknown_key_not_found() {
    let mut s = VersionedConfigStore::new_in_memory();
    let r = s.supersede_entry_row(
        supersede("formulas", "profit_investment_usd", "1", 10, "why", alice()),
        t(10),
    );
    assert!(matches!(r, Err(StorageError::NotFound { .. })));
    assert!(s.audit_rows().is_empty());
}

#[test]
fn at_vkvs_db_05_as_of_resolves_half_open_windows() {
    let mut s = VersionedConfigStore::new_in_memory();
    init(&mut s, "fx_rates", "fx_HNL_USD", "25.00", 100);
    s.supersede_entry_row(
        supersede("fx_rates", "fx_HNL_USD", "25.50", 200, "q2", alice()),
        t(200),
    )
    .unwrap();
    s.supersede_entry_row(
        supersede("fx_rates", "fx_HNL_USD", "26.00", 300, "q3", alice()),
        t(300),
    )
    .unwrap();

    let tbl = table("fx_rates");
    let k = key("fx_HNL_USD");
    assert!(s.entry_row_as_of(&tbl, &k, t(99)).is_none());
    assert_eq!(s.entry_row_as_of(&tbl, &k, t(100)).unwrap().version.0, 1);
    assert_eq!(s.entry_row_as_of(&tbl, &k, t(150)).unwrap().version.0, 1);
    assert_eq!(s.entry_row_as_of(&tbl, &k, t(200)).unwrap().version.0, 2);
    assert_eq!(s.entry_row_as_of(&tbl, &k, t(299)).unwrap().version.0, 2);
    assert_eq!(s.entry_row_as_of(&tbl, &k, t(10_000)).unwrap().version.0, 3);
}

#[test]
fn at_vkvs_db_06_timeline_is_gapless_and_has_one_open_row() {
    let mut s = VersionedConfigStore::new_in_memory();
    init(&mut s, "formulas", "profit_investment_usd", "investment_l / exchange_rate", 10);
    for (i, at) in [20, 20, 35, 90].iter().enumerate() {
        s.supersede_entry_row(
            supersede(
                "formulas",
                "profit_investment_usd",
                &format!("investment_l / exchange_rate * {}", i + 1),
                *at,
                "tuning",
                ActorContext::system(),
            ),
            t(100),
        )
        .unwrap();
    }
    let tbl = table("formulas");
    let k = key("profit_investment_usd");
    s.verify_key_timeline(&tbl, &k).unwrap();

    let history = s.entry_history_rows(&tbl, &k);
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].version.0, 5);
    assert_eq!(history.iter().filter(|e| e.valid_to.is_none()).count(), 1);
    let mut ascending = history.clone();
    ascending.reverse();
    for pair in ascending.windows(2) {
        assert_eq!(pair[0].version.0 + 1, pair[1].version.0);
        assert_eq!(pair[0].valid_to, Some(pair[1].valid_from));
    }
}

#[test]
fn at_vkvs_db_07_datasets_are_isolated() {
    let mut s = VersionedConfigStore::new_in_memory();
    init(&mut s, "fx_rates", "shared_key", "25.00", 100);
    init(&mut s, "formulas", "shared_key", "investment_l", 100);

    s.supersede_entry_row(
        supersede("fx_rates", "shared_key", "26.00", 150, "bump", alice()),
        t(150),
    )
    .unwrap();

    assert_eq!(
        s.current_entry_row(&table("formulas"), &key("shared_key"))
            .unwrap()
            .version
            .0,
        1
    );
    assert_eq!(s.current_entry_rows(&table("fx_rates")).len(), 1);
    assert_eq!(s.current_entry_rows(&table("formulas")).len(), 1);
    assert!(s.recent_audit_rows(&table("formulas"), 10).is_empty());
}

#[test]
fn at_vkvs_db_08_rows_are_never_deleted() {
    let mut s = VersionedConfigStore::new_in_memory();
    init(&mut s, "fx_rates", "fx_HNL_USD", "25.00", 100);
    assert!(matches!(
        s.attempt_delete_entry(EntryId(1)),
        Err(StorageError::AppendOnlyViolation {
            table: "versioned_entries"
        })
    ));
    assert_eq!(s.entry_rows().len(), 1);
}

#[test]
fn at_vkvs_db_09_rebuild_key_index_is_lossless() {
    let mut s = VersionedConfigStore::new_in_memory();
    init(&mut s, "fx_rates", "fx_HNL_USD", "25.00", 100);
    init(&mut s, "fx_rates", "fx_HNL_EUR", "27.00", 100);
    s.supersede_entry_row(
        supersede("fx_rates", "fx_HNL_USD", "25.50", 150, "bump", alice()),
        t(150),
    )
    .unwrap();

    let tbl = table("fx_rates");
    let before: Vec<_> = s
        .current_entry_rows(&tbl)
        .into_iter()
        .map(|e| (e.key.clone(), e.version))
        .collect();
    s.rebuild_entry_key_index();
    let after: Vec<_> = s
        .current_entry_rows(&tbl)
        .into_iter()
        .map(|e| (e.key.clone(), e.version))
        .collect();
    assert_eq!(before, after);
    s.verify_all().unwrap();
}
