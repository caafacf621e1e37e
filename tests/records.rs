mod common;

use chrono::{TimeZone, Utc};
use common::{open, open_at, widget, Widget, SAMPLE};
use holdfast::{field, lit, ArrayValue, Database, Entity, Error, Record, RecordStatus, SchemaError, Value};
use tempfile::TempDir;

#[test]
fn test_created_record_is_the_fetched_record() {
    let (_dir, db) = open();
    let w: Widget = db.create().unwrap();
    w.set_name("a").unwrap();

    let again = db.fetch("Widget", w.id()).unwrap();
    assert!(Record::ptr_eq(w.record(), &again));
    assert_eq!(again.get_as::<String>("name").unwrap(), "a");
    assert_eq!(again.status(), RecordStatus::Persisted);
    assert_eq!(again.to_string(), format!("Widget#{}", w.id()));
}

#[test]
fn test_bare_record_reads_defaults() {
    let (_dir, db) = open();
    let w = db.new_record("Widget").unwrap();
    assert_eq!(w.get("name").unwrap(), Value::Null);
    assert_eq!(w.get_as::<i32>("weight").unwrap(), 0);
    assert_eq!(w.get("id").unwrap(), Value::Long(w.id()));
    assert!(w.link("owner").unwrap().is_none());
}

#[test]
fn test_identity_survives_lru_pressure_while_held() {
    let dir = TempDir::new().unwrap();
    let config = holdfast::HoldfastConfig {
        cache_capacity: 2,
        ..common::config()
    };
    let db = Database::open(dir.path(), config).unwrap();
    db.register::<Widget>().unwrap();

    let held = widget(&db, "held", 1);
    for i in 0..10 {
        widget(&db, &format!("w{}", i), i);
    }
    let again = db.fetch("Widget", held.id()).unwrap();
    assert!(Record::ptr_eq(&held, &again));
    assert!(db.cache_stats("Widget").retained <= 2);
}

#[test]
fn test_evicted_record_is_rebuilt_from_storage() {
    let (_dir, db) = open();
    let w = widget(&db, "a", 3);
    assert!(db.evict("Widget", w.id()));

    let fresh = db.fetch("Widget", w.id()).unwrap();
    assert!(!Record::ptr_eq(&w, &fresh));
    assert_eq!(fresh.get_as::<String>("name").unwrap(), "a");
    assert_eq!(fresh.get_as::<i32>("weight").unwrap(), 3);
}

#[test]
fn test_fetch_missing_is_not_found() {
    let (_dir, db) = open();
    match db.fetch("Widget", 4242) {
        Err(Error::NotFound { table, id }) => {
            assert_eq!(table, "Widget");
            assert_eq!(id, 4242);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_read_only_columns_are_rejected() {
    let (_dir, db) = open();
    let w = widget(&db, "a", 1);
    assert!(matches!(w.set("id", 99i64), Err(Error::ReadOnlyColumn { .. })));
    assert!(matches!(w.set("parts", 1i64), Err(Error::ReadOnlyColumn { .. })));

    let owner = db.new_record("Owner").unwrap();
    assert!(matches!(owner.set("badge", 1i64), Err(Error::ReadOnlyColumn { .. })));
    assert_eq!(w.id(), db.fetch("Widget", w.id()).unwrap().id());
}

#[test]
fn test_value_checks_happen_before_the_write() {
    let (_dir, db) = open();
    let w = widget(&db, "a", 1);

    match w.set("name", "x".repeat(17)) {
        Err(Error::ValueTooLong { len, max, .. }) => {
            assert_eq!(len, 17);
            assert_eq!(max, 16);
        }
        other => panic!("unexpected {:?}", other),
    }
    // Characters, not bytes
    w.set("name", "é".repeat(16)).unwrap();

    assert!(matches!(w.set("weight", "heavy"), Err(Error::TypeMismatch { .. })));
    assert!(matches!(w.set("weight", Value::Null), Err(Error::TypeMismatch { .. })));
    assert!(matches!(
        w.get("nope"),
        Err(Error::Schema(SchemaError::UnknownColumn { .. }))
    ));
    assert!(matches!(w.set("owner", 999i64), Err(Error::NotFound { .. })));

    db.clear_cache();
    let stored = db.fetch("Widget", w.id()).unwrap();
    assert_eq!(stored.get_as::<String>("name").unwrap(), "é".repeat(16));
    assert_eq!(stored.get_as::<i32>("weight").unwrap(), 1);
    assert!(stored.link("owner").unwrap().is_none());
}

#[test]
fn test_all_value_types_round_trip() {
    let (_dir, db) = open();
    db.register_table(&SAMPLE).unwrap();
    let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();

    let s = db.new_record("Sample").unwrap();
    s.set("flag", true).unwrap();
    s.set("small", -7i32).unwrap();
    s.set("big", 5i32).unwrap();
    s.set("ratio", 0.5f32).unwrap();
    s.set("precise", 1.0f64 / 3.0).unwrap();
    s.set("label", "héllo").unwrap();
    s.set("raw", vec![0u8, 1, 255]).unwrap();
    s.set("at", at).unwrap();
    s.set("tags", vec!["x".to_string(), "y".to_string()]).unwrap();
    s.set("scores", vec![0.1f64, 2.5e-10]).unwrap();
    let id = s.id();
    drop(s);
    db.clear_cache();

    let s = db.fetch("Sample", id).unwrap();
    assert!(s.get_as::<bool>("flag").unwrap());
    assert_eq!(s.get_as::<i32>("small").unwrap(), -7);
    assert_eq!(s.get("big").unwrap(), Value::Long(5));
    assert_eq!(s.get_as::<f32>("ratio").unwrap(), 0.5);
    assert_eq!(s.get_as::<f64>("precise").unwrap(), 1.0 / 3.0);
    assert_eq!(s.get_as::<String>("label").unwrap(), "héllo");
    assert_eq!(s.get_as::<Vec<u8>>("raw").unwrap(), vec![0, 1, 255]);
    assert_eq!(s.get_as::<chrono::DateTime<Utc>>("at").unwrap(), at);
    assert_eq!(
        s.get("tags").unwrap(),
        Value::Array(ArrayValue::Text(vec!["x".to_string(), "y".to_string()]))
    );
    assert_eq!(s.get_as::<Vec<f64>>("scores").unwrap(), vec![0.1, 2.5e-10]);
    assert_eq!(s.get_as::<Option<String>>("label").unwrap().as_deref(), Some("héllo"));
}

#[test]
fn test_non_finite_floats_are_rejected_before_the_write() {
    let (_dir, db) = open();
    db.register_table(&SAMPLE).unwrap();
    let s = db.new_record("Sample").unwrap();
    s.set("precise", 2.5f64).unwrap();

    assert!(matches!(s.set("precise", f64::NAN), Err(Error::TypeMismatch { .. })));
    assert!(matches!(s.set("precise", f64::INFINITY), Err(Error::TypeMismatch { .. })));
    assert!(matches!(s.set("ratio", f32::NEG_INFINITY), Err(Error::TypeMismatch { .. })));
    assert_eq!(s.get("precise").unwrap(), Value::Double(2.5));
    assert_eq!(s.get("ratio").unwrap(), Value::Null);

    let id = s.id();
    drop(s);
    db.clear_cache();
    let stored = db.fetch("Sample", id).unwrap();
    assert_eq!(stored.get("precise").unwrap(), Value::Double(2.5));
}

#[test]
fn test_refresh_picks_up_outside_changes() {
    let (dir, db) = open();
    let w = widget(&db, "before", 1);

    let conn = rusqlite::Connection::open(dir.path().join("holdfast.db")).unwrap();
    conn.busy_timeout(std::time::Duration::from_secs(5)).unwrap();
    conn.execute("UPDATE \"Widget\" SET \"name\" = 'after' WHERE \"id\" = ?1", [w.id()])
        .unwrap();

    assert_eq!(w.get_as::<String>("name").unwrap(), "before");
    w.refresh().unwrap();
    assert_eq!(w.get_as::<String>("name").unwrap(), "after");
}

#[test]
fn test_erase_makes_records_stale() {
    let (_dir, db) = open();
    let w = widget(&db, "a", 1);
    db.erase().unwrap();

    assert!(matches!(w.get("name"), Err(Error::StaleRecord { .. })));
    assert!(matches!(w.set("name", "b"), Err(Error::StaleRecord { .. })));
    assert_eq!(w.status(), RecordStatus::Forgotten);
    assert!(matches!(
        db.fetch("Widget", w.id()),
        Err(Error::Schema(SchemaError::NotRegistered(_)))
    ));

    // Registration starts over on the empty store.
    db.register::<Widget>().unwrap();
    let fresh = widget(&db, "new", 2);
    assert!(!Record::ptr_eq(&w, &fresh));
    assert_eq!(db.stats().unwrap().lob_files, 0);
}

#[test]
fn test_records_report_closed_after_close() {
    let dir = TempDir::new().unwrap();
    let db = open_at(dir.path());
    db.register::<Widget>().unwrap();
    let w = widget(&db, "a", 1);

    db.close().unwrap();
    assert!(db.is_closed());
    assert!(matches!(w.get("name"), Err(Error::Closed)));
    assert!(matches!(db.new_record("Widget"), Err(Error::Closed)));
    db.close().unwrap();

    drop(db);
    assert!(matches!(w.get("name"), Err(Error::Closed)));
}

#[test]
fn test_repository_surface() {
    let (_dir, db) = open();
    let repo = db.repo::<Widget>();
    for (name, weight) in [("light", 1), ("mid", 6), ("heavy", 9)] {
        let w = repo.create().unwrap();
        w.set_name(name).unwrap();
        w.set_weight(weight).unwrap();
    }
    assert_eq!(repo.count().unwrap(), 3);

    let heavy: Vec<Widget> = repo
        .search(field("weight").gt(lit(5)), true)
        .unwrap()
        .collect::<holdfast::Result<_>>()
        .unwrap();
    let names: Vec<String> = heavy.iter().map(|w| w.name().unwrap().unwrap()).collect();
    assert_eq!(names, vec!["heavy", "mid"]);

    let first = repo.fetch(heavy[1].id()).unwrap();
    assert_eq!(first.weight().unwrap(), 6);
    repo.forget(&first).unwrap();
    assert_eq!(repo.count().unwrap(), 2);
    assert!(matches!(repo.fetch(first.id()), Err(Error::NotFound { .. })));
}
