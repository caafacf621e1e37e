mod common;

use common::{open, widget, REVIEW};
use holdfast::{Error, Record, RecordStatus, Value};

fn part_with_drawing(db: &holdfast::Database, owner: &Record, bytes: &[u8]) -> (Record, holdfast::LargeObject) {
    let part = db.new_record("Part").unwrap();
    part.set_link("widget", Some(owner)).unwrap();
    let lob = db.create_lob().unwrap();
    lob.write_all(bytes).unwrap();
    part.set_lob("drawing", Some(&lob)).unwrap();
    (part, lob)
}

#[test]
fn test_forget_cascades_to_children_and_their_blobs() {
    let (_dir, db) = open();
    let owner = db.new_record("Owner").unwrap();
    let w = widget(&db, "w", 1);
    w.set_link("owner", Some(&owner)).unwrap();
    let (p1, lob1) = part_with_drawing(&db, &w, b"one");
    let (p2, lob2) = part_with_drawing(&db, &w, b"two");
    let keep = widget(&db, "keep", 2);
    let (p3, lob3) = part_with_drawing(&db, &keep, b"three");

    db.forget(&w).unwrap();

    assert_eq!(w.status(), RecordStatus::Forgotten);
    assert!(p1.is_forgotten() && p2.is_forgotten());
    assert!(!p3.is_forgotten());
    assert!(!lob1.exists() && !lob2.exists());
    assert!(lob3.exists());
    assert!(matches!(db.fetch("Part", p1.id()), Err(Error::NotFound { .. })));
    assert!(matches!(db.fetch("Widget", w.id()), Err(Error::NotFound { .. })));
    assert_eq!(owner.links("widgets").unwrap().len().unwrap(), 0);
    assert_eq!(db.query("Part").unwrap().build().unwrap().len().unwrap(), 1);
    assert_eq!(db.stats().unwrap().pending_deletions, 0);
}

#[test]
fn test_forget_clears_optional_references() {
    let (_dir, db) = open();
    let owner = db.new_record("Owner").unwrap();
    let badge = db.new_record("Badge").unwrap();
    owner.set_link("badge", Some(&badge)).unwrap();
    let w = widget(&db, "w", 1);
    w.set_link("owner", Some(&owner)).unwrap();

    owner.forget().unwrap();

    assert_eq!(w.get("owner").unwrap(), Value::Null);
    assert_eq!(badge.get("holder").unwrap(), Value::Null);
    db.clear_cache();
    let stored = db.fetch("Widget", w.id()).unwrap();
    assert!(stored.link("owner").unwrap().is_none());
}

#[test]
fn test_required_reference_blocks_forget() {
    let (_dir, db) = open();
    db.register_table(&REVIEW).unwrap();
    let w = widget(&db, "w", 1);
    let (part, lob) = part_with_drawing(&db, &w, b"kept");
    let review = db.new_record("Review").unwrap();
    review.set_link("widget", Some(&w)).unwrap();

    match db.forget(&w) {
        Err(Error::StillReferenced { table, referrer, column, .. }) => {
            assert_eq!(table, "Widget");
            assert_eq!(referrer, "Review");
            assert_eq!(column, "widget");
        }
        other => panic!("unexpected {:?}", other),
    }

    // Nothing was applied.
    assert_eq!(w.status(), RecordStatus::Persisted);
    assert!(!part.is_forgotten());
    assert!(lob.exists());
    db.clear_cache();
    assert_eq!(db.fetch("Part", part.id()).unwrap().lob("drawing").unwrap(), Some(lob));

    review.forget().unwrap();
    w.forget().unwrap();
}

#[test]
fn test_forget_of_vanished_row_is_not_found() {
    let (dir, db) = open();
    let w = widget(&db, "w", 1);
    let conn = rusqlite::Connection::open(dir.path().join("holdfast.db")).unwrap();
    conn.busy_timeout(std::time::Duration::from_secs(5)).unwrap();
    conn.execute("DELETE FROM \"Widget\" WHERE \"id\" = ?1", [w.id()]).unwrap();

    assert!(matches!(w.forget(), Err(Error::NotFound { .. })));
    assert!(!w.is_forgotten());
}

#[test]
fn test_forgotten_records_are_terminal() {
    let (_dir, db) = open();
    let w = widget(&db, "w", 1);
    let id = w.id();
    w.forget().unwrap();

    assert!(matches!(w.forget(), Err(Error::StaleRecord { .. })));
    assert!(matches!(w.get("name"), Err(Error::StaleRecord { .. })));
    assert!(matches!(w.set("name", "again"), Err(Error::StaleRecord { .. })));

    let next = widget(&db, "next", 2);
    assert_ne!(next.id(), id);
}
