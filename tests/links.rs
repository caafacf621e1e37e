mod common;

use common::{open, widget};
use holdfast::{Error, Record, SchemaError, Value};

#[test]
fn test_linked_set_membership() {
    let (_dir, db) = open();
    let owner = db.new_record("Owner").unwrap();
    let w: Vec<Record> = (0..4).map(|i| widget(&db, &format!("w{}", i), i)).collect();

    let set = owner.links("widgets").unwrap();
    assert!(set.is_empty().unwrap());

    set.add(&w[0]).unwrap();
    set.add(&w[1]).unwrap();
    assert_eq!(set.len().unwrap(), 2);
    assert!(set.contains(&w[1]).unwrap());
    assert!(!set.contains(&w[2]).unwrap());
    assert!(Record::ptr_eq(&set.get(0).unwrap().unwrap(), &w[0]));
    assert!(Record::ptr_eq(&w[0].link("owner").unwrap().unwrap(), &owner));

    assert!(set.remove(&w[0]).unwrap());
    assert!(!set.remove(&w[0]).unwrap());
    assert!(w[0].link("owner").unwrap().is_none());

    assert_eq!(set.add_all(&[w[2].clone(), w[3].clone()]).unwrap(), 2);
    assert_eq!(w[3].get("owner").unwrap(), Value::Long(owner.id()));
    let members: Vec<i64> = set.iter().map(|r| r.unwrap().id()).collect();
    assert_eq!(members, vec![w[1].id(), w[2].id(), w[3].id()]);

    assert_eq!(set.clear().unwrap(), 3);
    assert!(set.is_empty().unwrap());
    assert!(w[1].link("owner").unwrap().is_none());
    assert_eq!(w[2].get("owner").unwrap(), Value::Null);
}

#[test]
fn test_add_all_refuses_a_vanished_child() {
    let (dir, db) = open();
    let owner = db.new_record("Owner").unwrap();
    let w: Vec<Record> = (0..3).map(|i| widget(&db, &format!("w{}", i), i)).collect();

    let conn = rusqlite::Connection::open(dir.path().join("holdfast.db")).unwrap();
    conn.busy_timeout(std::time::Duration::from_secs(5)).unwrap();
    conn.execute("DELETE FROM \"Widget\" WHERE \"id\" = ?1", [w[1].id()]).unwrap();
    drop(conn);

    let set = owner.links("widgets").unwrap();
    let err = set.add_all(&w).unwrap_err();
    assert!(matches!(err, Error::NotFound { id, .. } if id == w[1].id()));
    assert!(set.is_empty().unwrap());
    assert_eq!(w[0].get("owner").unwrap(), Value::Null);
    assert_eq!(w[2].get("owner").unwrap(), Value::Null);

    // Duplicates count once.
    assert_eq!(set.add_all(&[w[0].clone(), w[2].clone(), w[0].clone()]).unwrap(), 2);
    assert_eq!(set.len().unwrap(), 2);
}

#[test]
fn test_linked_set_pages_through_large_collections() {
    let (_dir, db) = open();
    let owner = db.new_record("Owner").unwrap();
    let set = owner.links("widgets").unwrap();
    let children: Vec<Record> = (0..20).map(|i| widget(&db, &format!("c{}", i), i)).collect();
    set.add_all(&children).unwrap();

    let seen: Vec<Record> = set.iter().collect::<holdfast::Result<_>>().unwrap();
    assert_eq!(seen.len(), 20);
    assert!(seen.iter().zip(&children).all(|(a, b)| Record::ptr_eq(a, b)));
    // Scale 8 with a border of 2: 0..8 then three more moves.
    assert_eq!(set.fetch_count(), 4);
}

#[test]
fn test_required_children_cannot_be_detached() {
    let (_dir, db) = open();
    let w = widget(&db, "w", 1);
    let part = db.new_record("Part").unwrap();
    let parts = w.links("parts").unwrap();
    parts.add(&part).unwrap();

    assert!(matches!(parts.clear(), Err(Error::StillReferenced { .. })));
    assert!(matches!(part.set_link("widget", None), Err(Error::TypeMismatch { .. })));
    assert_eq!(parts.len().unwrap(), 1);
}

#[test]
fn test_link_type_checks() {
    let (_dir, db) = open();
    let owner = db.new_record("Owner").unwrap();
    let w = widget(&db, "w", 1);
    let part = db.new_record("Part").unwrap();

    let set = owner.links("widgets").unwrap();
    assert!(matches!(set.add(&part), Err(Error::TypeMismatch { .. })));
    assert!(!set.contains(&part).unwrap());
    assert!(matches!(w.set_link("owner", Some(&part)), Err(Error::TypeMismatch { .. })));
    assert!(matches!(
        w.links("name"),
        Err(Error::Schema(SchemaError::InvalidLink { .. }))
    ));
    assert!(matches!(
        w.set_link("weight", None),
        Err(Error::Schema(SchemaError::InvalidLink { .. }))
    ));
}

#[test]
fn test_mapped_one_to_one_moves_the_foreign_key() {
    let (_dir, db) = open();
    let owner = db.new_record("Owner").unwrap();
    let first = db.new_record("Badge").unwrap();
    let second = db.new_record("Badge").unwrap();

    assert!(owner.link("badge").unwrap().is_none());
    owner.set_link("badge", Some(&first)).unwrap();
    assert!(Record::ptr_eq(&owner.link("badge").unwrap().unwrap(), &first));
    assert!(Record::ptr_eq(&first.link("holder").unwrap().unwrap(), &owner));

    owner.set_link("badge", Some(&second)).unwrap();
    assert_eq!(first.get("holder").unwrap(), Value::Null);
    assert_eq!(second.get("holder").unwrap(), Value::Long(owner.id()));
    assert!(Record::ptr_eq(&owner.link("badge").unwrap().unwrap(), &second));

    owner.set_link("badge", None).unwrap();
    assert!(owner.link("badge").unwrap().is_none());
    assert_eq!(second.get("holder").unwrap(), Value::Null);
}
