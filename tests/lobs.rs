mod common;

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Barrier;

use common::{open, open_at, widget, Widget};
use holdfast::config;
use holdfast::lob::LobStore;
use holdfast::{Error, Value};
use tempfile::TempDir;

#[test]
fn test_replacing_a_stream_erases_the_old_blob() {
    let (_dir, db) = open();
    let w = widget(&db, "w", 1);
    let first = db.create_lob().unwrap();
    first.write_all(b"first manual").unwrap();
    w.set("manual", &first).unwrap();
    assert_eq!(w.lob("manual").unwrap(), Some(first.clone()));

    let second = db.create_lob().unwrap();
    second.write_all(b"second").unwrap();
    w.set_lob("manual", Some(&second)).unwrap();
    assert!(!first.exists());
    assert_eq!(second.read_all().unwrap(), b"second");

    // Setting the same blob again changes nothing.
    w.set_lob("manual", Some(&second)).unwrap();
    assert!(second.exists());

    w.set("manual", Value::Null).unwrap();
    assert!(!second.exists());
    assert_eq!(w.lob("manual").unwrap(), None);
    assert_eq!(db.stats().unwrap().referenced_lobs, 0);
}

#[test]
fn test_shared_blob_survives_until_last_owner_drops_it() {
    let (_dir, db) = open();
    let a = widget(&db, "a", 1);
    let b = widget(&db, "b", 2);
    let lob = db.create_lob().unwrap();
    lob.write_all(b"shared").unwrap();
    a.set_lob("manual", Some(&lob)).unwrap();
    b.set_lob("manual", Some(&lob)).unwrap();

    assert!(!db.release_lob(&lob).unwrap());
    a.forget().unwrap();
    assert!(lob.exists());
    b.set_lob("manual", None).unwrap();
    assert!(!lob.exists());
}

#[test]
fn test_unattached_blob_can_be_released() {
    let (_dir, db) = open();
    let lob = db.create_lob().unwrap();
    assert!(lob.exists());
    assert!(lob.is_empty().unwrap());
    assert!(db.release_lob(&lob).unwrap());
    assert!(!lob.exists());
    assert_eq!(db.lob(lob.id()), lob);
}

#[test]
fn test_released_blob_cannot_be_attached() {
    let (_dir, db) = open();
    let w = widget(&db, "w", 1);
    let lob = db.create_lob().unwrap();
    assert!(db.release_lob(&lob).unwrap());

    assert!(matches!(w.set_lob("manual", Some(&lob)), Err(Error::LobErased(_))));
    assert_eq!(w.lob("manual").unwrap(), None);
    assert_eq!(db.stats().unwrap().referenced_lobs, 0);
}

#[test]
fn test_attach_racing_the_last_owner_never_dangles() {
    let (_dir, db) = open();
    for round in 0..20 {
        let holder = widget(&db, &format!("h{}", round), 1);
        let taker = widget(&db, &format!("t{}", round), 2);
        let lob = db.create_lob().unwrap();
        lob.write_all(b"contested").unwrap();
        holder.set_lob("manual", Some(&lob)).unwrap();

        let barrier = Barrier::new(2);
        let attached = std::thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                holder.set_lob("manual", None).unwrap();
            });
            let taker_side = scope.spawn(|| {
                barrier.wait();
                taker.set_lob("manual", Some(&lob))
            });
            taker_side.join().unwrap()
        });

        match attached {
            Ok(()) => {
                assert!(lob.exists(), "round {} lost a referenced blob", round);
                assert_eq!(lob.read_all().unwrap(), b"contested");
            }
            Err(Error::LobErased(_)) => {
                assert!(!lob.exists());
                assert_eq!(taker.lob("manual").unwrap(), None);
            }
            Err(e) => panic!("unexpected {:?}", e),
        }
        db.clear_cache();
        let stored = db.fetch("Widget", taker.id()).unwrap();
        if let Some(kept) = stored.lob("manual").unwrap() {
            assert!(kept.exists());
        }
    }
}

#[test]
fn test_stream_columns_reject_other_values() {
    let (_dir, db) = open();
    let w = widget(&db, "w", 1);
    assert!(matches!(w.set("manual", "text"), Err(Error::TypeMismatch { .. })));
    let lob = db.create_lob().unwrap();
    assert!(matches!(w.set_lob("name", Some(&lob)), Err(Error::TypeMismatch { .. })));
}

#[test]
fn test_view_random_access() {
    let (_dir, db) = open();
    let lob = db.create_lob().unwrap();
    let mut view = lob.view().unwrap();
    view.write_all(b"hello world").unwrap();
    view.write_at(6, b"WORLD").unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(view.read_at(0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");

    view.seek(SeekFrom::Start(6)).unwrap();
    let mut rest = String::new();
    view.read_to_string(&mut rest).unwrap();
    assert_eq!(rest, "WORLD");

    view.set_len(5).unwrap();
    view.sync().unwrap();
    drop(view);
    assert_eq!(lob.len().unwrap(), 5);
}

#[test]
fn test_journaled_deletions_are_replayed_after_a_crash() {
    let dir = TempDir::new().unwrap();
    let (kept, orphan, kept_owner) = {
        let db = open_at(dir.path());
        db.register::<Widget>().unwrap();
        let w = widget(&db, "w", 1);
        let kept = db.create_lob().unwrap();
        kept.write_all(b"still referenced").unwrap();
        w.set_lob("manual", Some(&kept)).unwrap();
        let orphan = db.create_lob().unwrap();
        orphan.write_all(b"never committed").unwrap();
        (kept, orphan, w.id())
    };

    // A crash between journaling and erasing leaves both records live.
    {
        let store = LobStore::open(&config::lob_dir(dir.path()), &config::journal_path(dir.path())).unwrap();
        store.begin_deletion(kept.id()).unwrap();
        store.begin_deletion(orphan.id()).unwrap();
    }
    assert!(std::fs::metadata(config::journal_path(dir.path())).unwrap().len() >= 32);

    let db = open_at(dir.path());
    let report = db.recovery_report();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.discarded, 1);
    assert_eq!(report.skipped, 0);
    assert!(kept.exists());
    assert!(!orphan.exists());
    assert_eq!(std::fs::metadata(config::journal_path(dir.path())).unwrap().len(), 0);

    db.register::<Widget>().unwrap();
    let w = db.fetch("Widget", kept_owner).unwrap();
    assert_eq!(w.lob("manual").unwrap().unwrap().read_all().unwrap(), b"still referenced");
}

#[test]
fn test_corrupt_journal_records_are_skipped() {
    let dir = TempDir::new().unwrap();
    drop(open_at(dir.path()));

    let mut garbage = vec![0xAB; 16];
    garbage.extend_from_slice(&[1, 2, 3]);
    let mut journal = std::fs::OpenOptions::new()
        .append(true)
        .open(config::journal_path(dir.path()))
        .unwrap();
    journal.write_all(&garbage).unwrap();
    drop(journal);

    let db = open_at(dir.path());
    assert_eq!(db.recovery_report().skipped, 1);
    assert_eq!(db.recovery_report().replayed, 0);
}
