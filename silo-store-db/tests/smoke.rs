// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! End-to-end smoke tests for the metadata store public API.

use silo_store_db::{MetaDb, OpenMode, Substitute};
use tempfile::TempDir;

#[test]
fn substitute_records_roundtrip_through_a_table() {
    let dir = TempDir::new().unwrap();
    let mut db = MetaDb::open(dir.path(), OpenMode::Create).unwrap();
    let subs = db.open_table("substitutes").unwrap();

    let sub_a = Substitute {
        deriver: String::new(),
        program: "/usr/bin/fetch".into(),
        args: vec!["--fast".into()],
    };
    let sub_b = Substitute {
        deriver: "/silo/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-x.drv".into(),
        program: "/usr/bin/fetch-slow".into(),
        args: vec![],
    };

    let txn = db.transaction().unwrap();
    txn.put_list(subs, "/p/target", &[sub_a.encode(), sub_b.encode()])
        .unwrap();
    txn.commit().unwrap();

    let decoded: Vec<Substitute> = db
        .get_list(subs, "/p/target")
        .unwrap()
        .iter()
        .filter_map(|rec| Substitute::decode(rec).unwrap())
        .collect();
    assert_eq!(decoded, vec![sub_a, sub_b]);
}

#[test]
fn multiple_tables_are_independent() {
    let dir = TempDir::new().unwrap();
    let mut db = MetaDb::open(dir.path(), OpenMode::Create).unwrap();
    let valid = db.open_table("validpaths").unwrap();
    let refs = db.open_table("references").unwrap();

    let txn = db.transaction().unwrap();
    txn.put_string(valid, "/p/a", "sha256:00").unwrap();
    txn.put_strings(refs, "/p/a", &["/p/b"]).unwrap();
    txn.commit().unwrap();

    assert_eq!(db.enumerate(valid).unwrap(), vec!["/p/a"]);
    assert_eq!(db.enumerate(refs).unwrap(), vec!["/p/a"]);

    let txn = db.transaction().unwrap();
    txn.delete(valid, "/p/a").unwrap();
    txn.commit().unwrap();

    assert_eq!(db.enumerate(valid).unwrap(), Vec::<String>::new());
    assert_eq!(db.get_strings(refs, "/p/a").unwrap(), vec!["/p/b"]);
}

#[test]
fn reopening_preserves_committed_state() {
    let dir = TempDir::new().unwrap();
    {
        let mut db = MetaDb::open(dir.path(), OpenMode::Create).unwrap();
        let valid = db.open_table("validpaths").unwrap();
        let txn = db.transaction().unwrap();
        txn.put_string(valid, "/p/a", "sha256:ff").unwrap();
        txn.commit().unwrap();
    }
    let mut db = MetaDb::open(dir.path(), OpenMode::Auto).unwrap();
    let valid = db.open_table("validpaths").unwrap();
    assert_eq!(db.get_string(valid, "/p/a").unwrap().as_deref(), Some("sha256:ff"));
}
