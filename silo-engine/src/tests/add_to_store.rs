// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! Source imports, literal texts, and invalidation.

use std::collections::BTreeSet;

use silo_store_core::archive;
use silo_store_core::base32;
use silo_store_core::hash::HashAlgo;

use super::test_store::TestStore;
use crate::error::Error;

#[test]
fn import_names_and_registers_a_source() {
    let mut t = TestStore::new();
    let src = t.scratch_file("foo.txt", "hello");

    let path = t.store.add_to_store(&src).unwrap();

    // `<storeDir>/<32-char base32>-foo.txt`
    assert!(path
        .as_str()
        .starts_with(&format!("{}/", t.store.store_dir())));
    assert_eq!(path.hash_part().len(), 32);
    assert!(base32::is_valid(path.hash_part()));
    assert_eq!(path.name(), "foo.txt");

    assert!(t.store.is_valid_path(&path).unwrap());
    assert_eq!(t.read_output(&path), "hello");
    assert!(t.store.query_references(&path).unwrap().is_empty());

    // The registered hash is the hash of the canonicalized tree.
    let expected = archive::hash_path(HashAlgo::Sha256, path.as_path()).unwrap();
    assert_eq!(t.store.query_path_hash(&path).unwrap(), expected);
    assert_eq!(expected.to_prefixed(), format!("sha256:{}", expected.to_hex()));
}

#[test]
fn import_is_idempotent() {
    let mut t = TestStore::new();
    let src = t.scratch_file("foo.txt", "hello");

    let first = t.store.add_to_store(&src).unwrap();
    let second = t.store.add_to_store(&src).unwrap();
    assert_eq!(first, second);
    assert!(t.store.is_valid_path(&first).unwrap());
}

#[test]
fn path_name_depends_on_contents_and_basename() {
    let mut t = TestStore::new();
    let a = t.scratch_file("same.txt", "payload");
    let imported_a = t.store.add_to_store(&a).unwrap();

    // Re-importing the same bytes under the same basename reuses the
    // path, even after the original file is gone.
    std::fs::remove_file(&a).unwrap();
    let b = t.scratch_file("same.txt", "payload");
    assert_eq!(imported_a, t.store.add_to_store(&b).unwrap());

    // A different basename or different bytes makes a different path.
    let renamed = t.scratch_file("renamed.txt", "payload");
    assert_ne!(imported_a, t.store.add_to_store(&renamed).unwrap());
    let changed = t.scratch_file("same.txt", "payload!");
    assert_ne!(imported_a, t.store.add_to_store(&changed).unwrap());
}

#[test]
fn text_with_references_is_registered() {
    let mut t = TestStore::new();
    let src = t.scratch_file("dep.txt", "dependency");
    let dep = t.store.add_to_store(&src).unwrap();

    let text = format!("points at {dep}");
    let path = t
        .store
        .add_text_to_store("note.txt", &text, &BTreeSet::from([dep.clone()]))
        .unwrap();

    assert!(t.store.is_valid_path(&path).unwrap());
    assert_eq!(
        t.store.query_references(&path).unwrap(),
        BTreeSet::from([dep.clone()])
    );
    assert!(t.store.query_referrers(&dep).unwrap().contains(&path));
}

#[test]
fn text_registration_requires_valid_references() {
    let mut t = TestStore::new();
    let missing = t
        .store
        .store_dir()
        .make_store_path(
            "source",
            &silo_store_core::hash::hash_bytes(HashAlgo::Sha256, "nowhere"),
            "ghost",
        );

    let result = t
        .store
        .add_text_to_store("bad.txt", "text", &BTreeSet::from([missing]));
    assert!(matches!(result, Err(Error::Other(_))));
}

#[test]
fn deletion_is_refused_while_referenced() {
    let mut t = TestStore::new();
    let src = t.scratch_file("dep.txt", "dependency");
    let dep = t.store.add_to_store(&src).unwrap();
    let user = t
        .store
        .add_text_to_store("user.txt", "uses the dep", &BTreeSet::from([dep.clone()]))
        .unwrap();

    let err = t.store.delete_from_store(&dep).unwrap_err();
    assert!(err.to_string().contains("because it is in use"));

    // Nothing was mutated.
    assert!(t.store.is_valid_path(&dep).unwrap());
    assert!(t.store.query_referrers(&dep).unwrap().contains(&user));

    // Deleting the referrer first unblocks the dependency.
    t.store.delete_from_store(&user).unwrap();
    t.store.delete_from_store(&dep).unwrap();
    assert!(!t.store.is_valid_path(&dep).unwrap());
    assert!(!dep.as_path().exists());
}

#[test]
fn reimport_after_deletion_yields_the_same_path() {
    let mut t = TestStore::new();
    let src = t.scratch_file("foo.txt", "resurrected");

    let first = t.store.add_to_store(&src).unwrap();
    t.store.delete_from_store(&first).unwrap();
    assert!(!t.store.is_valid_path(&first).unwrap());

    let second = t.store.add_to_store(&src).unwrap();
    assert_eq!(first, second);
    assert!(t.store.is_valid_path(&second).unwrap());
    assert!(t.store.query_references(&second).unwrap().is_empty());
}
