// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! Realisation through substitutes.

use std::collections::{BTreeMap, BTreeSet};

use silo_store_core::archive;
use silo_store_core::hash::{hash_bytes, HashAlgo};
use silo_store_core::StorePath;
use silo_store_db::Substitute;

use super::test_store::TestStore;

fn unbuilt_path(t: &TestStore, seed: &str, name: &str) -> StorePath {
    t.store
        .store_dir()
        .make_store_path("source", &hash_bytes(HashAlgo::Sha256, seed), name)
}

#[test]
fn substitute_produces_and_registers_a_path() {
    let mut t = TestStore::new();
    let target = unbuilt_path(&t, "greeting", "greeting.txt");

    let writer = t.script(
        "produce.sh",
        "#!/bin/sh\nprintf 'Hallo Wereld' > \"$1\"\n",
    );
    t.store
        .register_substitute(
            &target,
            &Substitute {
                deriver: String::new(),
                program: writer.display().to_string(),
                args: vec![],
            },
        )
        .unwrap();

    t.store.ensure_path(&target).unwrap();

    assert!(t.store.is_valid_path(&target).unwrap());
    assert_eq!(t.read_output(&target), "Hallo Wereld");

    // The registered hash is that of the canonicalized tree.
    let expected = archive::hash_path(HashAlgo::Sha256, target.as_path()).unwrap();
    assert_eq!(t.store.query_path_hash(&target).unwrap(), expected);
}

#[test]
fn substituted_input_feeds_a_build() {
    let mut t = TestStore::new();
    let input = unbuilt_path(&t, "ingredient", "ingredient.txt");

    let writer = t.script(
        "produce.sh",
        "#!/bin/sh\nprintf 'from the cache' > \"$1\"\n",
    );
    t.store
        .register_substitute(
            &input,
            &Substitute {
                deriver: String::new(),
                program: writer.display().to_string(),
                args: vec![],
            },
        )
        .unwrap();

    let drv = t.shell_derivation(
        "consumer-1.0",
        "cat $input > $out",
        BTreeSet::from([input.clone()]),
        BTreeMap::from([("input".to_string(), input.to_string())]),
    );

    t.store.build_derivations(&[drv.clone()]).unwrap();

    assert!(t.store.is_valid_path(&input).unwrap());
    let out = t.store.read_derivation(&drv).unwrap().outputs["out"].path.clone();
    assert_eq!(t.read_output(&out), "from the cache");
}

#[test]
fn failing_substitute_falls_through_to_the_next() {
    let mut t = TestStore::new();
    let target = unbuilt_path(&t, "resilient", "resilient.txt");

    let broken = t.script("broken.sh", "#!/bin/sh\nexit 1\n");
    let working = t.script(
        "working.sh",
        "#!/bin/sh\nprintf 'second try' > \"$1\"\n",
    );

    // Registration order: `working` first, then `broken` — which moves
    // to the front and is therefore tried (and fails) first.
    for program in [&working, &broken] {
        t.store
            .register_substitute(
                &target,
                &Substitute {
                    deriver: String::new(),
                    program: program.display().to_string(),
                    args: vec![],
                },
            )
            .unwrap();
    }
    let subs = t.store.query_substitutes(&target).unwrap();
    assert_eq!(subs[0].program, broken.display().to_string());

    t.store.ensure_path(&target).unwrap();
    assert_eq!(t.read_output(&target), "second try");
}

#[test]
fn reregistering_a_substitute_moves_it_to_the_front_once() {
    let mut t = TestStore::new();
    let target = unbuilt_path(&t, "dedup", "dedup.txt");

    let a = Substitute {
        deriver: String::new(),
        program: "/usr/bin/fetch-a".into(),
        args: vec!["--mirror".into()],
    };
    let b = Substitute {
        deriver: String::new(),
        program: "/usr/bin/fetch-b".into(),
        args: vec![],
    };

    t.store.register_substitute(&target, &a).unwrap();
    t.store.register_substitute(&target, &b).unwrap();
    t.store.register_substitute(&target, &a).unwrap();

    let subs = t.store.query_substitutes(&target).unwrap();
    assert_eq!(subs.len(), 2, "re-registration must not duplicate");
    assert_eq!(subs[0].program, "/usr/bin/fetch-a");
    assert_eq!(subs[1].program, "/usr/bin/fetch-b");
}

#[test]
fn path_without_substitutes_cannot_be_ensured() {
    let mut t = TestStore::new();
    let target = unbuilt_path(&t, "hopeless", "hopeless.txt");

    let err = t.store.ensure_path(&target).unwrap_err();
    assert!(err.to_string().contains("cannot be created"));
    assert!(!t.store.is_valid_path(&target).unwrap());
}

#[test]
fn substitution_realises_declared_references_first() {
    let mut t = TestStore::new();

    // `dep` is substitutable; `top` declares a reference on `dep` in the
    // metadata (registered while `top` is still only substitutable).
    let dep = unbuilt_path(&t, "lower", "lower.txt");
    let top = unbuilt_path(&t, "higher", "higher.txt");

    let write_dep = t.script("dep.sh", "#!/bin/sh\nprintf 'dep' > \"$1\"\n");
    let write_top = t.script("top.sh", "#!/bin/sh\nprintf 'top' > \"$1\"\n");

    t.store
        .register_substitute(
            &dep,
            &Substitute {
                deriver: String::new(),
                program: write_dep.display().to_string(),
                args: vec![],
            },
        )
        .unwrap();
    t.store
        .register_substitute(
            &top,
            &Substitute {
                deriver: String::new(),
                program: write_top.display().to_string(),
                args: vec![],
            },
        )
        .unwrap();

    // Declaring references is only allowed for usable paths, which
    // `top` now is.
    let txn = t.store.begin().unwrap();
    txn.set_references(&top, &BTreeSet::from([dep.clone()])).unwrap();
    txn.commit().unwrap();

    t.store.ensure_path(&top).unwrap();

    assert!(t.store.is_valid_path(&dep).unwrap(), "closure before self");
    assert!(t.store.is_valid_path(&top).unwrap());
    assert_eq!(
        t.store.query_references(&top).unwrap(),
        BTreeSet::from([dep])
    );
}
