// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! A self-contained store in a temporary directory, plus helpers for
//! writing sources, executables and derivations in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;

use silo_store_core::derivation::FixedOutput;
use silo_store_core::{Derivation, StorePath};
use tempfile::TempDir;

use crate::config::Settings;
use crate::store::LocalStore;

pub struct TestStore {
    pub store: LocalStore,
    dir: TempDir,
}

/// Route engine logs into the test harness; `RUST_LOG` filters as usual.
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl TestStore {
    pub fn new() -> TestStore {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(tweak: impl FnOnce(&mut Settings)) -> TestStore {
        init_logging();
        let dir = TempDir::new().expect("creating test directory");
        let mut settings = Settings {
            store_dir: dir.path().join("store"),
            data_dir: dir.path().join("share"),
            state_dir: dir.path().join("var"),
            log_dir: dir.path().join("var/log"),
            db_dir: dir.path().join("var/db"),
            conf_dir: dir.path().join("etc"),
            // Temp directories often live behind symlinks (/tmp on some
            // systems); that is fine for tests.
            ignore_symlink_store: true,
            max_build_jobs: 2,
            ..Settings::default()
        };
        tweak(&mut settings);
        let store = LocalStore::open(settings).expect("opening test store");
        TestStore { store, dir }
    }

    /// Write a scratch file outside the store and return its location.
    pub fn scratch_file(&self, name: &str, contents: &str) -> PathBuf {
        let scratch = self.dir.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        let path = scratch.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    /// Write an executable script outside the store.
    pub fn script(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.scratch_file(name, contents);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Instantiate a single-output derivation running `script` under
    /// `/bin/sh -e`, and store its text. The script sees `$out` and any
    /// extra environment given.
    pub fn shell_derivation(
        &mut self,
        name: &str,
        script: &str,
        input_srcs: BTreeSet<StorePath>,
        env: BTreeMap<String, String>,
    ) -> StorePath {
        self.derivation(name, &[("out", None)], script, input_srcs, env)
    }

    /// Instantiate a fixed-output derivation promising `fixed`.
    pub fn fixed_derivation(&mut self, name: &str, script: &str, fixed: FixedOutput) -> StorePath {
        self.derivation(
            name,
            &[("out", Some(fixed))],
            script,
            BTreeSet::new(),
            BTreeMap::new(),
        )
    }

    /// Instantiate a derivation with the given outputs and store its
    /// text with the proper references.
    pub fn derivation(
        &mut self,
        name: &str,
        outputs: &[(&str, Option<FixedOutput>)],
        script: &str,
        input_srcs: BTreeSet<StorePath>,
        env: BTreeMap<String, String>,
    ) -> StorePath {
        let platform = self.store.settings().platform.clone();
        let drv = Derivation::instantiate(
            self.store.store_dir(),
            name,
            outputs,
            BTreeMap::new(),
            input_srcs.clone(),
            &platform,
            "/bin/sh",
            &["-e", "-c", script],
            env,
        );
        self.add_derivation(name, drv)
    }

    /// Store a derivation's text, with its inputs as references.
    pub fn add_derivation(&mut self, name: &str, drv: Derivation) -> StorePath {
        let mut references: BTreeSet<StorePath> = drv.input_srcs.clone();
        references.extend(drv.input_drvs.keys().cloned());
        self.store
            .add_text_to_store(&format!("{name}.drv"), &drv.unparse(), &references)
            .expect("storing derivation")
    }

    /// Shorthand: read a file below a store path.
    pub fn read_output(&self, path: &StorePath) -> String {
        fs::read_to_string(path.as_path()).expect("reading build output")
    }
}
