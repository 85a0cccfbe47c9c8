// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! The local store: on-disk artifacts plus their metadata.
//!
//! [`LocalStore`] ties together the store directory, the metadata
//! database, path locks and GC roots, and exposes the operation set the
//! rest of the engine builds on: importing sources, registering and
//! invalidating valid paths, substitute bookkeeping, closure computation,
//! and store verification. The scheduler (see [`crate::worker`]) drives
//! builds and substitutions through it.

use std::collections::BTreeSet;
use std::fs;
use std::io::{Seek as _, SeekFrom};
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};

use silo_store_core::archive;
use silo_store_core::hash::{Hash, HashAlgo};
use silo_store_core::{Derivation, StoreDir, StorePath};
use silo_store_db::{MetaDb, MetaTxn, OpenMode, Substitute, TableId};
use tracing::{debug, error};

use crate::canonicalise::canonicalise_path_metadata;
use crate::config::Settings;
use crate::error::{Error, IoContext, Result};
use crate::gcroots::GcRoots;
use crate::interrupt::check_interrupt;
use crate::pathlocks::PathLocks;
use crate::worker::Worker;

#[derive(Clone, Copy)]
pub(crate) struct Tables {
    pub valid: TableId,
    pub references: TableId,
    pub referrers: TableId,
    pub substitutes: TableId,
    pub derivers: TableId,
}

/// Everything needed to register one valid path.
#[derive(Debug, Clone)]
pub struct RegisterPathParams {
    pub path: StorePath,
    /// Content hash of the canonicalized on-disk tree.
    pub hash: Hash,
    pub references: BTreeSet<StorePath>,
    /// Derivation that produced this path; `None` for imported sources.
    pub deriver: Option<StorePath>,
}

pub struct LocalStore {
    settings: Settings,
    store_dir: StoreDir,
    db: MetaDb,
    tables: Tables,
    gc_roots: Option<GcRoots>,
}

impl LocalStore {
    /// Open the store described by `settings`, creating directories and a
    /// fresh metadata database as needed. Falls back to read-only when
    /// the database cannot be opened for writing.
    pub fn open(settings: Settings) -> Result<LocalStore> {
        let store_dir = StoreDir::new(&settings.store_dir)?;

        let db = MetaDb::open(&settings.db_dir, OpenMode::Auto).or_else(|e| {
            // A store on read-only media may not even allow creating the
            // database directory; retry strictly read-only.
            debug!("retrying metadata store read-only: {e}");
            MetaDb::open(&settings.db_dir, OpenMode::ReadOnly)
        })?;

        if !db.is_read_only() {
            for dir in [&settings.store_dir, &settings.log_dir] {
                fs::create_dir_all(dir)
                    .io_context(|| format!("creating `{}`", dir.display()))?;
            }
        }

        if !settings.ignore_symlink_store && settings.store_dir.exists() {
            let resolved = settings
                .store_dir
                .canonicalize()
                .io_context(|| format!("resolving `{}`", settings.store_dir.display()))?;
            if resolved != settings.store_dir {
                return Err(Error::Usage(format!(
                    "the store directory `{}` is reached through symlinks; this would break \
                     the deterministic path naming (set NIX_IGNORE_SYMLINK_STORE to override)",
                    settings.store_dir.display()
                )));
            }
        }

        let mut db = db;
        let tables = Tables {
            valid: db.open_table("validpaths")?,
            references: db.open_table("references")?,
            referrers: db.open_table("referrers")?,
            substitutes: db.open_table("substitutes")?,
            derivers: db.open_table("derivers")?,
        };

        let gc_roots = if db.is_read_only() {
            None
        } else {
            Some(GcRoots::open(&settings)?)
        };

        Ok(LocalStore {
            settings,
            store_dir,
            db,
            tables,
            gc_roots,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    pub fn is_read_only(&self) -> bool {
        self.db.is_read_only()
    }

    /// Per-derivation build log location: `<logDir>/<drv-basename>`.
    pub fn log_file_for(&self, drv_path: &StorePath) -> PathBuf {
        self.settings.log_dir.join(drv_path.base_name())
    }

    // ----- queries (snapshot reads outside any transaction) -----

    pub fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
        Ok(self.db.get_string(self.tables.valid, path.as_str())?.is_some())
    }

    /// Registered content hash of a valid path.
    pub fn query_path_hash(&self, path: &StorePath) -> Result<Hash> {
        let Some(entry) = self.db.get_string(self.tables.valid, path.as_str())? else {
            return Err(Error::Other(format!("path `{path}` is not valid")));
        };
        Hash::parse_prefixed(&entry).map_err(|_| {
            Error::Other(format!(
                "corrupt hash `{entry}` in valid-path entry for `{path}`"
            ))
        })
    }

    pub fn has_substitutes(&self, path: &StorePath) -> Result<bool> {
        Ok(!self.query_substitutes(path)?.is_empty())
    }

    /// Usable means realisable: valid already, or producible through a
    /// substitute. Only usable paths may carry references, referrers, or
    /// deriver entries.
    pub fn is_usable_path(&self, path: &StorePath) -> Result<bool> {
        Ok(self.is_valid_path(path)? || self.has_substitutes(path)?)
    }

    pub fn query_references(&self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        if !self.is_usable_path(path)? {
            return Err(Error::Other(format!("path `{path}` is not valid")));
        }
        self.parse_path_list(self.db.get_strings(self.tables.references, path.as_str())?)
    }

    pub fn query_referrers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        if !self.is_usable_path(path)? {
            return Err(Error::Other(format!("path `{path}` is not valid")));
        }
        self.parse_path_list(self.db.get_strings(self.tables.referrers, path.as_str())?)
    }

    pub fn query_deriver(&self, path: &StorePath) -> Result<Option<StorePath>> {
        match self.db.get_string(self.tables.derivers, path.as_str())? {
            None => Ok(None),
            Some(d) => Ok(Some(self.store_dir.parse(&d)?)),
        }
    }

    pub fn query_substitutes(&self, path: &StorePath) -> Result<Vec<Substitute>> {
        decode_substitutes(self.db.get_list(self.tables.substitutes, path.as_str())?, path)
    }

    pub fn query_valid_paths(&self) -> Result<Vec<String>> {
        Ok(self.db.enumerate(self.tables.valid)?)
    }

    fn parse_path_list(&self, raw: Vec<String>) -> Result<BTreeSet<StorePath>> {
        raw.iter()
            .map(|p| self.store_dir.parse(p).map_err(Error::from))
            .collect()
    }

    /// Accumulate into `out` every path reachable from `root` over the
    /// references relation, `root` included.
    pub fn compute_fs_closure(
        &self,
        root: &StorePath,
        out: &mut BTreeSet<StorePath>,
    ) -> Result<()> {
        let mut queue = vec![root.clone()];
        while let Some(path) = queue.pop() {
            check_interrupt()?;
            if !out.insert(path.clone()) {
                continue;
            }
            for reference in self.query_references(&path)? {
                if !out.contains(&reference) {
                    queue.push(reference);
                }
            }
        }
        Ok(())
    }

    /// Parse the derivation stored at `drv_path`.
    pub fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation> {
        let text = fs::read_to_string(drv_path.as_path())
            .io_context(|| format!("reading derivation `{drv_path}`"))?;
        Ok(Derivation::parse(&self.store_dir, &text)?)
    }

    // ----- mutation -----

    pub(crate) fn begin(&mut self) -> Result<StoreTxn<'_>> {
        let LocalStore {
            db,
            tables,
            store_dir,
            ..
        } = self;
        Ok(StoreTxn {
            txn: db.transaction()?,
            tables: *tables,
            store_dir,
        })
    }

    fn add_temp_root(&mut self, path: &StorePath) -> Result<()> {
        match &mut self.gc_roots {
            Some(roots) => roots.add_temp_root(path),
            None => Err(Error::Db(silo_store_db::Error::ReadOnly)),
        }
    }

    /// Register a permanent GC root for `path`.
    pub fn add_root(&mut self, path: &StorePath) -> Result<PathBuf> {
        match &mut self.gc_roots {
            Some(roots) => roots.add_auto_root(path),
            None => Err(Error::Db(silo_store_db::Error::ReadOnly)),
        }
    }

    /// Import the tree at `src` into the store.
    ///
    /// The resulting name is a pure function of the canonicalized
    /// contents, so importing the same bytes twice yields the same path
    /// and the second call leaves the store untouched.
    ///
    /// The source tree is hashed before it is copied; a tree mutated in
    /// between is detected by re-hashing the copy and reported as an
    /// error, but the window cannot be closed from here.
    pub fn add_to_store(&mut self, src: &Path) -> Result<StorePath> {
        let src = std::path::absolute(src)
            .io_context(|| format!("resolving `{}`", src.display()))?;
        debug!("adding `{}` to the store", src.display());

        let hash = archive::hash_path(HashAlgo::Sha256, &src)?;
        let name = src
            .file_name()
            .ok_or_else(|| Error::Usage(format!("`{}` has no file name", src.display())))?
            .to_string_lossy()
            .into_owned();
        let dst = self.store_dir.make_store_path("source", &hash, &name);

        if !self.is_read_only() && !self.is_valid_path(&dst)? {
            self.add_temp_root(&dst)?;
            // The validity check above only avoids needless locking; it
            // is repeated under the lock.
            let mut lock = PathLocks::lock([dst.as_path()])?;
            if !self.is_valid_path(&dst)? {
                if dst.as_path().symlink_metadata().is_ok() {
                    delete_path(dst.as_path())?;
                }

                self.copy_path(&src, dst.as_path())?;

                let copied = archive::hash_path(HashAlgo::Sha256, dst.as_path())?;
                if copied != hash {
                    return Err(Error::Other(format!(
                        "contents of `{}` changed while copying it to `{dst}` ({hash} -> {copied})",
                        src.display()
                    )));
                }

                canonicalise_path_metadata(dst.as_path())?;

                let txn = self.begin()?;
                txn.register_valid_path(&RegisterPathParams {
                    path: dst.clone(),
                    hash,
                    references: BTreeSet::new(),
                    deriver: None,
                })?;
                txn.commit()?;
            }
            lock.set_deletion(true);
        }

        Ok(dst)
    }

    /// Store a literal text under `name`, with pre-declared references.
    pub fn add_text_to_store(
        &mut self,
        name: &str,
        text: &str,
        references: &BTreeSet<StorePath>,
    ) -> Result<StorePath> {
        let text_hash = silo_store_core::hash::hash_bytes(HashAlgo::Sha256, text);
        let dst = self.store_dir.make_store_path("text", &text_hash, name);

        if !self.is_read_only() && !self.is_valid_path(&dst)? {
            self.add_temp_root(&dst)?;
            let mut lock = PathLocks::lock([dst.as_path()])?;
            if !self.is_valid_path(&dst)? {
                if dst.as_path().symlink_metadata().is_ok() {
                    delete_path(dst.as_path())?;
                }

                fs::write(dst.as_path(), text)
                    .io_context(|| format!("writing `{dst}`"))?;
                canonicalise_path_metadata(dst.as_path())?;

                let content_hash = archive::hash_path(HashAlgo::Sha256, dst.as_path())?;
                let txn = self.begin()?;
                txn.register_valid_path(&RegisterPathParams {
                    path: dst.clone(),
                    hash: content_hash,
                    references: references.clone(),
                    deriver: None,
                })?;
                txn.commit()?;
            }
            lock.set_deletion(true);
        }

        Ok(dst)
    }

    /// Invalidate `path` and delete it from disk.
    ///
    /// Refused while any *other* valid path still references it; a
    /// self-reference does not keep a path alive.
    pub fn delete_from_store(&mut self, path: &StorePath) -> Result<()> {
        let txn = self.begin()?;
        if txn.is_valid(path)? {
            let referrers = txn.referrers(path)?;
            if referrers.iter().any(|r| r.as_str() != path.as_str()) {
                return Err(Error::Other(format!(
                    "cannot delete path `{path}` because it is in use"
                )));
            }
            txn.invalidate(path)?;
        }
        txn.commit()?;

        if path.as_path().symlink_metadata().is_ok() {
            delete_path(path.as_path())?;
        }
        Ok(())
    }

    /// Record a substitute for `path`. Re-registering an equivalent
    /// substitute moves it to the front of the list.
    pub fn register_substitute(&mut self, path: &StorePath, sub: &Substitute) -> Result<()> {
        let txn = self.begin()?;
        txn.register_substitute(path, sub)?;
        txn.commit()?;
        Ok(())
    }

    /// Drop all substitute registrations.
    pub fn clear_substitutes(&mut self) -> Result<()> {
        let txn = self.begin()?;
        for key in txn.txn.enumerate(txn.tables.substitutes)? {
            txn.txn.delete(txn.tables.substitutes, &key)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Register a batch of already-present paths in one transaction.
    pub fn register_valid_paths(&mut self, items: &[RegisterPathParams]) -> Result<()> {
        let txn = self.begin()?;
        txn.register_valid_paths(items)?;
        txn.commit()?;
        Ok(())
    }

    /// Make `path` valid by substitution, if it isn't already.
    pub fn ensure_path(&mut self, path: &StorePath) -> Result<()> {
        if self.is_valid_path(path)? {
            return Ok(());
        }
        let mut worker = Worker::new(self);
        let goal = worker.make_substitution_goal(path.clone());
        if worker.run(&[goal])? {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "path `{path}` does not exist and cannot be created"
            )))
        }
    }

    /// Realise the outputs of the given derivations.
    pub fn build_derivations(&mut self, drv_paths: &[StorePath]) -> Result<()> {
        debug!("building {}", show_paths(drv_paths.iter()));
        let mut worker = Worker::new(self);
        let goals: Vec<_> = drv_paths
            .iter()
            .map(|p| worker.make_derivation_goal(p.clone()))
            .collect();
        if worker.run(&goals)? {
            return Ok(());
        }
        let failures = worker.take_failures();
        drop(worker);
        let mut message = format!("build of {} failed", show_paths(drv_paths.iter()));
        for failure in failures {
            message.push_str("\n  ");
            message.push_str(&failure);
        }
        Err(Error::Build(message))
    }

    /// Copy a tree through the canonical serialization, so the copy holds
    /// exactly what the archive codec sees.
    pub(crate) fn copy_path(&self, src: &Path, dst: &Path) -> Result<()> {
        debug!("copying `{}` to `{}`", src.display(), dst.display());
        let mut spool = tempfile::tempfile()
            .io_context(|| "creating spool file for copy".to_string())?;
        archive::dump_path(src, &mut spool)?;
        spool
            .seek(SeekFrom::Start(0))
            .io_context(|| "rewinding spool file".to_string())?;
        archive::restore_path(dst, &mut spool)?;
        Ok(())
    }

    /// Check the store invariants, repairing what can be repaired and
    /// reporting everything found. With `check_contents`, also re-hash
    /// every valid path on disk.
    pub fn verify(&mut self, check_contents: bool) -> Result<Vec<String>> {
        let mut issues = Vec::new();
        let txn = self.begin()?;
        let t = txn.tables;

        let mut valid: BTreeSet<String> = BTreeSet::new();
        for key in txn.txn.enumerate(t.valid)? {
            check_interrupt()?;
            let parsed = txn.store_dir.parse(&key);
            if parsed.is_err() {
                issues.push(format!("valid-path entry `{key}` is not a store path"));
                txn.txn.delete(t.valid, &key)?;
                txn.txn.delete(t.references, &key)?;
                txn.txn.delete(t.derivers, &key)?;
            } else if !Path::new(&key).exists() {
                issues.push(format!("path `{key}` disappeared"));
                let path = parsed.expect("checked above");
                txn.invalidate(&path)?;
            } else {
                if check_contents {
                    let expected = txn
                        .txn
                        .get_string(t.valid, &key)?
                        .expect("enumerated key exists");
                    match Hash::parse_prefixed(&expected) {
                        Err(_) => issues.push(format!(
                            "corrupt hash `{expected}` in valid-path entry for `{key}`"
                        )),
                        Ok(expected) => {
                            let actual =
                                archive::hash_path(expected.algo(), Path::new(&key))?;
                            if actual != expected {
                                issues.push(format!(
                                    "path `{key}` was modified! expected hash `{expected}`, got `{actual}`"
                                ));
                            }
                        }
                    }
                }
                valid.insert(key);
            }
        }

        // Usable = valid or substitutable.
        let mut usable = valid.clone();
        for key in txn.txn.enumerate(t.substitutes)? {
            check_interrupt()?;
            if txn.store_dir.parse(&key).is_err() {
                issues.push(format!("found substitutes for non-store path `{key}`"));
                txn.txn.delete(t.substitutes, &key)?;
                continue;
            }
            let subs = txn.txn.get_list(t.substitutes, &key)?;
            let decoded: Vec<_> = subs
                .iter()
                .filter_map(|rec| Substitute::decode(rec).ok().flatten())
                .collect();
            if decoded.is_empty() {
                txn.txn.delete(t.substitutes, &key)?;
            } else {
                usable.insert(key);
            }
        }

        for key in txn.txn.enumerate(t.derivers)? {
            check_interrupt()?;
            if !usable.contains(&key) {
                issues.push(format!("found deriver entry for unusable path `{key}`"));
                txn.txn.delete(t.derivers, &key)?;
            } else {
                let deriver = txn.txn.get_string(t.derivers, &key)?.unwrap_or_default();
                if txn.store_dir.parse(&deriver).is_err() {
                    issues.push(format!("found corrupt deriver `{deriver}` for `{key}`"));
                    txn.txn.delete(t.derivers, &key)?;
                }
            }
        }

        for key in txn.txn.enumerate(t.references)? {
            check_interrupt()?;
            if !usable.contains(&key) {
                issues.push(format!("found references entry for unusable path `{key}`"));
                txn.txn.delete(t.references, &key)?;
                continue;
            }
            let is_valid = valid.contains(&key);
            for reference in txn.txn.get_strings(t.references, &key)? {
                let referrers = txn.txn.get_strings(t.referrers, &reference)?;
                if !referrers.contains(&key) {
                    issues.push(format!(
                        "missing referrer mapping from `{reference}` to `{key}`"
                    ));
                }
                if is_valid && !valid.contains(&reference) {
                    issues.push(format!(
                        "incomplete closure: `{key}` needs missing `{reference}`"
                    ));
                }
            }
        }

        for key in txn.txn.enumerate(t.referrers)? {
            check_interrupt()?;
            if !usable.contains(&key) {
                issues.push(format!("found referrers entry for unusable path `{key}`"));
                txn.txn.delete(t.referrers, &key)?;
                continue;
            }
            for referrer in txn.txn.get_strings(t.referrers, &key)? {
                let references = txn.txn.get_strings(t.references, &referrer)?;
                if !references.contains(&key) {
                    issues.push(format!(
                        "missing reference mapping from `{referrer}` to `{key}`"
                    ));
                }
            }
        }

        txn.commit()?;

        for issue in &issues {
            error!("{issue}");
        }
        Ok(issues)
    }
}

fn decode_substitutes(records: Vec<Vec<u8>>, path: &StorePath) -> Result<Vec<Substitute>> {
    let mut subs = Vec::with_capacity(records.len());
    for record in records {
        match Substitute::decode(&record) {
            Ok(Some(sub)) => subs.push(sub),
            Ok(None) => {} // foreign version, skip
            Err(reason) => {
                return Err(Error::Other(format!(
                    "malformed substitute for `{path}`: {reason}"
                )))
            }
        }
    }
    Ok(subs)
}

/// A transaction over the store's metadata, maintaining the forward and
/// reverse reference edges together.
pub(crate) struct StoreTxn<'a> {
    pub(crate) txn: MetaTxn<'a>,
    pub(crate) tables: Tables,
    pub(crate) store_dir: &'a StoreDir,
}

impl StoreTxn<'_> {
    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }

    pub fn is_valid(&self, path: &StorePath) -> Result<bool> {
        Ok(self.txn.get_string(self.tables.valid, path.as_str())?.is_some())
    }

    fn has_substitutes(&self, path: &StorePath) -> Result<bool> {
        Ok(!self.txn.get_list(self.tables.substitutes, path.as_str())?.is_empty())
    }

    fn is_usable(&self, path: &StorePath) -> Result<bool> {
        Ok(self.is_valid(path)? || self.has_substitutes(path)?)
    }

    pub fn referrers(&self, path: &StorePath) -> Result<Vec<String>> {
        Ok(self.txn.get_strings(self.tables.referrers, path.as_str())?)
    }

    /// Replace the outgoing references of `path`, updating the reverse
    /// edges of everything gained or lost.
    pub fn set_references(&self, path: &StorePath, references: &BTreeSet<StorePath>) -> Result<()> {
        if !self.is_usable(path)? {
            return Err(Error::Other(format!(
                "cannot set references for path `{path}` which is invalid and has no substitutes"
            )));
        }

        let old: BTreeSet<String> = self
            .txn
            .get_strings(self.tables.references, path.as_str())?
            .into_iter()
            .collect();
        let new: BTreeSet<String> = references.iter().map(|r| r.to_string()).collect();

        if new.is_empty() {
            self.txn.delete(self.tables.references, path.as_str())?;
        } else {
            let list: Vec<&str> = new.iter().map(String::as_str).collect();
            self.txn.put_strings(self.tables.references, path.as_str(), &list)?;
        }

        for gained in new.difference(&old) {
            self.edit_referrers(gained, |set| {
                set.insert(path.to_string());
            })?;
        }
        for lost in old.difference(&new) {
            self.edit_referrers(lost, |set| {
                set.remove(path.as_str());
            })?;
        }

        Ok(())
    }

    fn edit_referrers(
        &self,
        key: &str,
        edit: impl FnOnce(&mut BTreeSet<String>),
    ) -> Result<()> {
        let mut referrers: BTreeSet<String> = self
            .txn
            .get_strings(self.tables.referrers, key)?
            .into_iter()
            .collect();
        edit(&mut referrers);
        if referrers.is_empty() {
            self.txn.delete(self.tables.referrers, key)?;
        } else {
            let list: Vec<&str> = referrers.iter().map(String::as_str).collect();
            self.txn.put_strings(self.tables.referrers, key, &list)?;
        }
        Ok(())
    }

    pub fn set_deriver(&self, path: &StorePath, deriver: &StorePath) -> Result<()> {
        if !self.is_usable(path)? {
            return Err(Error::Other(format!("path `{path}` is not valid")));
        }
        self.txn
            .put_string(self.tables.derivers, path.as_str(), deriver.as_str())?;
        Ok(())
    }

    pub fn register_valid_path(&self, info: &RegisterPathParams) -> Result<()> {
        self.register_valid_paths(std::slice::from_ref(info))
    }

    /// Register a set of paths as one atomic step.
    ///
    /// Hashes are written first so that mutually-referencing outputs of
    /// one derivation can all be registered in a single transaction; the
    /// closure invariant is checked at the end over the combined state.
    pub fn register_valid_paths(&self, items: &[RegisterPathParams]) -> Result<()> {
        for info in items {
            debug!("registering path `{}`", info.path);
            self.txn.put_string(
                self.tables.valid,
                info.path.as_str(),
                &info.hash.to_prefixed(),
            )?;
        }

        for info in items {
            self.set_references(&info.path, &info.references)?;
            if let Some(deriver) = &info.deriver {
                self.set_deriver(&info.path, deriver)?;
            }
        }

        for info in items {
            for reference in &info.references {
                if !self.is_valid(reference)? {
                    return Err(Error::Other(format!(
                        "cannot register path `{}` as valid, since its reference `{reference}` is invalid",
                        info.path
                    )));
                }
            }
        }

        Ok(())
    }

    /// Unregister a valid path. The caller is responsible for checking
    /// referrers. References and deriver survive only while substitutes
    /// remain (the cleanup invariant).
    pub fn invalidate(&self, path: &StorePath) -> Result<()> {
        debug!("unregistering path `{path}`");
        if !self.has_substitutes(path)? {
            self.set_references(path, &BTreeSet::new())?;
            self.txn.delete(self.tables.derivers, path.as_str())?;
        }
        self.txn.delete(self.tables.valid, path.as_str())?;
        Ok(())
    }

    pub fn substitutes(&self, path: &StorePath) -> Result<Vec<Substitute>> {
        decode_substitutes(self.txn.get_list(self.tables.substitutes, path.as_str())?, path)
    }

    pub fn register_substitute(&self, path: &StorePath, sub: &Substitute) -> Result<()> {
        let mut subs = self.substitutes(path)?;
        subs.retain(|s| !s.same_command(sub));
        subs.insert(0, sub.clone());
        let records: Vec<Vec<u8>> = subs.iter().map(Substitute::encode).collect();
        self.txn
            .put_list(self.tables.substitutes, path.as_str(), &records)?;
        Ok(())
    }
}

/// Recursively delete `path`, restoring write permission where
/// canonicalisation removed it.
pub(crate) fn delete_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::Sys {
                context: format!("getting attributes of `{}`", path.display()),
                source: e,
            })
        }
    };

    if meta.is_dir() {
        let mode = meta.permissions().mode();
        if mode & 0o700 != 0o700 {
            fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700))
                .io_context(|| format!("making `{}` writable", path.display()))?;
        }
        for entry in
            fs::read_dir(path).io_context(|| format!("reading directory `{}`", path.display()))?
        {
            let entry =
                entry.io_context(|| format!("reading directory `{}`", path.display()))?;
            delete_path(&entry.path())?;
        }
        fs::remove_dir(path).io_context(|| format!("removing directory `{}`", path.display()))
    } else {
        fs::remove_file(path).io_context(|| format!("removing `{}`", path.display()))
    }
}

/// Render a path list for error messages: `` `a', `b' ``.
pub(crate) fn show_paths<'a>(paths: impl Iterator<Item = &'a StorePath>) -> String {
    let mut out = String::new();
    for path in paths {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push('`');
        out.push_str(path.as_str());
        out.push('\'');
    }
    out
}
