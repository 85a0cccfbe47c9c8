// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! Garbage-collector roots.
//!
//! Two kinds of root guard live paths:
//!
//! - *Temporary roots* protect paths while this process is realising
//!   them. Each coordinator appends to its own
//!   `<state>/temproots/<pid>` file under an exclusive lock; a collector
//!   treats every path listed in a live process's file as reachable. The
//!   file is removed when the process exits cleanly and is stale (its
//!   lock is free) after a crash.
//! - *Permanent roots* are symlinks under `<state>/gcroots/auto`, named
//!   by a digest of the target so re-adding a root is idempotent.
//!   Dangling links are pruned during enumeration.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;

use nix::fcntl::{Flock, FlockArg};
use silo_store_core::hash::{hash_bytes, HashAlgo};
use silo_store_core::StorePath;

use crate::config::Settings;
use crate::error::{Error, IoContext, Result};

pub struct GcRoots {
    temproots_dir: PathBuf,
    auto_roots_dir: PathBuf,
    /// Lazily created per-process temp roots file, held locked so a
    /// concurrent collector can tell this process is alive.
    temp_file: Option<Flock<File>>,
}

impl GcRoots {
    pub fn open(settings: &Settings) -> Result<GcRoots> {
        let temproots_dir = settings.state_dir.join("temproots");
        let auto_roots_dir = settings.state_dir.join("gcroots").join("auto");
        for dir in [&temproots_dir, &auto_roots_dir] {
            fs::create_dir_all(dir)
                .io_context(|| format!("creating `{}`", dir.display()))?;
        }
        Ok(GcRoots {
            temproots_dir,
            auto_roots_dir,
            temp_file: None,
        })
    }

    fn temp_roots_path(&self) -> PathBuf {
        self.temproots_dir.join(std::process::id().to_string())
    }

    /// Record `path` as live for the lifetime of this process.
    pub fn add_temp_root(&mut self, path: &StorePath) -> Result<()> {
        if self.temp_file.is_none() {
            let temp_path = self.temp_roots_path();
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&temp_path)
                .io_context(|| format!("creating `{}`", temp_path.display()))?;
            let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
                Error::Sys {
                    context: format!("locking `{}`", temp_path.display()),
                    source: std::io::Error::from(errno),
                }
            })?;
            self.temp_file = Some(flock);
        }

        let file = self.temp_file.as_mut().expect("temp roots file just opened");
        writeln!(file, "{path}")
            .io_context(|| format!("writing temp root for `{path}`"))?;
        file.flush()
            .io_context(|| "flushing temp roots".to_string())?;
        Ok(())
    }

    /// Register a permanent root keeping `path` alive across processes.
    pub fn add_auto_root(&mut self, path: &StorePath) -> Result<PathBuf> {
        let digest = hash_bytes(HashAlgo::Sha256, path.as_str()).compress(20);
        let link = self
            .auto_roots_dir
            .join(silo_store_core::base32::encode(&digest));
        match std::os::unix::fs::symlink(path.as_path(), &link) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(Error::Sys {
                    context: format!("creating root link `{}`", link.display()),
                    source: e,
                })
            }
        }
        Ok(link)
    }

    /// Drop the permanent root for `path`, if any.
    pub fn remove_auto_root(&mut self, path: &StorePath) -> Result<()> {
        let digest = hash_bytes(HashAlgo::Sha256, path.as_str()).compress(20);
        let link = self
            .auto_roots_dir
            .join(silo_store_core::base32::encode(&digest));
        match fs::remove_file(&link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Sys {
                context: format!("removing root link `{}`", link.display()),
                source: e,
            }),
        }
    }

    /// Enumerate permanent roots, pruning links whose target vanished.
    pub fn find_roots(&mut self) -> Result<Vec<(PathBuf, PathBuf)>> {
        let mut roots = Vec::new();
        for entry in fs::read_dir(&self.auto_roots_dir)
            .io_context(|| format!("reading `{}`", self.auto_roots_dir.display()))?
        {
            let entry = entry
                .io_context(|| format!("reading `{}`", self.auto_roots_dir.display()))?;
            let link = entry.path();
            let target = match fs::read_link(&link) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if target.exists() {
                roots.push((link, target));
            } else {
                tracing::debug!("removing dangling root link `{}`", link.display());
                let _ = fs::remove_file(&link);
            }
        }
        Ok(roots)
    }

    /// Paths every live coordinator currently protects.
    pub fn read_temp_roots(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.temproots_dir)
            .io_context(|| format!("reading `{}`", self.temproots_dir.display()))?
        {
            let entry =
                entry.io_context(|| format!("reading `{}`", self.temproots_dir.display()))?;
            let contents = match fs::read_to_string(entry.path()) {
                Ok(c) => c,
                Err(_) => continue,
            };
            paths.extend(contents.lines().map(str::to_owned));
        }
        Ok(paths)
    }

    fn cleanup(&mut self) -> std::io::Result<()> {
        if self.temp_file.take().is_some() {
            fs::remove_file(self.temp_roots_path())?;
        }
        Ok(())
    }
}

impl Drop for GcRoots {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!("failed to remove temp roots file: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_store_core::StoreDir;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Settings, StoreDir) {
        let settings = Settings {
            state_dir: dir.path().join("state"),
            store_dir: dir.path().join("store"),
            ..Settings::default()
        };
        let store_dir = StoreDir::new(&settings.store_dir).unwrap();
        (settings, store_dir)
    }

    fn some_path(store_dir: &StoreDir, seed: &str) -> StorePath {
        store_dir.make_store_path("source", &hash_bytes(HashAlgo::Sha256, seed), "pkg")
    }

    #[test]
    fn temp_roots_are_recorded_and_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let (settings, store_dir) = setup(&dir);
        let p = some_path(&store_dir, "a");

        let mut roots = GcRoots::open(&settings).unwrap();
        roots.add_temp_root(&p).unwrap();
        assert_eq!(roots.read_temp_roots().unwrap(), vec![p.to_string()]);

        drop(roots);
        let roots = GcRoots::open(&settings).unwrap();
        assert!(roots.read_temp_roots().unwrap().is_empty());
    }

    #[test]
    fn auto_roots_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let (settings, store_dir) = setup(&dir);
        let p = some_path(&store_dir, "a");
        fs::create_dir_all(p.as_path()).unwrap();

        let mut roots = GcRoots::open(&settings).unwrap();
        let link1 = roots.add_auto_root(&p).unwrap();
        let link2 = roots.add_auto_root(&p).unwrap();
        assert_eq!(link1, link2);
        assert_eq!(roots.find_roots().unwrap().len(), 1);

        roots.remove_auto_root(&p).unwrap();
        assert!(roots.find_roots().unwrap().is_empty());
    }

    #[test]
    fn dangling_auto_roots_are_pruned() {
        let dir = TempDir::new().unwrap();
        let (settings, store_dir) = setup(&dir);
        let p = some_path(&store_dir, "missing");

        let mut roots = GcRoots::open(&settings).unwrap();
        let link = roots.add_auto_root(&p).unwrap();
        assert!(roots.find_roots().unwrap().is_empty());
        assert!(!link.exists());
    }
}
