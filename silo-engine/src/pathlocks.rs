// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! Inter-process locks on store paths.
//!
//! Each store path `<path>` is guarded by an exclusive `flock()` on a
//! `<path>.lock` side file, so multiple coordinators can cooperate
//! without sharing memory. A whole set is acquired in sorted path order
//! (all or nothing); distinct processes therefore never acquire two sets
//! in conflicting orders. The OS releases the locks if the process dies.
//!
//! Once the guarded path is known to be valid, the lock files are marked
//! for deletion on release: future lockers will re-check validity and
//! never block on a stale file.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, IoContext, Result};

struct LockFile {
    lock_path: PathBuf,
    flock: Option<Flock<File>>,
}

/// An acquired set of path locks, released (and optionally deleted) on
/// drop.
pub struct PathLocks {
    locks: Vec<LockFile>,
    delete_on_release: bool,
}

impl PathLocks {
    /// Acquire exclusive locks on every path in `paths` (blocking).
    ///
    /// Paths are locked in sorted order; on any failure the locks taken
    /// so far are released before the error is returned.
    pub fn lock<'a, I>(paths: I) -> Result<PathLocks>
    where
        I: IntoIterator<Item = &'a Path>,
    {
        let sorted: BTreeSet<&Path> = paths.into_iter().collect();
        let mut locks = Vec::with_capacity(sorted.len());

        for path in sorted {
            let lock_path = PathBuf::from(format!("{}.lock", path.display()));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .io_context(|| format!("creating lock file `{}`", lock_path.display()))?;

            let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
                Error::Sys {
                    context: format!("locking `{}`", lock_path.display()),
                    source: std::io::Error::from(errno),
                }
            })?;

            locks.push(LockFile {
                lock_path,
                flock: Some(flock),
            });
        }

        Ok(PathLocks {
            locks,
            delete_on_release: false,
        })
    }

    /// Delete the lock files when this set is released. Only safe once
    /// the guarded paths are registered valid.
    pub fn set_deletion(&mut self, delete: bool) {
        self.delete_on_release = delete;
    }
}

impl Drop for PathLocks {
    fn drop(&mut self) {
        for lock in &mut self.locks {
            if self.delete_on_release {
                // Unlink while still holding the lock: a blocked locker
                // wakes up on a file that no longer exists and retries.
                let _ = std::fs::remove_file(&lock.lock_path);
            }
            lock.flock.take();
        }
    }
}
