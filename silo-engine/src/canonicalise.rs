// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! Path metadata canonicalisation.
//!
//! Before a tree is hashed or registered, its metadata is normalized so
//! the content hash only depends on what the archive codec serializes:
//! non-symlink entries get mode `0444` (or `0555` when owner-executable),
//! ownership of the current user, and an mtime of epoch zero. Symlinks
//! carry no independent metadata and are left alone.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use nix::unistd::{chown, getegid, geteuid};

use crate::error::{IoContext, Result};
use crate::interrupt::check_interrupt;

/// Set mtime without following symlinks, leaving atime untouched.
#[allow(unsafe_code)]
fn set_mtime(path: &Path, seconds: i64) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let times = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        libc::timespec {
            tv_sec: seconds,
            tv_nsec: 0,
        },
    ];
    // SAFETY: c_path is a valid NUL-terminated string and times points at
    // a two-element array living on the stack for the duration of the
    // call.
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Canonicalise metadata of `path` and everything below it.
pub fn canonicalise_path_metadata(path: &Path) -> Result<()> {
    check_interrupt()?;

    let meta = fs::symlink_metadata(path)
        .io_context(|| format!("getting attributes of `{}`", path.display()))?;

    if !meta.is_symlink() {
        let mode = meta.permissions().mode() & 0o7777;
        let target = 0o444 | if mode & 0o100 != 0 { 0o111 } else { 0 };
        if mode != target {
            fs::set_permissions(path, fs::Permissions::from_mode(target))
                .io_context(|| format!("changing mode of `{}` to {target:o}", path.display()))?;
        }

        chown(path, Some(geteuid()), Some(getegid()))
            .io_context(|| format!("changing owner of `{}`", path.display()))?;

        set_mtime(path, 0)
            .io_context(|| format!("changing modification time of `{}`", path.display()))?;
    }

    if meta.is_dir() {
        for entry in
            fs::read_dir(path).io_context(|| format!("reading directory `{}`", path.display()))?
        {
            let entry = entry.io_context(|| format!("reading directory `{}`", path.display()))?;
            canonicalise_path_metadata(&entry.path())?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt as _;
    use tempfile::TempDir;

    #[test]
    fn plain_file_becomes_0444_with_mtime_zero() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, "data").unwrap();
        fs::set_permissions(&f, fs::Permissions::from_mode(0o664)).unwrap();

        canonicalise_path_metadata(&f).unwrap();

        let meta = fs::metadata(&f).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o444);
        assert_eq!(meta.mtime(), 0);
    }

    #[test]
    fn executable_file_becomes_0555() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("run");
        fs::write(&f, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&f, fs::Permissions::from_mode(0o744)).unwrap();

        canonicalise_path_metadata(&f).unwrap();

        let mode = fs::metadata(&f).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o555);
    }

    #[test]
    fn recurses_into_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("inner"), "x").unwrap();

        canonicalise_path_metadata(&root).unwrap();

        assert_eq!(
            fs::metadata(root.join("inner")).unwrap().permissions().mode() & 0o7777,
            0o444
        );
        assert_eq!(fs::metadata(&root).unwrap().mtime(), 0);
    }

    #[test]
    fn symlinks_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink("nowhere", root.join("link")).unwrap();

        // Must not fail on the dangling symlink, and must not try to
        // chmod through it.
        canonicalise_path_metadata(&root).unwrap();
        assert!(root.join("link").symlink_metadata().unwrap().is_symlink());
    }
}
