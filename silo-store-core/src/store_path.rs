// SPDX-License-Identifier: MIT

//! Store directories and store paths.
//!
//! A store path is `<storeDir>/<digest>-<name>` where `<digest>` is a
//! 32-character base-32 rendering of a 160-bit hash of a canonical naming
//! string. The name is purely for humans; the digest alone guarantees
//! uniqueness. [`StoreDir::make_store_path`] is the single place that
//! naming string is assembled, so two inputs differing in type, content
//! hash, store directory or name can never collide.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::base32;
use crate::hash::{hash_bytes, Hash, HashAlgo};

/// Length of the digest part of a store path basename.
pub const HASH_PART_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum StorePathError {
    #[error("store directory `{0}` is not an absolute path")]
    StoreDirNotAbsolute(PathBuf),

    #[error("path `{0}` is not in the store")]
    NotInStore(String),

    #[error("path `{0}` is not a store path")]
    NotAStorePath(String),

    #[error("store path name `{0}` is malformed")]
    BadName(String),
}

/// The absolute directory under which every store path lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDir {
    dir: String,
}

impl StoreDir {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StorePathError> {
        let dir = dir.as_ref();
        if !dir.is_absolute() {
            return Err(StorePathError::StoreDirNotAbsolute(dir.to_owned()));
        }
        let mut dir = dir.to_string_lossy().into_owned();
        while dir.len() > 1 && dir.ends_with('/') {
            dir.pop();
        }
        Ok(StoreDir { dir })
    }

    pub fn as_str(&self) -> &str {
        &self.dir
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.dir)
    }

    /// The deterministic path-naming function.
    ///
    /// Hashes `"{type}:sha256:{hex}:{storeDir}:{name}"`, folds the digest
    /// to 20 bytes and renders it in base-32. `type` is `"source"` for
    /// imported trees, `"text"` for literal texts, and `"output:<name>"`
    /// for derivation outputs.
    pub fn make_store_path(&self, type_: &str, hash: &Hash, name: &str) -> StorePath {
        let fingerprint = format!(
            "{}:sha256:{}:{}:{}",
            type_,
            hash.to_hex(),
            self.dir,
            name
        );
        let digest = hash_bytes(HashAlgo::Sha256, &fingerprint).compress(20);
        StorePath(format!("{}/{}-{}", self.dir, base32::encode(&digest), name))
    }

    /// Name the output `output_name` of a derivation whose canonical text
    /// hashes to `drv_hash`.
    pub fn make_output_path(&self, output_name: &str, drv_hash: &Hash, drv_name: &str) -> StorePath {
        self.make_store_path(&format!("output:{output_name}"), drv_hash, drv_name)
    }

    /// Name the single output of a fixed-output derivation. The name
    /// depends only on the promised content hash, so fixing a broken
    /// builder leaves the output path unchanged.
    pub fn make_fixed_output_path(&self, algo: HashAlgo, hash: &Hash, drv_name: &str) -> StorePath {
        let inner = hash_bytes(
            HashAlgo::Sha256,
            format!("fixed:out:{algo}:{}:", hash.to_hex()),
        );
        self.make_store_path("output:out", &inner, drv_name)
    }

    /// Is `path` inside the store directory (possibly below a store path)?
    pub fn is_in_store(&self, path: &str) -> bool {
        path.starts_with(&self.dir)
            && path.len() > self.dir.len() + 1
            && path.as_bytes()[self.dir.len()] == b'/'
    }

    /// Is `path` a direct child of the store directory with a well-formed
    /// basename?
    pub fn is_store_path(&self, path: &str) -> bool {
        self.parse(path).is_ok()
    }

    /// Parse and validate an absolute path as a store path.
    pub fn parse(&self, path: &str) -> Result<StorePath, StorePathError> {
        if !self.is_in_store(path) {
            return Err(StorePathError::NotInStore(path.to_string()));
        }
        let base = &path[self.dir.len() + 1..];
        if base.contains('/') {
            return Err(StorePathError::NotAStorePath(path.to_string()));
        }
        if base.len() < HASH_PART_LEN + 2
            || base.as_bytes()[HASH_PART_LEN] != b'-'
            || !base32::is_valid(&base[..HASH_PART_LEN])
        {
            return Err(StorePathError::BadName(base.to_string()));
        }
        Ok(StorePath(path.to_string()))
    }

    /// Truncate a path below a store path to the store path itself.
    pub fn to_store_path(&self, path: &str) -> Result<StorePath, StorePathError> {
        if !self.is_in_store(path) {
            return Err(StorePathError::NotInStore(path.to_string()));
        }
        match path[self.dir.len() + 1..].find('/') {
            None => self.parse(path),
            Some(slash) => self.parse(&path[..self.dir.len() + 1 + slash]),
        }
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir)
    }
}

/// A validated absolute store path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath(String);

impl StorePath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Basename, `<digest>-<name>`.
    pub fn base_name(&self) -> &str {
        self.0.rsplit_once('/').map(|(_, b)| b).unwrap_or(&self.0)
    }

    /// The 32-character digest part of the basename. This is the needle
    /// reference scanning looks for in built outputs.
    pub fn hash_part(&self) -> &str {
        &self.base_name()[..HASH_PART_LEN]
    }

    /// The human-readable name part of the basename.
    pub fn name(&self) -> &str {
        &self.base_name()[HASH_PART_LEN + 1..]
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<Path> for StorePath {
    fn as_ref(&self) -> &Path {
        self.as_path()
    }
}
