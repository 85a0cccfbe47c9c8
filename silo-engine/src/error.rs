// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error taxonomy.
///
/// `Build` and `Subst` are per-goal failures: the scheduler reports them
/// and lets sibling goals continue under keep-going. Everything else
/// aborts the current operation.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller asked for something nonsensical.
    #[error("{0}")]
    Usage(String),

    /// An OS primitive failed.
    #[error("{context}: {source}")]
    Sys {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A builder ran but failed or produced invalid outputs.
    #[error("{0}")]
    Build(String),

    /// A substituter failed or produced nothing.
    #[error("{0}")]
    Subst(String),

    #[error(transparent)]
    Db(#[from] silo_store_db::Error),

    #[error(transparent)]
    StorePath(#[from] silo_store_core::StorePathError),

    #[error(transparent)]
    Archive(#[from] silo_store_core::archive::ArchiveError),

    #[error("invalid derivation: {0}")]
    Derivation(#[from] silo_store_core::ParseDerivationError),

    #[error("invalid hash: {0}")]
    Hash(#[from] silo_store_core::ParseHashError),

    #[error("interrupted by the user")]
    Interrupted,

    /// Corruption, invariant violations, protocol violations.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Exit code a coordinator process should report for this error:
    /// `1` for generic failures, `100` for a definite build failure (so a
    /// distributed hook can tell a bad derivation from a broken worker).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Build(_) => 100,
            _ => 1,
        }
    }
}

/// Attach a human-readable context to I/O errors.
pub trait IoContext<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Sys {
            context: f(),
            source: e,
        })
    }
}

impl<T> IoContext<T> for std::result::Result<T, nix::errno::Errno> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Sys {
            context: f(),
            source: std::io::Error::from(e),
        })
    }
}
