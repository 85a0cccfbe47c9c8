// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot open metadata database at {path}: {source}")]
    DatabaseOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("the metadata store is read-only")]
    ReadOnly,

    #[error("store schema is version {found}, but only {supported} is supported")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("store uses unsupported legacy schema version {found}; migrate with the original tooling first")]
    UnsupportedLegacySchema { found: u32 },

    #[error("schema version file `{0}` is corrupt")]
    CorruptSchemaFile(PathBuf),

    #[error("corrupt value for key `{key}` in table `{table}`: {reason}")]
    CorruptValue {
        table: String,
        key: String,
        reason: String,
    },

    #[error("no table named `{0}` has been opened")]
    NoSuchTable(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt_value(table: &str, key: &str, reason: impl Into<String>) -> Self {
        Error::CorruptValue {
            table: table.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
