// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! Transactional key/value metadata store.
//!
//! The store engine keeps its bookkeeping — which paths are valid, what
//! they reference, who refers to them, how they can be substituted, and
//! which derivation built them — in a handful of uniform key/value tables
//! backed by SQLite. This crate owns the tables, the transaction
//! interface, the list-of-strings value framing, and schema versioning.
//! It knows nothing about builds or the filesystem layout of the store;
//! those semantics live in the engine.
//!
//! # Example
//!
//! ```ignore
//! let mut db = MetaDb::open(&db_dir, OpenMode::Create)?;
//! let valid = db.open_table("validpaths")?;
//! let mut txn = db.transaction()?;
//! txn.put_string(valid, "/silo/store/...-foo", "sha256:...")?;
//! txn.commit()?;
//! ```

mod codec;
mod connection;
mod error;
mod substitute;

pub use codec::{pack_strings, unpack_strings};
pub use connection::{MetaDb, MetaTxn, OpenMode, TableId, SCHEMA_VERSION};
pub use error::{Error, Result};
pub use substitute::Substitute;
