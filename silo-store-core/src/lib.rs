// SPDX-License-Identifier: MIT

//! Core data types for the silo store.
//!
//! This crate is the pure layer underneath the store engine: store
//! directories and paths (including the deterministic path-naming
//! function), cryptographic hashes and their textual encodings,
//! derivation records with their canonical on-disk codec, and the
//! canonical archive serialization used to hash and copy filesystem
//! trees. Nothing in here touches the metadata database or spawns
//! processes.

pub mod archive;
pub mod base32;
pub mod derivation;
pub mod hash;
pub mod store_path;

pub use derivation::{Derivation, DerivationOutput, ParseDerivationError};
pub use hash::{Hash, HashAlgo, Hasher, ParseHashError};
pub use store_path::{StoreDir, StorePath, StorePathError};
