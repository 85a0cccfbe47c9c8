// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! Substitute records.
//!
//! A substitute names a program that can produce a store path's contents
//! without running its derivation (typically by downloading them). Each
//! record is stored as a versioned packed list
//! `[version, deriver, program, packed-args]`; records with an unknown
//! version or pre-framing encoding are skipped on read so that stores
//! written by older tooling remain loadable.

use crate::codec::{pack_strings, unpack_strings};

const SUBSTITUTE_VERSION: u32 = 2;

/// An alternative way of producing a store path: run `program` with the
/// target path as its first argument, followed by `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitute {
    /// Derivation path this substitute stands in for; empty when unknown.
    pub deriver: String,
    /// Absolute path of the substituter program.
    pub program: String,
    /// Extra arguments passed after the store path.
    pub args: Vec<String>,
}

impl Substitute {
    /// Two substitutes are interchangeable when they run the same command;
    /// the deriver is informational.
    pub fn same_command(&self, other: &Substitute) -> bool {
        self.program == other.program && self.args == other.args
    }

    /// Encode as one versioned record.
    pub fn encode(&self) -> Vec<u8> {
        pack_strings(&[
            SUBSTITUTE_VERSION.to_string().as_bytes(),
            self.deriver.as_bytes(),
            self.program.as_bytes(),
            &pack_strings(&self.args),
        ])
    }

    /// Decode a record. `Ok(None)` means a foreign but well-formed record
    /// (old or future version) that should be skipped; `Err` reports a
    /// record that claims the current version but is malformed.
    pub fn decode(record: &[u8]) -> Result<Option<Substitute>, String> {
        let Some(fields) = unpack_strings(record) else {
            // Pre-framing record from ancient tooling.
            return Ok(None);
        };
        let Some(version) = fields.first() else {
            return Ok(None);
        };
        let Ok(version) = std::str::from_utf8(version).map(str::parse::<u32>) else {
            return Ok(None);
        };
        match version {
            Ok(SUBSTITUTE_VERSION) => {}
            _ => return Ok(None),
        }
        if fields.len() != 4 {
            return Err(format!("expected 4 fields, found {}", fields.len()));
        }

        let utf8 = |field: &[u8], what: &str| {
            std::str::from_utf8(field)
                .map(str::to_owned)
                .map_err(|_| format!("{what} is not UTF-8"))
        };

        let args = unpack_strings(&fields[3]).ok_or("argument list framing is broken")?;
        Ok(Some(Substitute {
            deriver: utf8(&fields[1], "deriver")?,
            program: utf8(&fields[2], "program")?,
            args: args
                .iter()
                .map(|a| utf8(a, "argument"))
                .collect::<Result<_, _>>()?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Substitute {
        Substitute {
            deriver: "/silo/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-x.drv".into(),
            program: "/usr/bin/fetch".into(),
            args: vec!["--url".into(), "http://cache/archive".into()],
        }
    }

    #[test]
    fn roundtrip() {
        let sub = sample();
        assert_eq!(Substitute::decode(&sub.encode()).unwrap(), Some(sub));
    }

    #[test]
    fn foreign_versions_are_skipped() {
        let record = pack_strings(&[b"1".as_ref(), b"", b"/old/prog", b""]);
        assert_eq!(Substitute::decode(&record).unwrap(), None);
        let record = pack_strings(&[b"3".as_ref(), b"", b"/new/prog", b"", b"extra"]);
        assert_eq!(Substitute::decode(&record).unwrap(), None);
    }

    #[test]
    fn preframing_records_are_skipped() {
        // An old-style raw path, not a packed list.
        assert_eq!(Substitute::decode(b"/old/style/program").unwrap(), None);
    }

    #[test]
    fn malformed_current_version_is_an_error() {
        let record = pack_strings(&[b"2".as_ref(), b"only-two"]);
        assert!(Substitute::decode(&record).is_err());
    }

    #[test]
    fn same_command_ignores_deriver() {
        let a = sample();
        let mut b = sample();
        b.deriver = String::new();
        assert!(a.same_command(&b));
        b.args.push("--extra".into());
        assert!(!a.same_command(&b));
    }
}
