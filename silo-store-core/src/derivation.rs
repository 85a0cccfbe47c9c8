// SPDX-License-Identifier: MIT

//! Derivation records and their canonical on-disk codec.
//!
//! A derivation is stored as a printable term
//!
//! ```text
//! Derive([(name,path,hashAlgo,hash)],[(drvPath,[outputs])],[srcs],"platform","builder",[args],[(var,value)])
//! ```
//!
//! The encoding is canonical: maps are emitted in key order and strings
//! use a fixed escape set, so hashing the text of a derivation yields a
//! stable digest. That digest is what the output path namer consumes.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::hash::{hash_bytes, Hash, HashAlgo, ParseHashError};
use crate::store_path::{StoreDir, StorePath, StorePathError};

/// Declared content hash of a fixed-output derivation's single output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedOutput {
    pub algo: HashAlgo,
    pub hash: Hash,
}

/// One declared output of a derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationOutput {
    pub path: StorePath,
    /// Present only for fixed-output derivations.
    pub fixed: Option<FixedOutput>,
}

/// A pure build recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    /// Output name (e.g. `out`) to output descriptor.
    pub outputs: BTreeMap<String, DerivationOutput>,
    /// Input derivation path to the output names consumed from it.
    pub input_drvs: BTreeMap<StorePath, BTreeSet<String>>,
    /// Source store paths consumed directly.
    pub input_srcs: BTreeSet<StorePath>,
    /// Platform the builder must run on.
    pub platform: String,
    /// Absolute path of the builder program.
    pub builder: String,
    /// Builder arguments, in order.
    pub args: Vec<String>,
    /// Environment passed verbatim to the builder.
    pub env: BTreeMap<String, String>,
}

#[derive(Error, Debug)]
pub enum ParseDerivationError {
    #[error("unexpected end of derivation at offset {0}")]
    UnexpectedEof(usize),

    #[error("at offset {pos}: expected {expected}")]
    Expected { pos: usize, expected: String },

    #[error("invalid store path in derivation: {0}")]
    StorePath(#[from] StorePathError),

    #[error("invalid output hash in derivation: {0}")]
    Hash(#[from] ParseHashError),

    #[error("output `{0}` declares a hash but no algorithm")]
    HashWithoutAlgo(String),

    #[error("trailing garbage after derivation at offset {0}")]
    TrailingGarbage(usize),
}

impl Derivation {
    /// Parse the canonical text of a derivation.
    pub fn parse(store: &StoreDir, text: &str) -> Result<Self, ParseDerivationError> {
        let mut p = Parser {
            input: text.as_bytes(),
            pos: 0,
        };

        p.expect("Derive(")?;

        let mut outputs = BTreeMap::new();
        p.list(|p| {
            p.expect("(")?;
            let name = p.string()?;
            p.expect(",")?;
            let path = store.parse(&p.string()?)?;
            p.expect(",")?;
            let algo = p.string()?;
            p.expect(",")?;
            let hash = p.string()?;
            p.expect(")")?;
            let fixed = match (algo.as_str(), hash.as_str()) {
                ("", "") => None,
                ("", _) => return Err(ParseDerivationError::HashWithoutAlgo(name.clone())),
                (algo, hash) => {
                    let algo: HashAlgo = algo.parse()?;
                    Some(FixedOutput {
                        algo,
                        hash: Hash::parse(algo, hash)?,
                    })
                }
            };
            outputs.insert(name, DerivationOutput { path, fixed });
            Ok(())
        })?;
        p.expect(",")?;

        let mut input_drvs = BTreeMap::new();
        p.list(|p| {
            p.expect("(")?;
            let drv = store.parse(&p.string()?)?;
            p.expect(",")?;
            let mut names = BTreeSet::new();
            p.list(|p| {
                names.insert(p.string()?);
                Ok(())
            })?;
            p.expect(")")?;
            input_drvs.insert(drv, names);
            Ok(())
        })?;
        p.expect(",")?;

        let mut input_srcs = BTreeSet::new();
        p.list(|p| {
            input_srcs.insert(store.parse(&p.string()?)?);
            Ok(())
        })?;
        p.expect(",")?;

        let platform = p.string()?;
        p.expect(",")?;
        let builder = p.string()?;
        p.expect(",")?;

        let mut args = Vec::new();
        p.list(|p| {
            args.push(p.string()?);
            Ok(())
        })?;
        p.expect(",")?;

        let mut env = BTreeMap::new();
        p.list(|p| {
            p.expect("(")?;
            let var = p.string()?;
            p.expect(",")?;
            let value = p.string()?;
            p.expect(")")?;
            env.insert(var, value);
            Ok(())
        })?;
        p.expect(")")?;

        if p.pos != p.input.len() {
            return Err(ParseDerivationError::TrailingGarbage(p.pos));
        }

        Ok(Derivation {
            outputs,
            input_drvs,
            input_srcs,
            platform,
            builder,
            args,
            env,
        })
    }

    /// Construct a derivation, computing its output paths.
    ///
    /// A fixed-output derivation (single output `out` with a declared
    /// hash) is named after the promised content hash alone; any other
    /// output is named after the digest of the recipe with the output
    /// path fields blanked, which breaks the circularity of paths
    /// appearing in the text they are derived from. Every output path is
    /// also bound in the builder environment under its output name.
    #[allow(clippy::too_many_arguments)]
    pub fn instantiate(
        store: &StoreDir,
        name: &str,
        outputs: &[(&str, Option<FixedOutput>)],
        input_drvs: BTreeMap<StorePath, BTreeSet<String>>,
        input_srcs: BTreeSet<StorePath>,
        platform: &str,
        builder: &str,
        args: &[&str],
        env: BTreeMap<String, String>,
    ) -> Derivation {
        // Placeholder paths: masked out of the naming digest, replaced
        // below.
        let placeholder = store.make_store_path(
            "masked",
            &hash_bytes(HashAlgo::Sha256, name),
            name,
        );
        let mut drv = Derivation {
            outputs: outputs
                .iter()
                .map(|(out_name, fixed)| {
                    (
                        out_name.to_string(),
                        DerivationOutput {
                            path: placeholder.clone(),
                            fixed: fixed.clone(),
                        },
                    )
                })
                .collect(),
            input_drvs,
            input_srcs,
            platform: platform.to_string(),
            builder: builder.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env,
        };

        if drv.is_fixed_output() {
            let out = drv.outputs.get_mut("out").expect("fixed output is named out");
            let fixed = out.fixed.as_ref().expect("fixed output declares a hash");
            out.path = store.make_fixed_output_path(fixed.algo, &fixed.hash, name);
        } else {
            let masked_hash = hash_bytes(HashAlgo::Sha256, drv.unparse_impl(true));
            for (out_name, out) in drv.outputs.iter_mut() {
                out.path = store.make_output_path(out_name, &masked_hash, name);
            }
        }

        for (out_name, out) in &drv.outputs {
            drv.env.insert(out_name.clone(), out.path.to_string());
        }
        drv
    }

    /// Render the canonical text of this derivation.
    pub fn unparse(&self) -> String {
        self.unparse_impl(false)
    }

    fn unparse_impl(&self, mask_outputs: bool) -> String {
        let mut s = String::with_capacity(1024);
        s.push_str("Derive(");

        write_list(&mut s, self.outputs.iter(), |s, (name, out)| {
            s.push('(');
            write_string(s, name);
            s.push(',');
            write_string(s, if mask_outputs { "" } else { out.path.as_str() });
            s.push(',');
            let (algo, hash) = match &out.fixed {
                Some(f) => (f.algo.name().to_string(), f.hash.to_hex()),
                None => (String::new(), String::new()),
            };
            write_string(s, &algo);
            s.push(',');
            write_string(s, &hash);
            s.push(')');
        });
        s.push(',');

        write_list(&mut s, self.input_drvs.iter(), |s, (drv, names)| {
            s.push('(');
            write_string(s, drv.as_str());
            s.push(',');
            write_list(s, names.iter(), |s, n| write_string(s, n));
            s.push(')');
        });
        s.push(',');

        write_list(&mut s, self.input_srcs.iter(), |s, p| {
            write_string(s, p.as_str())
        });
        s.push(',');

        write_string(&mut s, &self.platform);
        s.push(',');
        write_string(&mut s, &self.builder);
        s.push(',');

        write_list(&mut s, self.args.iter(), |s, a| write_string(s, a));
        s.push(',');

        write_list(&mut s, self.env.iter(), |s, (var, value)| {
            s.push('(');
            write_string(s, var);
            s.push(',');
            write_string(s, value);
            s.push(')');
        });

        s.push(')');
        s
    }

    /// Stable digest of the canonical text, fed to the output path namer.
    pub fn hash(&self) -> Hash {
        hash_bytes(HashAlgo::Sha256, self.unparse())
    }

    /// The declared output paths.
    pub fn output_paths(&self) -> BTreeSet<StorePath> {
        self.outputs.values().map(|o| o.path.clone()).collect()
    }

    /// A derivation is fixed-output when its single output declares a hash.
    pub fn is_fixed_output(&self) -> bool {
        self.outputs.len() == 1 && self.outputs.values().next().is_some_and(|o| o.fixed.is_some())
    }
}

fn write_string(s: &mut String, value: &str) {
    s.push('"');
    for c in value.chars() {
        match c {
            '"' => s.push_str("\\\""),
            '\\' => s.push_str("\\\\"),
            '\n' => s.push_str("\\n"),
            '\r' => s.push_str("\\r"),
            '\t' => s.push_str("\\t"),
            c => s.push(c),
        }
    }
    s.push('"');
}

fn write_list<T>(s: &mut String, items: impl Iterator<Item = T>, mut f: impl FnMut(&mut String, T)) {
    s.push('[');
    for (i, item) in items.enumerate() {
        if i > 0 {
            s.push(',');
        }
        f(s, item);
    }
    s.push(']');
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8, ParseDerivationError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(ParseDerivationError::UnexpectedEof(self.pos))
    }

    fn expect(&mut self, token: &str) -> Result<(), ParseDerivationError> {
        if self.input[self.pos..].starts_with(token.as_bytes()) {
            self.pos += token.len();
            Ok(())
        } else {
            Err(ParseDerivationError::Expected {
                pos: self.pos,
                expected: format!("`{token}`"),
            })
        }
    }

    /// Parse `[item,item,...]`, calling `f` once per element.
    fn list(
        &mut self,
        mut f: impl FnMut(&mut Self) -> Result<(), ParseDerivationError>,
    ) -> Result<(), ParseDerivationError> {
        self.expect("[")?;
        if self.peek()? == b']' {
            self.pos += 1;
            return Ok(());
        }
        loop {
            f(self)?;
            match self.peek()? {
                b',' => self.pos += 1,
                b']' => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => {
                    return Err(ParseDerivationError::Expected {
                        pos: self.pos,
                        expected: "`,` or `]`".into(),
                    })
                }
            }
        }
    }

    /// Parse a double-quoted string with the canonical escape set.
    fn string(&mut self) -> Result<String, ParseDerivationError> {
        self.expect("\"")?;
        let mut out = Vec::new();
        loop {
            match self.peek()? {
                b'"' => {
                    self.pos += 1;
                    return String::from_utf8(out).map_err(|_| ParseDerivationError::Expected {
                        pos: self.pos,
                        expected: "valid UTF-8 string".into(),
                    });
                }
                b'\\' => {
                    self.pos += 1;
                    let escaped = self.peek()?;
                    self.pos += 1;
                    out.push(match escaped {
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        c => c,
                    });
                }
                c => {
                    self.pos += 1;
                    out.push(c);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn store() -> StoreDir {
        StoreDir::new("/silo/store").unwrap()
    }

    fn sample() -> Derivation {
        let store = store();
        let src = store.make_store_path("source", &hash_bytes(HashAlgo::Sha256, "src"), "builder.sh");
        let in_drv = store.make_store_path("text", &hash_bytes(HashAlgo::Sha256, "dep"), "dep.drv");
        let out = store.make_store_path("output:out", &hash_bytes(HashAlgo::Sha256, "x"), "hello-1.0");

        Derivation {
            outputs: BTreeMap::from([(
                "out".to_string(),
                DerivationOutput {
                    path: out,
                    fixed: None,
                },
            )]),
            input_drvs: BTreeMap::from([(in_drv, BTreeSet::from(["out".to_string()]))]),
            input_srcs: BTreeSet::from([src]),
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            args: vec!["-e".into(), "builder.sh".into()],
            env: BTreeMap::from([
                ("out".to_string(), "/silo/store/something".to_string()),
                ("weird".to_string(), "line1\nline2\t\"quoted\"\\".to_string()),
            ]),
        }
    }

    #[test]
    fn roundtrip() {
        let drv = sample();
        let text = drv.unparse();
        let parsed = Derivation::parse(&store(), &text).unwrap();
        assert_eq!(parsed, drv);
    }

    #[test]
    fn hash_is_stable() {
        let drv = sample();
        let reparsed = Derivation::parse(&store(), &drv.unparse()).unwrap();
        assert_eq!(drv.hash(), reparsed.hash());
    }

    #[test]
    fn fixed_output_roundtrip() {
        let mut drv = sample();
        drv.input_drvs.clear();
        let content_hash = hash_bytes(HashAlgo::Sha256, "fixed contents");
        drv.outputs.get_mut("out").unwrap().fixed = Some(FixedOutput {
            algo: HashAlgo::Sha256,
            hash: content_hash.clone(),
        });
        let parsed = Derivation::parse(&store(), &drv.unparse()).unwrap();
        assert_eq!(
            parsed.outputs["out"].fixed.as_ref().unwrap().hash,
            content_hash
        );
        assert!(parsed.is_fixed_output());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Derivation::parse(&store(), "NotADerivation(").is_err());
        let text = sample().unparse();
        assert!(Derivation::parse(&store(), &format!("{text}trailing")).is_err());
        assert!(Derivation::parse(&store(), &text[..text.len() - 1]).is_err());
    }

    #[test]
    fn unparse_is_canonical_under_reordering() {
        // env/outputs are BTreeMaps, so insertion order cannot leak into
        // the text.
        let a = sample();
        let mut b = sample();
        let env: Vec<_> = b.env.into_iter().collect();
        b.env = env.into_iter().rev().collect();
        assert_eq!(a.unparse(), b.unparse());
    }
}
