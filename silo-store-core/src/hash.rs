use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;

use crate::base32;

/// Digest algorithms a store may encounter. `Sha256` is what the store
/// itself records for path contents; the others only appear in
/// fixed-output derivations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgo::Md5 => "md5",
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            HashAlgo::Md5 => 16,
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }

    pub fn base16_len(self) -> usize {
        self.digest_size() * 2
    }

    pub fn base32_len(self) -> usize {
        base32::encoded_len(self.digest_size())
    }
}

impl FromStr for HashAlgo {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(HashAlgo::Md5),
            "sha1" => Ok(HashAlgo::Sha1),
            "sha256" => Ok(HashAlgo::Sha256),
            "sha512" => Ok(HashAlgo::Sha512),
            _ => Err(ParseHashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A digest tagged with its algorithm.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash {
    algo: HashAlgo,
    digest: Vec<u8>,
}

impl Hash {
    pub fn new(algo: HashAlgo, digest: Vec<u8>) -> Result<Self, ParseHashError> {
        if digest.len() != algo.digest_size() {
            return Err(ParseHashError::InvalidDigestSize {
                algo,
                expected: algo.digest_size(),
                actual: digest.len(),
            });
        }
        Ok(Hash { algo, digest })
    }

    /// Parse a bare digest in hex or base-32, picked by length.
    pub fn parse(algo: HashAlgo, s: &str) -> Result<Self, ParseHashError> {
        let digest = if s.len() == algo.base16_len() {
            hex::decode(s).map_err(|e| ParseHashError::Encoding(e.to_string()))?
        } else if s.len() == algo.base32_len() {
            base32::decode(s).map_err(|e| ParseHashError::Encoding(e.to_string()))?
        } else {
            return Err(ParseHashError::InvalidDigestLength {
                algo,
                actual: s.len(),
            });
        };
        Hash::new(algo, digest)
    }

    /// Parse a digest in the `algo:digest` form used by the metadata store.
    pub fn parse_prefixed(s: &str) -> Result<Self, ParseHashError> {
        let (algo, digest) = s
            .split_once(':')
            .ok_or_else(|| ParseHashError::MissingPrefix(s.to_string()))?;
        Hash::parse(algo.parse()?, digest)
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    pub fn to_base32(&self) -> String {
        base32::encode(&self.digest)
    }

    /// `algo:hex`, the form stored in the valid-paths table.
    pub fn to_prefixed(&self) -> String {
        format!("{}:{}", self.algo, self.to_hex())
    }

    /// Shorten the digest to `size` bytes by XOR-folding the tail back
    /// onto the front. Used by the path-naming function to cut a SHA-256
    /// digest down to the 160 bits that fit a path name.
    pub fn compress(&self, size: usize) -> Vec<u8> {
        let mut out = vec![0u8; size];
        for (i, &b) in self.digest.iter().enumerate() {
            out[i % size] ^= b;
        }
        out
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

#[derive(Error, Debug)]
pub enum ParseHashError {
    #[error("unknown hash algorithm `{0}`")]
    UnknownAlgorithm(String),

    #[error("hash `{0}` has no algorithm prefix")]
    MissingPrefix(String),

    #[error("invalid digest size for {algo}: expected {expected} bytes, got {actual}")]
    InvalidDigestSize {
        algo: HashAlgo,
        expected: usize,
        actual: usize,
    },

    #[error("digest of length {actual} is neither hex nor base-32 for {algo}")]
    InvalidDigestLength { algo: HashAlgo, actual: usize },

    #[error("bad digest encoding: {0}")]
    Encoding(String),
}

/// Incremental hasher over any supported algorithm.
pub struct Hasher(Inner);

enum Inner {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algo: HashAlgo) -> Self {
        Hasher(match algo {
            HashAlgo::Md5 => Inner::Md5(Md5::new()),
            HashAlgo::Sha1 => Inner::Sha1(Sha1::new()),
            HashAlgo::Sha256 => Inner::Sha256(Sha256::new()),
            HashAlgo::Sha512 => Inner::Sha512(Sha512::new()),
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.0 {
            Inner::Md5(h) => h.update(data),
            Inner::Sha1(h) => h.update(data),
            Inner::Sha256(h) => h.update(data),
            Inner::Sha512(h) => h.update(data),
        }
    }

    pub fn finish(self) -> Hash {
        let (algo, digest) = match self.0 {
            Inner::Md5(h) => (HashAlgo::Md5, h.finalize().to_vec()),
            Inner::Sha1(h) => (HashAlgo::Sha1, h.finalize().to_vec()),
            Inner::Sha256(h) => (HashAlgo::Sha256, h.finalize().to_vec()),
            Inner::Sha512(h) => (HashAlgo::Sha512, h.finalize().to_vec()),
        };
        Hash { algo, digest }
    }
}

/// Hash a byte slice in one go.
pub fn hash_bytes(algo: HashAlgo, data: impl AsRef<[u8]>) -> Hash {
    let mut hasher = Hasher::new(algo);
    hasher.update(data.as_ref());
    hasher.finish()
}

/// Hash everything a reader yields.
pub fn hash_reader(algo: HashAlgo, mut reader: impl Read) -> io::Result<Hash> {
    let mut hasher = Hasher::new(algo);
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_value() {
        let h = hash_bytes(HashAlgo::Sha256, "hello world");
        assert_eq!(
            h.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            h.to_base32(),
            "1sfdxziarxw8j3p80lvswgpq9i7smdyxmmsj5sjhhgjdjfwjfkdr"
        );
    }

    #[test]
    fn parse_prefixed_roundtrip() {
        let h = hash_bytes(HashAlgo::Sha256, b"abc");
        let parsed = Hash::parse_prefixed(&h.to_prefixed()).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn parse_base32_digest() {
        let h = hash_bytes(HashAlgo::Sha256, b"abc");
        let parsed = Hash::parse(HashAlgo::Sha256, &h.to_base32()).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn parse_rejects_bad_length() {
        assert!(matches!(
            Hash::parse(HashAlgo::Sha256, "abcdef"),
            Err(ParseHashError::InvalidDigestLength { .. })
        ));
    }

    #[test]
    fn parse_rejects_unknown_algorithm() {
        assert!(matches!(
            Hash::parse_prefixed("blake3:0000"),
            Err(ParseHashError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn compress_folds_by_xor() {
        let h = Hash::new(HashAlgo::Sha256, (0u8..32).collect()).unwrap();
        let folded = h.compress(20);
        assert_eq!(folded.len(), 20);
        // bytes 20..32 fold back onto positions 0..12
        assert_eq!(folded[0], 0 ^ 20);
        assert_eq!(folded[11], 11 ^ 31);
        assert_eq!(folded[12], 12);
    }

    #[test]
    fn hash_reader_matches_hash_bytes() {
        let data = vec![0x5au8; 100_000];
        let streamed = hash_reader(HashAlgo::Sha256, &data[..]).unwrap();
        assert_eq!(streamed, hash_bytes(HashAlgo::Sha256, &data));
    }
}
