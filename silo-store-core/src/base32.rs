//! The store's base-32 alphabet.
//!
//! Digests embedded in store path names use a 32-character alphabet that
//! omits `e`, `o`, `u` and `t` (no accidental words), packing bits from the
//! least significant end of the last byte. A 160-bit digest encodes to
//! exactly 32 characters.

use thiserror::Error;

// omitted: E O U T
const ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base-32 character {0:?}")]
    InvalidChar(char),
}

/// Number of characters needed to encode `n` bytes.
pub const fn encoded_len(n: usize) -> usize {
    if n == 0 { 0 } else { (n * 8 - 1) / 5 + 1 }
}

/// Encode bytes in the store's base-32 alphabet.
pub fn encode(bytes: &[u8]) -> String {
    let len = encoded_len(bytes.len());

    let chars = (0..len).rev().map(|n| {
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        // five bits straddling bytes i and i+1
        let lo = bytes.get(i).map_or(0, |&x| x.checked_shr(j as u32).unwrap_or(0));
        let hi = bytes
            .get(i + 1)
            .map_or(0, |&x| x.checked_shl((8 - j) as u32).unwrap_or(0));
        ALPHABET[((lo | hi) & 0x1f) as usize] as char
    });

    chars.collect()
}

/// Decode a string in the store's base-32 alphabet.
pub fn decode(input: &str) -> Result<Vec<u8>, DecodeError> {
    let output_len = input.len() * 5 / 8;
    let mut output = vec![0u8; output_len];

    for (n, c) in input.bytes().rev().enumerate() {
        let digit = ALPHABET
            .iter()
            .position(|&b| b == c)
            .ok_or(DecodeError::InvalidChar(c as char))? as u8;

        let b = n * 5;
        let i = b / 8;
        let j = b % 8;

        if i < output_len {
            output[i] |= digit << j;
            if i + 1 < output_len && j > 3 {
                output[i + 1] |= digit >> (8 - j);
            }
        }
    }

    Ok(output)
}

/// True if every byte of `s` is in the alphabet.
pub fn is_valid(s: &str) -> bool {
    s.bytes().all(|c| ALPHABET.contains(&c))
}
