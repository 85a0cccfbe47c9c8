// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! Length-prefixed framing for list-of-strings values.
//!
//! Table values that hold lists (references, referrers, substitute
//! records) are encoded as a concatenation of `u32` big-endian length
//! prefixes and payload bytes. The framing makes embedded delimiters a
//! non-issue and lets records nest: a substitute record is itself a
//! packed list stored as one element of an outer packed list.

/// Encode a list of byte strings.
pub fn pack_strings<S: AsRef<[u8]>>(items: &[S]) -> Vec<u8> {
    let mut out = Vec::with_capacity(items.iter().map(|s| s.as_ref().len() + 4).sum());
    for item in items {
        let item = item.as_ref();
        out.extend_from_slice(&(item.len() as u32).to_be_bytes());
        out.extend_from_slice(item);
    }
    out
}

/// Decode a packed list. Returns `None` when the framing is inconsistent
/// (truncated length, payload running past the end).
pub fn unpack_strings(mut data: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        if data.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        data = &data[4..];
        if data.len() < len {
            return None;
        }
        out.push(data[..len].to_vec());
        data = &data[len..];
    }
    Some(out)
}
