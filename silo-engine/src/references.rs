// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! Reference scanning of build outputs.
//!
//! After a build we discover which store paths an output mentions by
//! searching its bytes for the 32-character digest part of each candidate
//! path. The scan covers regular file contents and symlink targets of the
//! whole output tree.
//!
//! The search slides a 32-byte window over the data, validating
//! characters right to left against the base-32 alphabet; on the first
//! invalid character at offset `j` it skips `j + 1` positions. On binary
//! data that advances nearly a full window per probe, so the scan is
//! cheap regardless of how many candidates there are (matching windows
//! are then checked against a hash set).

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::Read as _;
use std::path::Path;

use silo_store_core::store_path::{StorePath, HASH_PART_LEN};

use crate::error::{IoContext, Result};
use crate::interrupt::check_interrupt;

/// Marker file that opts an output tree out of reference scanning.
pub const NO_SCAN_MARKER: &str = "nix-support/no-scan";

/// 256-entry table of bytes valid in the store's base-32 alphabet.
const VALID: [bool; 256] = {
    let mut table = [false; 256];
    let alphabet = b"0123456789abcdfghijklmnpqrsvwxyz";
    let mut i = 0;
    while i < alphabet.len() {
        table[alphabet[i] as usize] = true;
        i += 1;
    }
    table
};

/// Incremental scanner for candidate digest strings.
pub struct RefScanner {
    /// Digests not yet seen; found ones move to `seen`.
    pending: HashSet<[u8; HASH_PART_LEN]>,
    seen: HashSet<[u8; HASH_PART_LEN]>,
    /// Digest bytes back to the candidate path, for building the result.
    candidates: Vec<([u8; HASH_PART_LEN], StorePath)>,
    /// Trailing bytes of the previous chunk, for matches on a boundary.
    tail: Vec<u8>,
}

impl RefScanner {
    pub fn new(candidates: &BTreeSet<StorePath>) -> RefScanner {
        let mut pending = HashSet::with_capacity(candidates.len());
        let mut back = Vec::with_capacity(candidates.len());
        for path in candidates {
            let mut digest = [0u8; HASH_PART_LEN];
            digest.copy_from_slice(path.hash_part().as_bytes());
            if pending.insert(digest) {
                back.push((digest, path.clone()));
            }
        }
        RefScanner {
            pending,
            seen: HashSet::new(),
            candidates: back,
            tail: Vec::with_capacity(HASH_PART_LEN),
        }
    }

    /// Feed the next chunk of one logical byte stream.
    pub fn feed(&mut self, data: &[u8]) {
        if self.pending.is_empty() {
            return;
        }

        let overlap_len = data.len().min(HASH_PART_LEN);

        // A digest may straddle the previous chunk and this one; search
        // the seam separately.
        if !self.tail.is_empty() {
            let mut seam = self.tail.clone();
            seam.extend_from_slice(&data[..overlap_len]);
            search(&seam, &mut self.pending, &mut self.seen);
        }

        search(data, &mut self.pending, &mut self.seen);

        let keep = HASH_PART_LEN - overlap_len;
        if keep < self.tail.len() {
            self.tail.drain(..self.tail.len() - keep);
        }
        self.tail.extend_from_slice(&data[data.len() - overlap_len..]);
    }

    /// End the current byte stream; a digest cannot span two files.
    pub fn end_of_stream(&mut self) {
        self.tail.clear();
    }

    /// Candidates whose digest was seen.
    pub fn found(&self) -> BTreeSet<StorePath> {
        self.candidates
            .iter()
            .filter(|(digest, _)| self.seen.contains(digest))
            .map(|(_, path)| path.clone())
            .collect()
    }
}

fn search(
    data: &[u8],
    pending: &mut HashSet<[u8; HASH_PART_LEN]>,
    seen: &mut HashSet<[u8; HASH_PART_LEN]>,
) {
    if data.len() < HASH_PART_LEN {
        return;
    }

    let mut i = 0;
    'outer: while i + HASH_PART_LEN <= data.len() {
        let mut j = HASH_PART_LEN;
        while j > 0 {
            j -= 1;
            if !VALID[data[i + j] as usize] {
                i += j + 1;
                continue 'outer;
            }
        }

        let window: [u8; HASH_PART_LEN] = data[i..i + HASH_PART_LEN].try_into().unwrap();
        if pending.remove(&window) {
            seen.insert(window);
        }
        i += 1;
    }
}

/// Scan the on-disk tree at `path` for references to `candidates`.
///
/// Skipped entirely (returning no references) when the tree carries the
/// [`NO_SCAN_MARKER`] opt-out.
pub fn scan_for_references(
    path: &Path,
    candidates: &BTreeSet<StorePath>,
) -> Result<BTreeSet<StorePath>> {
    if path.join(NO_SCAN_MARKER).exists() {
        tracing::debug!("skipping reference scan of `{}`", path.display());
        return Ok(BTreeSet::new());
    }

    let mut scanner = RefScanner::new(candidates);
    scan_tree(path, &mut scanner)?;
    Ok(scanner.found())
}

fn scan_tree(path: &Path, scanner: &mut RefScanner) -> Result<()> {
    check_interrupt()?;

    let meta = fs::symlink_metadata(path)
        .io_context(|| format!("getting attributes of `{}`", path.display()))?;

    if meta.is_file() {
        let mut file =
            File::open(path).io_context(|| format!("opening `{}`", path.display()))?;
        let mut buf = [0u8; 65536];
        loop {
            let n = file
                .read(&mut buf)
                .io_context(|| format!("reading `{}`", path.display()))?;
            if n == 0 {
                break;
            }
            scanner.feed(&buf[..n]);
        }
        scanner.end_of_stream();
    } else if meta.is_symlink() {
        let target = fs::read_link(path)
            .io_context(|| format!("reading symlink `{}`", path.display()))?;
        scanner.feed(target.as_os_str().as_encoded_bytes());
        scanner.end_of_stream();
    } else if meta.is_dir() {
        for entry in
            fs::read_dir(path).io_context(|| format!("reading directory `{}`", path.display()))?
        {
            let entry = entry.io_context(|| format!("reading directory `{}`", path.display()))?;
            scan_tree(&entry.path(), scanner)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_store_core::hash::{hash_bytes, HashAlgo};
    use silo_store_core::StoreDir;
    use tempfile::TempDir;

    fn store() -> StoreDir {
        StoreDir::new("/silo/store").unwrap()
    }

    fn candidate(seed: &str) -> StorePath {
        store().make_store_path("source", &hash_bytes(HashAlgo::Sha256, seed), "dep")
    }

    #[test]
    fn finds_reference_in_file_contents() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();

        let dep = candidate("a");
        fs::write(out.join("script"), format!("#!/bin/sh\nexec {dep}/bin/tool\n")).unwrap();

        let refs =
            scan_for_references(&out, &BTreeSet::from([dep.clone(), candidate("b")])).unwrap();
        assert_eq!(refs, BTreeSet::from([dep]));
    }

    #[test]
    fn finds_reference_in_symlink_target() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();

        let dep = candidate("a");
        std::os::unix::fs::symlink(dep.as_path(), out.join("link")).unwrap();

        let refs = scan_for_references(&out, &BTreeSet::from([dep.clone()])).unwrap();
        assert_eq!(refs, BTreeSet::from([dep]));
    }

    #[test]
    fn digest_split_across_files_does_not_match() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();

        let dep = candidate("a");
        let digest = dep.hash_part();
        fs::write(out.join("a-first-half"), &digest[..16]).unwrap();
        fs::write(out.join("b-second-half"), &digest[16..]).unwrap();

        let refs = scan_for_references(&out, &BTreeSet::from([dep])).unwrap();
        assert!(refs.is_empty());
    }

    #[test]
    fn chunk_boundaries_do_not_hide_matches() {
        let dep = candidate("a");
        let content = format!("prefix {dep} suffix");
        let bytes = content.as_bytes();

        for chunk_size in 1..=bytes.len() {
            let mut scanner = RefScanner::new(&BTreeSet::from([dep.clone()]));
            for chunk in bytes.chunks(chunk_size) {
                scanner.feed(chunk);
            }
            assert_eq!(
                scanner.found(),
                BTreeSet::from([dep.clone()]),
                "missed match at chunk size {chunk_size}"
            );
        }
    }

    #[test]
    fn no_scan_marker_disables_scanning() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(out.join("nix-support")).unwrap();
        fs::write(out.join("nix-support/no-scan"), "").unwrap();

        let dep = candidate("a");
        fs::write(out.join("data"), dep.hash_part()).unwrap();

        let refs = scan_for_references(&out, &BTreeSet::from([dep])).unwrap();
        assert!(refs.is_empty());
    }
}
