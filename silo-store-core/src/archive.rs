// SPDX-License-Identifier: MIT

//! Canonical serialization of filesystem trees.
//!
//! A tree (regular files with their executable bit, symlinks, directories
//! with sorted entries) is rendered as a deterministic byte stream: no
//! timestamps, no owners, no other metadata. Hashing that stream gives the
//! content hash recorded for a store path, and dump/restore is how trees
//! are copied into the store.
//!
//! Wire format: every token and blob is a length-prefixed string (`u64`
//! little-endian length, payload, zero-padding to a multiple of 8). The
//! stream opens with the `nix-archive-1` magic and nests `( type ... )`
//! groups per node.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{symlink, OpenOptionsExt as _, PermissionsExt as _};
use std::path::Path;

use thiserror::Error;

use crate::hash::{Hash, HashAlgo, Hasher};

const MAGIC: &str = "nix-archive-1";

/// Upper bound on token/name/target strings; file contents are streamed
/// and not subject to it.
const MAX_STRING: u64 = 4096;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error while archiving `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed archive: {0}")]
    Format(String),

    #[error("`{0}` has an unsupported file type")]
    UnsupportedFileType(String),
}

impl ArchiveError {
    fn io(path: &Path, source: io::Error) -> Self {
        ArchiveError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Serialize the tree rooted at `path` into `sink`.
pub fn dump_path(path: &Path, sink: &mut impl Write) -> Result<(), ArchiveError> {
    let mut w = Framed { inner: sink };
    w.write_str(MAGIC, path)?;
    dump_node(path, &mut w)
}

/// Content hash of the canonical serialization of `path`.
pub fn hash_path(algo: HashAlgo, path: &Path) -> Result<Hash, ArchiveError> {
    let mut sink = HashSink(Hasher::new(algo));
    dump_path(path, &mut sink)?;
    Ok(sink.0.finish())
}

/// Materialize a serialized tree at `path`, which must not exist yet.
pub fn restore_path(path: &Path, source: &mut impl Read) -> Result<(), ArchiveError> {
    let mut r = Parser { inner: source };
    let magic = r.read_str(path)?;
    if magic != MAGIC {
        return Err(ArchiveError::Format(format!("bad magic `{magic}`")));
    }
    restore_node(path, &mut r)
}

fn dump_node(path: &Path, w: &mut Framed<'_, impl Write>) -> Result<(), ArchiveError> {
    let meta = fs::symlink_metadata(path).map_err(|e| ArchiveError::io(path, e))?;
    let ft = meta.file_type();

    w.write_str("(", path)?;
    w.write_str("type", path)?;

    if ft.is_file() {
        w.write_str("regular", path)?;
        if meta.permissions().mode() & 0o100 != 0 {
            w.write_str("executable", path)?;
            w.write_str("", path)?;
        }
        w.write_str("contents", path)?;
        let file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
        w.write_stream(meta.len(), file, path)?;
    } else if ft.is_symlink() {
        w.write_str("symlink", path)?;
        w.write_str("target", path)?;
        let target = fs::read_link(path).map_err(|e| ArchiveError::io(path, e))?;
        w.write_str(&target.to_string_lossy(), path)?;
    } else if ft.is_dir() {
        w.write_str("directory", path)?;
        let mut names: Vec<String> = fs::read_dir(path)
            .map_err(|e| ArchiveError::io(path, e))?
            .map(|entry| {
                entry
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .map_err(|e| ArchiveError::io(path, e))
            })
            .collect::<Result<_, _>>()?;
        names.sort();
        for name in names {
            w.write_str("entry", path)?;
            w.write_str("(", path)?;
            w.write_str("name", path)?;
            w.write_str(&name, path)?;
            w.write_str("node", path)?;
            dump_node(&path.join(&name), w)?;
            w.write_str(")", path)?;
        }
    } else {
        return Err(ArchiveError::UnsupportedFileType(
            path.display().to_string(),
        ));
    }

    w.write_str(")", path)
}

fn restore_node(path: &Path, r: &mut Parser<'_, impl Read>) -> Result<(), ArchiveError> {
    r.expect("(", path)?;
    r.expect("type", path)?;

    match r.read_str(path)?.as_str() {
        "regular" => {
            let mut tok = r.read_str(path)?;
            let mut executable = false;
            if tok == "executable" {
                executable = true;
                r.expect("", path)?;
                tok = r.read_str(path)?;
            }
            if tok != "contents" {
                return Err(ArchiveError::Format(format!(
                    "expected `contents`, got `{tok}`"
                )));
            }
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(if executable { 0o777 } else { 0o666 })
                .open(path)
                .map_err(|e| ArchiveError::io(path, e))?;
            r.read_stream(&mut file, path)?;
        }
        "symlink" => {
            r.expect("target", path)?;
            let target = r.read_str(path)?;
            symlink(&target, path).map_err(|e| ArchiveError::io(path, e))?;
        }
        "directory" => {
            fs::create_dir(path).map_err(|e| ArchiveError::io(path, e))?;
            loop {
                match r.read_str(path)?.as_str() {
                    ")" => return Ok(()),
                    "entry" => {
                        r.expect("(", path)?;
                        r.expect("name", path)?;
                        let name = r.read_str(path)?;
                        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                            return Err(ArchiveError::Format(format!(
                                "illegal entry name `{name}`"
                            )));
                        }
                        r.expect("node", path)?;
                        restore_node(&path.join(&name), r)?;
                        r.expect(")", path)?;
                    }
                    tok => {
                        return Err(ArchiveError::Format(format!(
                            "expected `entry` or `)`, got `{tok}`"
                        )))
                    }
                }
            }
        }
        ty => return Err(ArchiveError::Format(format!("unknown node type `{ty}`"))),
    }

    r.expect(")", path)
}

struct Framed<'a, W: Write> {
    inner: &'a mut W,
}

impl<W: Write> Framed<'_, W> {
    fn write_str(&mut self, s: &str, path: &Path) -> Result<(), ArchiveError> {
        self.write_len(s.len() as u64, path)?;
        self.inner
            .write_all(s.as_bytes())
            .and_then(|()| self.pad(s.len() as u64))
            .map_err(|e| ArchiveError::io(path, e))
    }

    /// Frame `len` bytes pulled from `reader` as one string.
    fn write_stream(
        &mut self,
        len: u64,
        mut reader: impl Read,
        path: &Path,
    ) -> Result<(), ArchiveError> {
        self.write_len(len, path)?;
        let copied =
            io::copy(&mut reader.by_ref().take(len), self.inner).map_err(|e| ArchiveError::io(path, e))?;
        if copied != len {
            return Err(ArchiveError::Format(format!(
                "file `{}` shrank while dumping it",
                path.display()
            )));
        }
        self.pad(len).map_err(|e| ArchiveError::io(path, e))
    }

    fn write_len(&mut self, len: u64, path: &Path) -> Result<(), ArchiveError> {
        self.inner
            .write_all(&len.to_le_bytes())
            .map_err(|e| ArchiveError::io(path, e))
    }

    fn pad(&mut self, len: u64) -> io::Result<()> {
        let rem = (len % 8) as usize;
        if rem > 0 {
            self.inner.write_all(&[0u8; 8][..8 - rem])?;
        }
        Ok(())
    }
}

struct Parser<'a, R: Read> {
    inner: &'a mut R,
}

impl<R: Read> Parser<'_, R> {
    fn read_len(&mut self, path: &Path) -> Result<u64, ArchiveError> {
        let mut buf = [0u8; 8];
        self.inner
            .read_exact(&mut buf)
            .map_err(|e| ArchiveError::io(path, e))?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_str(&mut self, path: &Path) -> Result<String, ArchiveError> {
        let len = self.read_len(path)?;
        if len > MAX_STRING {
            return Err(ArchiveError::Format(format!(
                "string of length {len} exceeds limit"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut buf)
            .map_err(|e| ArchiveError::io(path, e))?;
        self.skip_pad(len, path)?;
        String::from_utf8(buf).map_err(|_| ArchiveError::Format("string is not UTF-8".into()))
    }

    fn expect(&mut self, token: &str, path: &Path) -> Result<(), ArchiveError> {
        let got = self.read_str(path)?;
        if got != token {
            return Err(ArchiveError::Format(format!(
                "expected `{token}`, got `{got}`"
            )));
        }
        Ok(())
    }

    /// Unframe one string directly into `sink` (for file contents).
    fn read_stream(&mut self, sink: &mut impl Write, path: &Path) -> Result<(), ArchiveError> {
        let len = self.read_len(path)?;
        let copied = io::copy(&mut self.inner.by_ref().take(len), sink)
            .map_err(|e| ArchiveError::io(path, e))?;
        if copied != len {
            return Err(ArchiveError::Format("truncated file contents".into()));
        }
        self.skip_pad(len, path)
    }

    fn skip_pad(&mut self, len: u64, path: &Path) -> Result<(), ArchiveError> {
        let rem = (len % 8) as usize;
        if rem > 0 {
            let mut pad = [0u8; 8];
            self.inner
                .read_exact(&mut pad[..8 - rem])
                .map_err(|e| ArchiveError::io(path, e))?;
            if pad.iter().any(|&b| b != 0) {
                return Err(ArchiveError::Format("non-zero padding".into()));
            }
        }
        Ok(())
    }
}

struct HashSink(Hasher);

impl Write for HashSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn sample_tree(root: &Path) {
        fs::create_dir(root).unwrap();
        fs::write(root.join("hello.txt"), "hello world\n").unwrap();
        fs::create_dir(root.join("bin")).unwrap();
        fs::write(root.join("bin/run"), "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(root.join("bin/run"), fs::Permissions::from_mode(0o755)).unwrap();
        symlink("hello.txt", root.join("link")).unwrap();
    }

    #[test]
    fn dump_restore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        sample_tree(&src);

        let mut buf = Vec::new();
        dump_path(&src, &mut buf).unwrap();

        let dst = dir.path().join("dst");
        restore_path(&dst, &mut &buf[..]).unwrap();

        assert_eq!(fs::read(dst.join("hello.txt")).unwrap(), b"hello world\n");
        assert_eq!(fs::read_link(dst.join("link")).unwrap(), Path::new("hello.txt"));
        let mode = fs::metadata(dst.join("bin/run")).unwrap().permissions().mode();
        assert_ne!(mode & 0o100, 0, "executable bit survives the roundtrip");

        // The restored tree serializes to the same bytes.
        let mut buf2 = Vec::new();
        dump_path(&dst, &mut buf2).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn hash_ignores_timestamps() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        sample_tree(&a);
        std::thread::sleep(std::time::Duration::from_millis(20));
        sample_tree(&b);
        assert_eq!(
            hash_path(HashAlgo::Sha256, &a).unwrap(),
            hash_path(HashAlgo::Sha256, &b).unwrap()
        );
    }

    #[test]
    fn hash_sees_executable_bit() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, "payload").unwrap();
        let plain = hash_path(HashAlgo::Sha256, &f).unwrap();
        fs::set_permissions(&f, fs::Permissions::from_mode(0o755)).unwrap();
        let exec = hash_path(HashAlgo::Sha256, &f).unwrap();
        assert_ne!(plain, exec);
    }

    #[test]
    fn single_file_dump() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("note");
        fs::write(&f, "hello").unwrap();

        let mut buf = Vec::new();
        dump_path(&f, &mut buf).unwrap();

        let restored = dir.path().join("copy");
        restore_path(&restored, &mut &buf[..]).unwrap();
        assert_eq!(fs::read(restored).unwrap(), b"hello");
    }

    #[test]
    fn restore_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("inner"), "x").unwrap();

        let mut buf = Vec::new();
        dump_path(&src, &mut buf).unwrap();
        // Corrupt the entry name "inner" into "../in". Same length, so the
        // framing stays intact.
        let needle = b"inner";
        let pos = buf
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        buf[pos..pos + 5].copy_from_slice(b"../in");

        let dst = dir.path().join("dst");
        assert!(matches!(
            restore_path(&dst, &mut &buf[..]),
            Err(ArchiveError::Format(_))
        ));
    }

    #[test]
    fn restore_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let mut buf = Vec::new();
        Framed { inner: &mut buf }
            .write_str("not-an-archive", Path::new("/"))
            .unwrap();
        assert!(matches!(
            restore_path(&dir.path().join("x"), &mut &buf[..]),
            Err(ArchiveError::Format(_))
        ));
    }
}
