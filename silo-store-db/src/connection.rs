// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

//! Database connection, tables, transactions, and schema versioning.

use std::fs;
use std::path::Path;

use rusqlite::{params, Connection, OpenFlags};
use tracing::debug;

use crate::codec::{pack_strings, unpack_strings};
use crate::error::{Error, Result};

/// Compiled-in schema version. The version a store was created with lives
/// in a plain `schema` file next to the database; see [`MetaDb::open`].
pub const SCHEMA_VERSION: u32 = 2;

const DB_FILE: &str = "db.sqlite";
const SCHEMA_FILE: &str = "schema";

/// How to open the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-write, creating a fresh store if none exists.
    Create,
    /// Read-only; fails if the store does not exist.
    ReadOnly,
    /// Like `Create`, but silently downgrades to read-only when the
    /// database cannot be opened for writing (e.g. read-only filesystem).
    Auto,
}

/// Handle to an opened table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableId(usize);

/// The metadata store: a set of uniform key/value tables in one SQLite
/// database, plus a schema version file.
pub struct MetaDb {
    conn: Connection,
    read_only: bool,
    tables: Vec<String>,
}

impl MetaDb {
    /// Open (or create) the metadata store in `db_dir`.
    ///
    /// The directory holds `db.sqlite` and the `schema` version file. A
    /// fresh store is stamped with [`SCHEMA_VERSION`]; an existing store
    /// with a newer version is refused, and one with an older version is
    /// refused as unsupported legacy data (this engine carries no
    /// upgraders for pre-framing stores).
    pub fn open(db_dir: &Path, mode: OpenMode) -> Result<Self> {
        let db_path = db_dir.join(DB_FILE);
        let fresh = !db_path.exists();

        let (conn, read_only) = match mode {
            OpenMode::ReadOnly => (Self::open_read_only(&db_path)?, true),
            OpenMode::Create => (Self::open_read_write(db_dir, &db_path)?, false),
            OpenMode::Auto => match Self::open_read_write(db_dir, &db_path) {
                Ok(conn) => (conn, false),
                Err(e) => {
                    debug!("falling back to read-only metadata store: {e}");
                    (Self::open_read_only(&db_path)?, true)
                }
            },
        };

        let db = MetaDb {
            conn,
            read_only,
            tables: Vec::new(),
        };
        db.check_schema(db_dir, fresh)?;
        debug!("opened metadata store at {} (read_only={read_only})", db_dir.display());
        Ok(db)
    }

    fn open_read_write(db_dir: &Path, db_path: &Path) -> Result<Connection> {
        fs::create_dir_all(db_dir).map_err(|e| Error::io(db_dir, e))?;
        let conn = Connection::open(db_path).map_err(|e| Error::DatabaseOpen {
            path: db_path.to_owned(),
            source: e,
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(conn)
    }

    fn open_read_only(db_path: &Path) -> Result<Connection> {
        Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(|e| {
            Error::DatabaseOpen {
                path: db_path.to_owned(),
                source: e,
            }
        })
    }

    fn check_schema(&self, db_dir: &Path, fresh: bool) -> Result<()> {
        let schema_path = db_dir.join(SCHEMA_FILE);
        let stored = match fs::read_to_string(&schema_path) {
            Ok(s) => Some(
                s.trim()
                    .parse::<u32>()
                    .map_err(|_| Error::CorruptSchemaFile(schema_path.clone()))?,
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::io(&schema_path, e)),
        };

        match stored {
            Some(v) if v > SCHEMA_VERSION => Err(Error::SchemaTooNew {
                found: v,
                supported: SCHEMA_VERSION,
            }),
            Some(v) if v < SCHEMA_VERSION => Err(Error::UnsupportedLegacySchema { found: v }),
            Some(_) => Ok(()),
            None if fresh && !self.read_only => {
                fs::write(&schema_path, format!("{SCHEMA_VERSION}\n"))
                    .map_err(|e| Error::io(&schema_path, e))?;
                Ok(())
            }
            // Data without a schema stamp predates versioning entirely.
            None => Err(Error::UnsupportedLegacySchema { found: 0 }),
        }
    }

    /// Register a table, creating it if the store is writable.
    pub fn open_table(&mut self, name: &str) -> Result<TableId> {
        debug_assert!(
            name.bytes().all(|b| b.is_ascii_lowercase()),
            "table names are lowercase identifiers"
        );
        if let Some(i) = self.tables.iter().position(|t| t == name) {
            return Ok(TableId(i));
        }
        if !self.read_only {
            self.conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{name}\" (
                     key   TEXT PRIMARY KEY NOT NULL,
                     value BLOB NOT NULL
                 );"
            ))?;
        }
        self.tables.push(name.to_string());
        Ok(TableId(self.tables.len() - 1))
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn table(&self, table: TableId) -> &str {
        &self.tables[table.0]
    }

    /// Begin a transaction. Dropping the returned [`MetaTxn`] without
    /// calling [`MetaTxn::commit`] rolls every change back.
    pub fn transaction(&mut self) -> Result<MetaTxn<'_>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let MetaDb { conn, tables, .. } = self;
        Ok(MetaTxn {
            txn: conn.transaction()?,
            tables,
        })
    }

    // Snapshot reads outside any transaction. WAL mode guarantees these
    // see the last committed state even while a writer is active.

    pub fn get_string(&self, table: TableId, key: &str) -> Result<Option<String>> {
        get_string(&self.conn, self.table(table), key)
    }

    pub fn get_strings(&self, table: TableId, key: &str) -> Result<Vec<String>> {
        get_strings(&self.conn, self.table(table), key)
    }

    pub fn get_list(&self, table: TableId, key: &str) -> Result<Vec<Vec<u8>>> {
        get_list(&self.conn, self.table(table), key)
    }

    pub fn enumerate(&self, table: TableId) -> Result<Vec<String>> {
        enumerate(&self.conn, self.table(table))
    }
}

/// An open transaction over the metadata store.
///
/// All mutation goes through a transaction so that a crash leaves either
/// every change or none of them.
pub struct MetaTxn<'db> {
    txn: rusqlite::Transaction<'db>,
    tables: &'db [String],
}

impl MetaTxn<'_> {
    fn table(&self, table: TableId) -> &str {
        &self.tables[table.0]
    }

    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }

    pub fn get_string(&self, table: TableId, key: &str) -> Result<Option<String>> {
        get_string(&self.txn, self.table(table), key)
    }

    pub fn get_strings(&self, table: TableId, key: &str) -> Result<Vec<String>> {
        get_strings(&self.txn, self.table(table), key)
    }

    pub fn get_list(&self, table: TableId, key: &str) -> Result<Vec<Vec<u8>>> {
        get_list(&self.txn, self.table(table), key)
    }

    pub fn enumerate(&self, table: TableId) -> Result<Vec<String>> {
        enumerate(&self.txn, self.table(table))
    }

    pub fn put_string(&self, table: TableId, key: &str, value: &str) -> Result<()> {
        self.put_raw(table, key, value.as_bytes())
    }

    pub fn put_strings<S: AsRef<[u8]>>(
        &self,
        table: TableId,
        key: &str,
        values: &[S],
    ) -> Result<()> {
        self.put_raw(table, key, &pack_strings(values))
    }

    pub fn put_list(&self, table: TableId, key: &str, values: &[Vec<u8>]) -> Result<()> {
        self.put_raw(table, key, &pack_strings(values))
    }

    fn put_raw(&self, table: TableId, key: &str, value: &[u8]) -> Result<()> {
        let mut stmt = self.txn.prepare_cached(&format!(
            "INSERT INTO \"{}\" (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            self.table(table)
        ))?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    pub fn delete(&self, table: TableId, key: &str) -> Result<()> {
        let mut stmt = self
            .txn
            .prepare_cached(&format!("DELETE FROM \"{}\" WHERE key = ?1", self.table(table)))?;
        stmt.execute(params![key])?;
        Ok(())
    }
}

fn get_raw(conn: &Connection, table: &str, key: &str) -> Result<Option<Vec<u8>>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT value FROM \"{table}\" WHERE key = ?1"))?;
    let mut rows = stmt.query(params![key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

fn get_string(conn: &Connection, table: &str, key: &str) -> Result<Option<String>> {
    match get_raw(conn, table, key)? {
        None => Ok(None),
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| Error::corrupt_value(table, key, "value is not UTF-8")),
    }
}

/// A missing key reads as the empty list.
fn get_list(conn: &Connection, table: &str, key: &str) -> Result<Vec<Vec<u8>>> {
    match get_raw(conn, table, key)? {
        None => Ok(Vec::new()),
        Some(bytes) => unpack_strings(&bytes)
            .ok_or_else(|| Error::corrupt_value(table, key, "list framing is broken")),
    }
}

fn get_strings(conn: &Connection, table: &str, key: &str) -> Result<Vec<String>> {
    get_list(conn, table, key)?
        .into_iter()
        .map(|item| {
            String::from_utf8(item)
                .map_err(|_| Error::corrupt_value(table, key, "list element is not UTF-8"))
        })
        .collect()
}

fn enumerate(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT key FROM \"{table}\" ORDER BY key"))?;
    let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_fresh(dir: &TempDir) -> MetaDb {
        MetaDb::open(dir.path(), OpenMode::Create).unwrap()
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut db = open_fresh(&dir);
        let t = db.open_table("validpaths").unwrap();

        let txn = db.transaction().unwrap();
        txn.put_string(t, "/p/a", "sha256:00").unwrap();
        txn.commit().unwrap();

        assert_eq!(db.get_string(t, "/p/a").unwrap().as_deref(), Some("sha256:00"));
        assert_eq!(db.get_string(t, "/p/missing").unwrap(), None);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let mut db = open_fresh(&dir);
        let t = db.open_table("validpaths").unwrap();

        {
            let txn = db.transaction().unwrap();
            txn.put_string(t, "/p/a", "sha256:00").unwrap();
            // no commit
        }
        assert_eq!(db.get_string(t, "/p/a").unwrap(), None);
    }

    #[test]
    fn uncommitted_writes_survive_nothing_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut db = open_fresh(&dir);
            let t = db.open_table("validpaths").unwrap();
            let txn = db.transaction().unwrap();
            txn.put_string(t, "/p/half-registered", "sha256:00").unwrap();
            // Simulated crash: connection dropped mid-transaction.
        }
        let mut db = MetaDb::open(dir.path(), OpenMode::Create).unwrap();
        let t = db.open_table("validpaths").unwrap();
        assert_eq!(db.get_string(t, "/p/half-registered").unwrap(), None);
        assert_eq!(db.enumerate(t).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn string_lists() {
        let dir = TempDir::new().unwrap();
        let mut db = open_fresh(&dir);
        let t = db.open_table("references").unwrap();

        let txn = db.transaction().unwrap();
        txn.put_strings(t, "/p/a", &["/p/b", "/p/c"]).unwrap();
        txn.commit().unwrap();

        assert_eq!(db.get_strings(t, "/p/a").unwrap(), vec!["/p/b", "/p/c"]);
        assert_eq!(db.get_strings(t, "/p/none").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn enumerate_is_sorted() {
        let dir = TempDir::new().unwrap();
        let mut db = open_fresh(&dir);
        let t = db.open_table("validpaths").unwrap();

        let txn = db.transaction().unwrap();
        for key in ["/p/c", "/p/a", "/p/b"] {
            txn.put_string(t, key, "sha256:00").unwrap();
        }
        txn.commit().unwrap();

        assert_eq!(db.enumerate(t).unwrap(), vec!["/p/a", "/p/b", "/p/c"]);
    }

    #[test]
    fn schema_file_is_stamped_and_checked() {
        let dir = TempDir::new().unwrap();
        drop(open_fresh(&dir));
        let stamped = fs::read_to_string(dir.path().join("schema")).unwrap();
        assert_eq!(stamped.trim(), SCHEMA_VERSION.to_string());

        // Newer stores are refused.
        fs::write(dir.path().join("schema"), format!("{}\n", SCHEMA_VERSION + 1)).unwrap();
        assert!(matches!(
            MetaDb::open(dir.path(), OpenMode::Create),
            Err(Error::SchemaTooNew { .. })
        ));

        // Older stores are refused as legacy.
        fs::write(dir.path().join("schema"), "1\n").unwrap();
        assert!(matches!(
            MetaDb::open(dir.path(), OpenMode::Create),
            Err(Error::UnsupportedLegacySchema { found: 1 })
        ));
    }

    #[test]
    fn missing_schema_stamp_on_existing_store_is_legacy() {
        let dir = TempDir::new().unwrap();
        drop(open_fresh(&dir));
        fs::remove_file(dir.path().join("schema")).unwrap();
        assert!(matches!(
            MetaDb::open(dir.path(), OpenMode::Create),
            Err(Error::UnsupportedLegacySchema { found: 0 })
        ));
    }

    #[test]
    fn read_only_mode_refuses_writes() {
        let dir = TempDir::new().unwrap();
        {
            let mut db = open_fresh(&dir);
            db.open_table("validpaths").unwrap();
        }
        let mut db = MetaDb::open(dir.path(), OpenMode::ReadOnly).unwrap();
        let t = db.open_table("validpaths").unwrap();
        assert!(db.is_read_only());
        assert_eq!(db.get_string(t, "/p/a").unwrap(), None);
        assert!(matches!(db.transaction(), Err(Error::ReadOnly)));
    }

    #[test]
    fn corrupt_list_value_names_the_key() {
        let dir = TempDir::new().unwrap();
        let mut db = open_fresh(&dir);
        let t = db.open_table("references").unwrap();

        // Write garbage bytes directly, bypassing the codec.
        let txn = db.transaction().unwrap();
        txn.put_raw(t, "/p/bad", &[0xff, 0x01]).unwrap();
        txn.commit().unwrap();

        match db.get_strings(t, "/p/bad") {
            Err(Error::CorruptValue { key, .. }) => assert_eq!(key, "/p/bad"),
            other => panic!("expected CorruptValue, got {other:?}"),
        }
    }
}
