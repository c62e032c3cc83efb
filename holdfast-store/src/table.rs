//! Durable blob table: one SQLite table mapping `i64` ids to raw bytes.
//!
//! Each repository owns one logical table inside one database file. SQLite
//! connections are not shared across threads; every OS thread that touches
//! a table opens its own connection lazily and caches it in thread-local
//! storage, so repeated opens are idempotent.

use crate::error::{StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);
const MMAP_SIZE_BYTES: i64 = 256 * 1024 * 1024;

thread_local! {
    /// Per-thread connection cache keyed by `(database path, table name)`.
    static CONNECTIONS: RefCell<HashMap<(PathBuf, String), Rc<Connection>>> =
        RefCell::new(HashMap::new());
}

/// Handle to one logical id-to-bytes table inside a SQLite file.
///
/// Cloning is cheap and clones address the same table; connections are
/// opened per OS thread on first use. The table is created automatically.
#[derive(Debug, Clone)]
pub struct BlobTable {
    path: PathBuf,
    table: String,
}

impl BlobTable {
    /// Create a handle for `table` inside the database at `path`.
    ///
    /// The table name is sanitized to `[A-Za-z0-9_]`; an empty name
    /// becomes `entities`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, table: &str) -> Self {
        Self { path: path.into(), table: sanitize_table_name(table) }
    }

    /// The sanitized table name used in SQL.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Load the raw blob stored for `id`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn load(&self, id: i64) -> StoreResult<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT raw FROM {} WHERE id = ?1", self.table);
            let raw = conn
                .query_row(&sql, params![id], |row| row.get::<_, Vec<u8>>(0))
                .optional()?;
            Ok(raw)
        })
    }

    /// Insert or replace the blob stored for `id`.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert(&self, id: i64, raw: &[u8]) -> StoreResult<()> {
        self.with_conn(|conn| {
            let sql = format!("INSERT OR REPLACE INTO {}(id, raw) VALUES (?1, ?2)", self.table);
            conn.execute(&sql, params![id, raw])?;
            Ok(())
        })
    }

    /// Delete the row for `id`, reporting whether a row was actually
    /// removed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn remove(&self, id: i64) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let sql = format!("DELETE FROM {} WHERE id = ?1", self.table);
            Ok(conn.execute(&sql, params![id])? > 0)
        })
    }

    /// Delete every row in the table.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn remove_all(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(&format!("DELETE FROM {}", self.table), [])?;
            Ok(())
        })
    }

    /// Load several rows inside one read transaction for locality.
    ///
    /// Missing ids are skipped; the result preserves the order of `ids`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn load_many(&self, ids: &[i64]) -> StoreResult<Vec<(i64, Vec<u8>)>> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let sql = format!("SELECT raw FROM {} WHERE id = ?1", self.table);
            let mut out = Vec::with_capacity(ids.len());
            {
                let mut stmt = tx.prepare(&sql)?;
                for &id in ids {
                    let raw: Option<Vec<u8>> =
                        stmt.query_row(params![id], |row| row.get(0)).optional()?;
                    if let Some(raw) = raw {
                        out.push((id, raw));
                    }
                }
            }
            tx.commit()?;
            Ok(out)
        })
    }

    /// Number of rows currently stored.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn rows(&self) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let sql = format!("SELECT COUNT(*) FROM {}", self.table);
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count.unsigned_abs())
        })
    }

    fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> StoreResult<R>) -> StoreResult<R> {
        CONNECTIONS.with(|cache| {
            let key = (self.path.clone(), self.table.clone());
            let cached = cache.borrow().get(&key).map(Rc::clone);
            let conn = match cached {
                Some(conn) => conn,
                None => {
                    let conn = Rc::new(self.open()?);
                    cache.borrow_mut().insert(key, Rc::clone(&conn));
                    conn
                },
            };
            f(&conn)
        })
    }

    fn open(&self) -> StoreResult<Connection> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                    path: dir.display().to_string(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(&self.path).map_err(|source| StoreError::Open {
            path: self.path.display().to_string(),
            source,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // Read-mostly workload with decent write concurrency.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "mmap_size", MMAP_SIZE_BYTES)?;

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {}(id INTEGER PRIMARY KEY, raw BLOB NOT NULL)",
            self.table
        ))?;

        debug!(path = %self.path.display(), table = %self.table, "opened blob table connection");
        Ok(conn)
    }
}

fn sanitize_table_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() {
        out.push_str("entities");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn scratch_table(name: &str) -> (TempDir, BlobTable) {
        let dir = TempDir::new().unwrap();
        let table = BlobTable::new(dir.path().join("store.db"), name);
        (dir, table)
    }

    #[test]
    fn test_load_missing_row() {
        let (_dir, table) = scratch_table("items");
        assert_eq!(table.load(1).unwrap(), None);
    }

    #[test]
    fn test_upsert_load_replace() {
        let (_dir, table) = scratch_table("items");
        table.upsert(1, b"first").unwrap();
        assert_eq!(table.load(1).unwrap().as_deref(), Some(b"first".as_ref()));

        table.upsert(1, b"second").unwrap();
        assert_eq!(table.load(1).unwrap().as_deref(), Some(b"second".as_ref()));
        assert_eq!(table.rows().unwrap(), 1);
    }

    #[test]
    fn test_remove_reports_whether_row_existed() {
        let (_dir, table) = scratch_table("items");
        table.upsert(9, b"x").unwrap();

        assert!(table.remove(9).unwrap());
        assert!(!table.remove(9).unwrap());
        assert_eq!(table.load(9).unwrap(), None);
    }

    #[test]
    fn test_remove_all() {
        let (_dir, table) = scratch_table("items");
        for id in 0..5 {
            table.upsert(id, b"row").unwrap();
        }
        table.remove_all().unwrap();
        assert_eq!(table.rows().unwrap(), 0);
    }

    #[test]
    fn test_load_many_skips_missing() {
        let (_dir, table) = scratch_table("items");
        table.upsert(1, b"a").unwrap();
        table.upsert(3, b"c").unwrap();

        let loaded = table.load_many(&[1, 2, 3]).unwrap();
        assert_eq!(loaded, vec![(1, b"a".to_vec()), (3, b"c".to_vec())]);
    }

    #[test]
    fn test_two_tables_in_one_file_are_independent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let left = BlobTable::new(&path, "left");
        let right = BlobTable::new(&path, "right");

        left.upsert(1, b"l").unwrap();
        right.upsert(1, b"r").unwrap();

        assert_eq!(left.load(1).unwrap().as_deref(), Some(b"l".as_ref()));
        assert_eq!(right.load(1).unwrap().as_deref(), Some(b"r".as_ref()));
    }

    #[test]
    fn test_sanitize_defaults_empty_name() {
        assert_eq!(sanitize_table_name(""), "entities");
        assert_eq!(sanitize_table_name("orders-2024"), "orders_2024");
    }

    proptest! {
        #[test]
        fn prop_sanitized_names_are_safe(name in ".*") {
            let sanitized = sanitize_table_name(&name);
            prop_assert!(!sanitized.is_empty());
            prop_assert!(sanitized.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        }
    }
}
