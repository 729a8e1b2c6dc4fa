//! C3 — Index: persistent fingerprint → (Message-ID, path, origin) mapping.

use std::path::Path;

use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

/// One row of the index, as described in spec §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub timestamp: i64,
    pub fingerprint: String,
    pub message_id: String,
    pub path: String,
    pub origin: String,
}

/// A persistent key-value store keyed by fingerprint, backed by SQLite.
/// Writes are serialized through an internal mutex so multiple worker
/// threads can share one `Index` safely (spec §4.3/§5).
pub struct Index {
    conn: Mutex<Connection>,
}

impl Index {
    /// Opens (creating if necessary) the index at `path`, creating its
    /// schema on first run. A fresh store is indistinguishable from a
    /// non-fresh one except by the existence of the backing file beforehand
    /// — `CREATE TABLE IF NOT EXISTS` makes both paths converge safely.
    pub fn open(path: &str) -> anyhow::Result<Index> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open index at {path:?}"))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                timestamp   INTEGER NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE,
                message_id  TEXT NOT NULL UNIQUE,
                path        TEXT NOT NULL,
                origin      TEXT NOT NULL
            )",
            params![],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_fingerprint ON messages(fingerprint)",
            params![],
        )?;
        Ok(Index {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory index for tests and dry-run scratch computations.
    pub fn open_in_memory() -> anyhow::Result<Index> {
        Self::open(":memory:")
    }

    /// Atomically inserts `row`. A unique violation on fingerprint or
    /// message_id returns an error without a partial write.
    pub fn insert(&self, row: &IndexRow) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (timestamp, fingerprint, message_id, path, origin)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.timestamp,
                row.fingerprint,
                row.message_id,
                row.path,
                row.origin
            ],
        )
        .with_context(|| format!("failed to insert index row for {}", row.fingerprint))?;
        Ok(())
    }

    /// Point lookup by fingerprint.
    pub fn find(&self, fingerprint: &str) -> anyhow::Result<Option<IndexRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT timestamp, fingerprint, message_id, path, origin
             FROM messages WHERE fingerprint = ?1",
            params![fingerprint],
            |row| {
                Ok(IndexRow {
                    timestamp: row.get(0)?,
                    fingerprint: row.get(1)?,
                    message_id: row.get(2)?,
                    path: row.get(3)?,
                    origin: row.get(4)?,
                })
            },
        )
        .optional()
        .context("index lookup failed")
    }

    /// Idempotent delete: deleting a missing row returns success.
    pub fn delete(&self, fingerprint: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM messages WHERE fingerprint = ?1",
            params![fingerprint],
        )
        .context("index delete failed")?;
        Ok(())
    }

    /// Full scan.
    pub fn list_all(&self) -> anyhow::Result<Vec<IndexRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, fingerprint, message_id, path, origin FROM messages",
        )?;
        let rows = stmt
            .query_map(params![], |row| {
                Ok(IndexRow {
                    timestamp: row.get(0)?,
                    fingerprint: row.get(1)?,
                    message_id: row.get(2)?,
                    path: row.get(3)?,
                    origin: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(fp: &str) -> IndexRow {
        IndexRow {
            timestamp: 1000,
            fingerprint: fp.to_owned(),
            message_id: format!("<{fp}@x>"),
            path: format!("/mail/{fp}"),
            origin: "s1".to_owned(),
        }
    }

    #[test]
    fn insert_then_find_round_trips() {
        let index = Index::open_in_memory().unwrap();
        let row = sample("abc123");
        index.insert(&row).unwrap();
        assert_eq!(index.find("abc123").unwrap(), Some(row));
    }

    #[test]
    fn find_missing_is_none() {
        let index = Index::open_in_memory().unwrap();
        assert_eq!(index.find("nope").unwrap(), None);
    }

    #[test]
    fn duplicate_fingerprint_insert_fails_without_partial_write() {
        let index = Index::open_in_memory().unwrap();
        index.insert(&sample("dup")).unwrap();
        let mut second = sample("dup");
        second.message_id = "<different@x>".to_owned();
        assert!(index.insert(&second).is_err());
        // the original row must be untouched
        assert_eq!(index.find("dup").unwrap().unwrap().message_id, "<dup@x>");
    }

    #[test]
    fn duplicate_message_id_insert_fails() {
        let index = Index::open_in_memory().unwrap();
        index.insert(&sample("a")).unwrap();
        let mut second = sample("b");
        second.message_id = "<a@x>".to_owned();
        assert!(index.insert(&second).is_err());
    }

    #[test]
    fn delete_is_idempotent() {
        let index = Index::open_in_memory().unwrap();
        index.insert(&sample("gone")).unwrap();
        index.delete("gone").unwrap();
        assert_eq!(index.find("gone").unwrap(), None);
        // deleting again must not error
        index.delete("gone").unwrap();
    }

    #[test]
    fn list_all_returns_full_scan() {
        let index = Index::open_in_memory().unwrap();
        index.insert(&sample("a")).unwrap();
        index.insert(&sample("b")).unwrap();
        let mut all = index.list_all().unwrap();
        all.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].fingerprint, "a");
        assert_eq!(all[1].fingerprint, "b");
    }

    #[test]
    fn concurrent_writers_are_serialized() {
        use std::sync::Arc;
        let index = Arc::new(Index::open_in_memory().unwrap());
        let mut handles = Vec::new();
        for i in 0..8 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                index.insert(&sample(&format!("t{i}"))).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(index.list_all().unwrap().len(), 8);
    }
}
