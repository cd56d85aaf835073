//! Materialization store - SQLite-backed storage of bucket aggregates
//!
//! One database per continuous aggregate. Each row holds the partial states of
//! one `(bucket, group)` as a bincode blob, so merging materialized rows with
//! freshly aggregated ones stays exact. The watermark and the definition the
//! rows were computed with live in a small `meta` table beside them.

use crate::aggregate::bucket::{BucketKey, BucketRow};
use crate::aggregate::error::{AggregateError, AggregateResult};
use crate::aggregate::function::AggState;
use crate::storage::TimeRange;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};

const WATERMARK_KEY: &str = "watermark";
const DEFINITION_KEY: &str = "definition";

/// SQLite-backed store of materialized bucket rows
pub struct MaterializedStore {
    conn: Connection,
    path: PathBuf,
}

impl MaterializedStore {
    /// Create or open a store
    pub fn open(path: impl AsRef<Path>) -> AggregateResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(crate::storage::StorageError::from)?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS buckets (
                bucket INTEGER NOT NULL,
                group_key BLOB NOT NULL,
                states BLOB NOT NULL,
                PRIMARY KEY (bucket, group_key)
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write or overwrite one row
    pub fn upsert(&mut self, row: &BucketRow) -> AggregateResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO buckets (bucket, group_key, states) VALUES (?, ?, ?)",
            params![
                row.key.bucket,
                bincode::serialize(&row.key.group)?,
                bincode::serialize(&row.states)?
            ],
        )?;
        Ok(())
    }

    /// Rows whose bucket start lies in the range, sorted by bucket then group
    pub fn read(&self, range: &TimeRange) -> AggregateResult<Vec<BucketRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT bucket, group_key, states FROM buckets
             WHERE bucket >= ? AND bucket < ?
             ORDER BY bucket",
        )?;
        let raw = stmt
            .query_map(params![range.start, range.end], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = raw
            .into_iter()
            .map(|(bucket, group, states)| {
                Ok(BucketRow {
                    key: BucketKey {
                        bucket,
                        group: bincode::deserialize(&group)?,
                    },
                    states: bincode::deserialize::<Vec<AggState>>(&states)?,
                })
            })
            .collect::<AggregateResult<Vec<_>>>()?;
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }

    /// Atomically replace every row in the range with `rows`
    ///
    /// Returns the number of rows deleted. Rows outside the range are rejected
    /// before anything changes.
    pub fn replace_range(&mut self, range: &TimeRange, rows: &[BucketRow]) -> AggregateResult<usize> {
        if let Some(stray) = rows.iter().find(|r| !range.contains(r.key.bucket)) {
            return Err(AggregateError::InvalidDefinition(format!(
                "bucket {} lies outside the replaced range {}",
                stray.key.bucket, range
            )));
        }

        let tx = self.conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM buckets WHERE bucket >= ? AND bucket < ?",
            params![range.start, range.end],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO buckets (bucket, group_key, states) VALUES (?, ?, ?)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.key.bucket,
                    bincode::serialize(&row.key.group)?,
                    bincode::serialize(&row.states)?
                ])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Total number of materialized rows
    pub fn row_count(&self) -> AggregateResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM buckets", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Delete every materialized row and the watermark
    pub fn clear(&mut self) -> AggregateResult<()> {
        self.conn.execute_batch(
            "DELETE FROM buckets;
             DELETE FROM meta WHERE key = 'watermark';",
        )?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> AggregateResult<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| row.get(0))
            .optional()?)
    }

    fn set_meta(&self, key: &str, value: &str) -> AggregateResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Persisted watermark, `None` when nothing has been materialized
    pub fn load_watermark(&self) -> AggregateResult<Option<i64>> {
        match self.get_meta(WATERMARK_KEY)? {
            Some(value) => value.parse().map(Some).map_err(|e| {
                AggregateError::Serialization(format!("Invalid stored watermark '{}': {}", value, e))
            }),
            None => Ok(None),
        }
    }

    pub fn save_watermark(&self, watermark: i64) -> AggregateResult<()> {
        self.set_meta(WATERMARK_KEY, &watermark.to_string())
    }

    /// Fingerprint of the definition the stored rows were computed with
    pub fn load_definition(&self) -> AggregateResult<Option<String>> {
        self.get_meta(DEFINITION_KEY)
    }

    pub fn save_definition(&self, fingerprint: &str) -> AggregateResult<()> {
        self.set_meta(DEFINITION_KEY, fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(bucket: i64, device: &str, steps: f64) -> BucketRow {
        BucketRow {
            key: BucketKey {
                bucket,
                group: vec![Some(device.to_string())],
            },
            states: vec![AggState::Sum(Some(steps)), AggState::Count(1)],
        }
    }

    #[test]
    fn test_upsert_and_read() {
        let dir = tempdir().unwrap();
        let mut store = MaterializedStore::open(dir.path().join("daily.db")).unwrap();

        store.upsert(&row(0, "watch_b", 10.0)).unwrap();
        store.upsert(&row(0, "watch_a", 20.0)).unwrap();
        store.upsert(&row(100, "watch_a", 30.0)).unwrap();
        // Overwrite by key
        store.upsert(&row(0, "watch_a", 25.0)).unwrap();

        let rows = store.read(&TimeRange::all()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], row(0, "watch_a", 25.0));
        assert_eq!(rows[1], row(0, "watch_b", 10.0));

        assert_eq!(store.read(&TimeRange::new(50, 150)).unwrap().len(), 1);
        assert_eq!(store.row_count().unwrap(), 3);
    }

    #[test]
    fn test_replace_range() {
        let dir = tempdir().unwrap();
        let mut store = MaterializedStore::open(dir.path().join("daily.db")).unwrap();
        for bucket in [0, 100, 200] {
            store.upsert(&row(bucket, "watch_a", 1.0)).unwrap();
        }

        let deleted = store
            .replace_range(&TimeRange::new(100, 300), &[row(100, "watch_a", 5.0)])
            .unwrap();
        assert_eq!(deleted, 2);

        let rows = store.read(&TimeRange::all()).unwrap();
        assert_eq!(rows, vec![row(0, "watch_a", 1.0), row(100, "watch_a", 5.0)]);

        // Stray rows abort without changes
        assert!(store
            .replace_range(&TimeRange::new(0, 100), &[row(100, "watch_a", 9.0)])
            .is_err());
        assert_eq!(store.row_count().unwrap(), 2);
    }

    #[test]
    fn test_watermark_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daily.db");
        {
            let store = MaterializedStore::open(&path).unwrap();
            assert_eq!(store.load_watermark().unwrap(), None);
            store.save_watermark(86_400_000).unwrap();
            store.save_definition("v1").unwrap();
        }

        let mut store = MaterializedStore::open(&path).unwrap();
        assert_eq!(store.load_watermark().unwrap(), Some(86_400_000));
        assert_eq!(store.load_definition().unwrap().as_deref(), Some("v1"));

        store.clear().unwrap();
        assert_eq!(store.load_watermark().unwrap(), None);
        assert_eq!(store.load_definition().unwrap().as_deref(), Some("v1"));
    }
}
