// ABOUTME: SQLite-backed record store for replicated feedback records
// ABOUTME: Doubles as the durable watermark store via the highest (finishDate, surveyId) row

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::watermark::{RecordId, Watermark, WatermarkSource};

/// Survey ids are canonical digit strings, so ordering by length then text is
/// numeric order without any precision limit.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    surveyId          TEXT PRIMARY KEY,
    initialFinishDate INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_watermark
    ON records (initialFinishDate DESC, length(surveyId) DESC, surveyId DESC);
"#;

/// Durable store of replicated records.
pub struct RecordStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Open (or create) the store at `path` and prepare its schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("Failed to enable WAL for record store")?;
        if let Err(e) = conn.pragma_update(None, "synchronous", "normal") {
            tracing::warn!(
                "Failed to set synchronous=normal on {}, keeping SQLite default: {}",
                path.display(),
                e
            );
        }

        Self::initialize(conn, path.to_path_buf())
    }

    /// An in-memory store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::initialize(conn, PathBuf::from(":memory:"))
    }

    fn initialize(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize record store schema")?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Insert the record, or move an existing record to its new finish date.
    pub fn upsert_record(&self, watermark: &Watermark) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO records (surveyId, initialFinishDate) VALUES (?1, ?2)
                 ON CONFLICT(surveyId) DO UPDATE SET
                    initialFinishDate = excluded.initialFinishDate",
                params![watermark.survey_id.as_str(), watermark.epoch_secs()],
            )
            .with_context(|| format!("Failed to store survey {}", watermark.survey_id))?;
        Ok(())
    }

    /// The highest stored record under the (finishDate, surveyId) order.
    pub fn highest_watermark(&self) -> Result<Option<Watermark>> {
        let row = self
            .conn()
            .query_row(
                "SELECT surveyId, initialFinishDate
                 FROM records
                 ORDER BY initialFinishDate DESC, length(surveyId) DESC, surveyId DESC
                 LIMIT 1",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .context("Failed to read highest record")?;

        match row {
            Some((survey_id, finish_date)) => {
                let survey_id = RecordId::parse(&survey_id)
                    .with_context(|| format!("Stored survey id {:?} is invalid", survey_id))?;
                Ok(Some(Watermark::from_epoch(survey_id, finish_date)?))
            }
            None => Ok(None),
        }
    }

    /// Finish date stored for a survey, if any.
    pub fn finish_date_of(&self, survey_id: &RecordId) -> Result<Option<i64>> {
        self.conn()
            .query_row(
                "SELECT initialFinishDate FROM records WHERE surveyId = ?1",
                [survey_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to look up survey {}", survey_id))
    }

    pub fn record_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .context("Failed to count records")?;
        Ok(count as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WatermarkSource for RecordStore {
    fn load_highest(&self) -> Result<Option<Watermark>> {
        self.highest_watermark()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn wm(ts: i64, id: &str) -> Watermark {
        Watermark::from_epoch(RecordId::parse(id).unwrap(), ts).unwrap()
    }

    #[test]
    fn test_empty_store_has_no_watermark() {
        let store = RecordStore::open_in_memory().unwrap();
        assert_eq!(store.highest_watermark().unwrap(), None);
        assert_eq!(store.record_count().unwrap(), 0);
    }

    #[test]
    fn test_highest_watermark_uses_timestamp_then_numeric_id() {
        let store = RecordStore::open_in_memory().unwrap();
        store.upsert_record(&wm(100, "9")).unwrap();
        store.upsert_record(&wm(100, "10")).unwrap();
        store.upsert_record(&wm(99, "500")).unwrap();

        assert_eq!(store.highest_watermark().unwrap(), Some(wm(100, "10")));
    }

    #[test]
    fn test_ids_beyond_sixty_four_bits() {
        let store = RecordStore::open_in_memory().unwrap();
        store.upsert_record(&wm(5, "18446744073709551616")).unwrap();
        store.upsert_record(&wm(5, "9223372036854775807")).unwrap();

        assert_eq!(
            store.highest_watermark().unwrap(),
            Some(wm(5, "18446744073709551616"))
        );
    }

    #[test]
    fn test_upsert_moves_existing_record() {
        let store = RecordStore::open_in_memory().unwrap();
        store.upsert_record(&wm(100, "5")).unwrap();
        store.upsert_record(&wm(200, "5")).unwrap();

        assert_eq!(store.record_count().unwrap(), 1);
        let id = RecordId::parse("5").unwrap();
        assert_eq!(store.finish_date_of(&id).unwrap(), Some(200));
    }

    #[test]
    fn test_file_store_uses_wal_with_normal_sync() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("records.db")).unwrap();

        let conn = store.conn();
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        let synchronous: i64 = conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();

        assert_eq!(journal_mode, "wal");
        // 1 = NORMAL
        assert_eq!(synchronous, 1);
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("records.db");

        {
            let store = RecordStore::open(&path).unwrap();
            store.upsert_record(&wm(100, "6")).unwrap();
            assert_eq!(store.path(), path.as_path());
        }

        let store = RecordStore::open(&path).unwrap();
        assert_eq!(store.load_highest().unwrap(), Some(wm(100, "6")));
    }
}
