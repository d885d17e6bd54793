use super::models::{DailyCount, FlushRun};
use super::schema::DOWNLOAD_STATS_VERSIONED_SCHEMAS;
use super::DownloadStatsStore;
use crate::counters::DAY_FORMAT;
use crate::sqlite_persistence::open_versioned;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

pub struct SqliteDownloadStatsStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDownloadStatsStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(
            db_path.as_ref(),
            DOWNLOAD_STATS_VERSIONED_SCHEMAS,
            "download stats",
        )?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to enable WAL mode")?;
        debug!("Download stats database journal mode: {}", mode);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("download stats connection lock poisoned"))
    }

    fn format_day(day: NaiveDate) -> String {
        day.format(DAY_FORMAT).to_string()
    }

    fn parse_datetime(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }
}

impl DownloadStatsStore for SqliteDownloadStatsStore {
    fn record_daily_counts(&self, counts: &[DailyCount]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO download_stats (entity_id, day, count)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(entity_id, day) DO UPDATE SET
                    count = excluded.count,
                    updated_at = cast(strftime('%s','now') as int)
                 WHERE excluded.count > download_stats.count",
            )?;
            for row in counts {
                written += stmt.execute(params![
                    row.entity_id,
                    Self::format_day(row.day),
                    row.count
                ])?;
            }
        }
        tx.commit()?;
        debug!("Recorded {} of {} daily counts", written, counts.len());
        Ok(written)
    }

    fn get_daily_count(&self, entity_id: &str, day: NaiveDate) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let count = conn
            .query_row(
                "SELECT count FROM download_stats WHERE entity_id = ?1 AND day = ?2",
                params![entity_id, Self::format_day(day)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count)
    }

    fn get_entity_total(&self, entity_id: &str, from: NaiveDate, to: NaiveDate) -> Result<i64> {
        let conn = self.conn()?;
        let total = conn.query_row(
            "SELECT COALESCE(SUM(count), 0) FROM download_stats
             WHERE entity_id = ?1 AND day >= ?2 AND day <= ?3",
            params![entity_id, Self::format_day(from), Self::format_day(to)],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    fn top_entities(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        limit: usize,
    ) -> Result<Vec<(String, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT entity_id, SUM(count) AS total FROM download_stats
             WHERE day >= ?1 AND day <= ?2
             GROUP BY entity_id
             ORDER BY total DESC, entity_id ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![Self::format_day(from), Self::format_day(to), limit as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;
        Ok(rows)
    }

    fn row_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM download_stats", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn record_flush_run(&self, run: &FlushRun) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO flush_runs (started_at, finished_at, keys_scanned, rows_written)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                run.started_at.to_rfc3339(),
                run.finished_at.to_rfc3339(),
                run.keys_scanned as i64,
                run.rows_written as i64
            ],
        )?;
        Ok(())
    }

    fn recent_flush_runs(&self, limit: usize) -> Result<Vec<FlushRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT started_at, finished_at, keys_scanned, rows_written FROM flush_runs
             ORDER BY id DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], |row| {
                let started_at: String = row.get(0)?;
                let finished_at: String = row.get(1)?;
                Ok(FlushRun {
                    started_at: Self::parse_datetime(&started_at),
                    finished_at: Self::parse_datetime(&finished_at),
                    keys_scanned: row.get::<_, i64>(2)? as usize,
                    rows_written: row.get::<_, i64>(3)? as usize,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn close(&self) {
        match self.conn() {
            Ok(conn) => {
                if let Err(e) =
                    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE);", [], |_| Ok(()))
                {
                    warn!("Failed to checkpoint download stats database: {}", e);
                }
            }
            Err(e) => warn!("Failed to close download stats database: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_persistence::BASE_DB_VERSION;
    use tempfile::TempDir;

    fn create_tmp_store() -> (SqliteDownloadStatsStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("download_stats.db");
        let store = SqliteDownloadStatsStore::new(&db_path).unwrap();
        (store, temp_dir)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn count(entity: &str, d: u32, count: i64) -> DailyCount {
        DailyCount {
            entity_id: entity.to_string(),
            day: day(d),
            count,
        }
    }

    #[test]
    fn test_record_is_idempotent() {
        let (store, _dir) = create_tmp_store();
        let batch = vec![count("a", 1, 5), count("b", 1, 3)];

        assert_eq!(store.record_daily_counts(&batch).unwrap(), 2);
        assert_eq!(store.record_daily_counts(&batch).unwrap(), 0);
        assert_eq!(store.row_count().unwrap(), 2);
        assert_eq!(store.get_daily_count("a", day(1)).unwrap(), Some(5));
    }

    #[test]
    fn test_larger_snapshot_replaces_smaller_never_the_reverse() {
        let (store, _dir) = create_tmp_store();
        store.record_daily_counts(&[count("a", 1, 5)]).unwrap();
        assert_eq!(store.record_daily_counts(&[count("a", 1, 8)]).unwrap(), 1);
        assert_eq!(store.record_daily_counts(&[count("a", 1, 2)]).unwrap(), 0);
        assert_eq!(store.get_daily_count("a", day(1)).unwrap(), Some(8));
    }

    #[test]
    fn test_totals_and_top_entities() {
        let (store, _dir) = create_tmp_store();
        store
            .record_daily_counts(&[
                count("a", 1, 5),
                count("a", 2, 5),
                count("b", 1, 7),
                count("c", 9, 100),
            ])
            .unwrap();

        assert_eq!(store.get_entity_total("a", day(1), day(3)).unwrap(), 10);
        assert_eq!(store.get_entity_total("missing", day(1), day(3)).unwrap(), 0);
        assert_eq!(
            store.top_entities(day(1), day(3), 5).unwrap(),
            vec![("a".to_string(), 10), ("b".to_string(), 7)]
        );
    }

    #[test]
    fn test_flush_runs_history() {
        let (store, _dir) = create_tmp_store();
        let now = Utc::now();
        for rows in [1, 2, 3] {
            store
                .record_flush_run(&FlushRun {
                    started_at: now,
                    finished_at: now,
                    keys_scanned: 10,
                    rows_written: rows,
                })
                .unwrap();
        }
        let runs = store.recent_flush_runs(2).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].rows_written, 3);
        assert_eq!(runs[1].rows_written, 2);
    }

    #[test]
    fn test_reopen_existing_database() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("download_stats.db");
        {
            let store = SqliteDownloadStatsStore::new(&db_path).unwrap();
            store.record_daily_counts(&[count("a", 1, 1)]).unwrap();
            store.close();
        }
        let store = SqliteDownloadStatsStore::new(&db_path).unwrap();
        assert_eq!(store.row_count().unwrap(), 1);
    }

    #[test]
    fn test_migrates_version_one_database() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("download_stats.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            DOWNLOAD_STATS_VERSIONED_SCHEMAS[0].create(&conn).unwrap();
        }

        let store = SqliteDownloadStatsStore::new(&db_path).unwrap();
        let now = Utc::now();
        store
            .record_flush_run(&FlushRun {
                started_at: now,
                finished_at: now,
                keys_scanned: 0,
                rows_written: 0,
            })
            .unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version as usize, BASE_DB_VERSION + 2);
    }

    #[test]
    fn test_rejects_foreign_database() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("other.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute("CREATE TABLE other (id INTEGER)", []).unwrap();
        }
        assert!(SqliteDownloadStatsStore::new(&db_path).is_err());
    }
}
