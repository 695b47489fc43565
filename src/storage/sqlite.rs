// storage/sqlite.rs — Durable result store.
// Single-writer append over one SQLite connection in WAL mode.
// Readers get consistent snapshots; cleanup vacuums to reclaim
// space.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{DatabaseInfo, Storage};
use crate::errors::MonitorError;
use crate::types::{CheckResult, ServiceStats, StoredRecord};

pub struct SqliteStorage {
    conn: Mutex<Connection>,
    path: String,
}

/// Timestamps are stored as fixed-width RFC 3339 text so that SQL
/// range comparisons work lexicographically.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, MonitorError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MonitorError::storage(format!("bad timestamp '{raw}' in store: {e}")))
}

impl SqliteStorage {
    /// Open (or create) the database and ensure schema + indexes.
    pub fn open(path: &str) -> Result<Self, MonitorError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    MonitorError::storage(format!("could not create {}: {e}", parent.display()))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS check_results (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                name             TEXT    NOT NULL,
                url              TEXT    NOT NULL,
                check_type       TEXT    NOT NULL,
                status           INTEGER NOT NULL,
                error            TEXT,
                response_time_ms INTEGER NOT NULL,
                status_code      INTEGER,
                body_size        INTEGER,
                timestamp        TEXT    NOT NULL,
                created_at       TEXT    NOT NULL
            );

            CREATE TABLE IF NOT EXISTS service_metadata (
                name        TEXT PRIMARY KEY,
                url         TEXT NOT NULL,
                check_type  TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_check_results_name
                ON check_results (name);
            CREATE INDEX IF NOT EXISTS idx_check_results_timestamp
                ON check_results (timestamp);
            CREATE INDEX IF NOT EXISTS idx_check_results_name_timestamp
                ON check_results (name, timestamp);
            CREATE INDEX IF NOT EXISTS idx_check_results_status
                ON check_results (status);
            CREATE INDEX IF NOT EXISTS idx_check_results_created_at
                ON check_results (created_at);
            ",
        )?;

        info!(path = path, "sqlite store opened");
        Ok(SqliteStorage {
            conn: Mutex::new(conn),
            path: path.to_string(),
        })
    }
}

impl Storage for SqliteStorage {
    fn save_result(&self, result: &CheckResult) -> Result<(), MonitorError> {
        let check_type = super::infer_check_type(result);
        let now = fmt_ts(Utc::now());

        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            "INSERT INTO check_results (
                name, url, check_type, status, error, response_time_ms,
                status_code, body_size, timestamp, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                result.name,
                result.url,
                check_type,
                result.status.as_i64(),
                result.error,
                result.response_time.as_millis() as i64,
                result.status_code.map(i64::from),
                result.body_size as i64,
                fmt_ts(result.timestamp),
                now,
            ],
        )?;

        conn.execute(
            "INSERT INTO service_metadata (name, url, check_type, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(name) DO UPDATE SET
                url = excluded.url,
                check_type = excluded.check_type,
                updated_at = excluded.updated_at",
            params![result.name, result.url, check_type, now],
        )?;

        Ok(())
    }

    fn get_service_stats(
        &self,
        name: &str,
        since: DateTime<Utc>,
    ) -> Result<ServiceStats, MonitorError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let row = conn
            .query_row(
                "SELECT
                    name,
                    url,
                    check_type,
                    COUNT(*),
                    SUM(CASE WHEN status = 0 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status != 0 THEN 1 ELSE 0 END),
                    AVG(response_time_ms),
                    MIN(response_time_ms),
                    MAX(response_time_ms),
                    MAX(timestamp),
                    MAX(CASE WHEN status = 0 THEN timestamp END),
                    MAX(CASE WHEN status != 0 THEN timestamp END)
                 FROM check_results
                 WHERE name = ?1 AND timestamp >= ?2
                 GROUP BY name, url, check_type",
                params![name, fmt_ts(since)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, Option<String>>(11)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            name,
            url,
            check_type,
            total,
            successful,
            failed,
            avg_rt,
            min_rt,
            max_rt,
            last_check,
            last_success,
            last_failure,
        )) = row
        else {
            return Err(MonitorError::storage(format!(
                "no data found for service {name} since {since}"
            )));
        };

        let uptime_percent = if total > 0 {
            (successful as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        Ok(ServiceStats {
            name,
            url,
            check_type,
            total_checks: total,
            successful_checks: successful,
            failed_checks: failed,
            avg_response_time_ms: avg_rt,
            min_response_time_ms: min_rt,
            max_response_time_ms: max_rt,
            uptime_percent,
            last_check: last_check.as_deref().map(parse_ts).transpose()?,
            last_success: last_success.as_deref().map(parse_ts).transpose()?,
            last_failure: last_failure.as_deref().map(parse_ts).transpose()?,
        })
    }

    fn get_all_service_stats(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ServiceStats>, MonitorError> {
        let names: Vec<String> = {
            let conn = self.conn.lock().expect("sqlite lock poisoned");
            let mut stmt = conn.prepare("SELECT name FROM service_metadata ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut all = Vec::with_capacity(names.len());
        for name in names {
            match self.get_service_stats(&name, since) {
                Ok(stats) => all.push(stats),
                Err(e) => debug!(service = %name, "no stats in window: {e}"),
            }
        }
        Ok(all)
    }

    fn get_service_history(
        &self,
        name: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, MonitorError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, url, check_type, status, error, response_time_ms,
                    status_code, body_size, timestamp, created_at
             FROM check_results
             WHERE name = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![name, fmt_ts(since), limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<i64>>(7)?,
                row.get::<_, Option<i64>>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (
                id,
                name,
                url,
                check_type,
                status,
                error,
                response_time_ms,
                status_code,
                body_size,
                timestamp,
                created_at,
            ) = row?;
            records.push(StoredRecord {
                id,
                name,
                url,
                check_type,
                status,
                error,
                response_time_ms,
                status_code,
                body_size: body_size.unwrap_or(0),
                timestamp: parse_ts(&timestamp)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(records)
    }

    fn cleanup_old_data(&self, max_age: Duration) -> Result<u64, MonitorError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| MonitorError::storage(format!("bad max_age: {e}")))?;

        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let removed = conn.execute(
            "DELETE FROM check_results WHERE created_at < ?1",
            params![fmt_ts(cutoff)],
        )? as u64;

        if removed > 0 {
            info!(removed, max_age = ?max_age, "cleaned up old check results");
            if let Err(e) = conn.execute_batch("VACUUM") {
                warn!("vacuum after cleanup failed: {e}");
            }
        }

        Ok(removed)
    }

    fn database_info(&self) -> Result<DatabaseInfo, MonitorError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");

        let total_records: i64 =
            conn.query_row("SELECT COUNT(*) FROM check_results", [], |r| r.get(0))?;
        let total_services: i64 =
            conn.query_row("SELECT COUNT(*) FROM service_metadata", [], |r| r.get(0))?;

        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;

        let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(created_at), MAX(created_at) FROM check_results",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        Ok(DatabaseInfo {
            storage_type: "sqlite",
            path: self.path.clone(),
            total_records,
            total_services,
            database_size_bytes: Some(page_count * page_size),
            memory_usage_bytes: None,
            oldest_record: oldest.as_deref().map(parse_ts).transpose()?,
            newest_record: newest.as_deref().map(parse_ts).transpose()?,
        })
    }

    fn close(&self) -> Result<(), MonitorError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        // The checkpoint pragma reports (busy, log, checkpointed);
        // only the side effect matters here.
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;
    use std::collections::HashMap;

    fn result(name: &str, status: Status, rt_ms: u64) -> CheckResult {
        CheckResult {
            name: name.to_string(),
            url: "https://api.example.com/health".to_string(),
            status,
            error: None,
            response_time: Duration::from_millis(rt_ms),
            status_code: Some(200),
            timestamp: Utc::now(),
            headers: HashMap::new(),
            body_size: 128,
            cert_info: None,
        }
    }

    fn open_temp() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStorage::open(dir.path().join("t.db").to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_and_history_roundtrip() {
        let (_dir, store) = open_temp();
        let saved = result("api", Status::Up, 42);
        store.save_result(&saved).unwrap();

        let since = Utc::now() - chrono::Duration::minutes(1);
        let history = store.get_service_history("api", since, 10).unwrap();
        assert_eq!(history.len(), 1);

        let rec = &history[0];
        assert_eq!(rec.name, "api");
        assert_eq!(rec.status, Status::Up.as_i64());
        assert_eq!(rec.response_time_ms, 42);
        assert_eq!(rec.status_code, Some(200));
        assert_eq!(rec.check_type, "http");
        assert!(rec.timestamp <= rec.created_at);
    }

    #[test]
    fn test_stats_aggregation() {
        let (_dir, store) = open_temp();
        store.save_result(&result("api", Status::Up, 10)).unwrap();
        store.save_result(&result("api", Status::Up, 30)).unwrap();
        store.save_result(&result("api", Status::Down, 500)).unwrap();

        let since = Utc::now() - chrono::Duration::minutes(1);
        let stats = store.get_service_stats("api", since).unwrap();
        assert_eq!(stats.total_checks, 3);
        assert_eq!(stats.successful_checks, 2);
        assert_eq!(stats.failed_checks, 1);
        assert_eq!(stats.min_response_time_ms, 10);
        assert_eq!(stats.max_response_time_ms, 500);
        assert!((stats.uptime_percent - 66.666).abs() < 0.01);
        assert!(stats.last_success.is_some());
        assert!(stats.last_failure.is_some());
    }

    #[test]
    fn test_stats_error_when_no_data() {
        let (_dir, store) = open_temp();
        let since = Utc::now() - chrono::Duration::minutes(1);
        assert!(store.get_service_stats("ghost", since).is_err());
    }

    #[test]
    fn test_all_stats_sorted_by_name() {
        let (_dir, store) = open_temp();
        store.save_result(&result("zeta", Status::Up, 10)).unwrap();
        store.save_result(&result("alpha", Status::Up, 10)).unwrap();

        let since = Utc::now() - chrono::Duration::minutes(1);
        let all = store.get_all_service_stats(since).unwrap();
        let names: Vec<_> = all.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_cleanup_removes_only_old_records() {
        let (_dir, store) = open_temp();
        store.save_result(&result("api", Status::Up, 10)).unwrap();

        // Nothing is older than an hour yet.
        assert_eq!(store.cleanup_old_data(Duration::from_secs(3600)).unwrap(), 0);
        // Everything is older than zero seconds.
        assert_eq!(store.cleanup_old_data(Duration::ZERO).unwrap(), 1);

        let info = store.database_info().unwrap();
        assert_eq!(info.total_records, 0);
        // Metadata survives cleanup.
        assert_eq!(info.total_services, 1);
    }

    #[test]
    fn test_metadata_updated_at_refreshes() {
        let (_dir, store) = open_temp();
        store.save_result(&result("api", Status::Up, 10)).unwrap();
        let first: String = {
            let conn = store.conn.lock().unwrap();
            conn.query_row(
                "SELECT updated_at FROM service_metadata WHERE name='api'",
                [],
                |r| r.get(0),
            )
            .unwrap()
        };

        std::thread::sleep(Duration::from_millis(5));
        store.save_result(&result("api", Status::Down, 10)).unwrap();
        let second: String = {
            let conn = store.conn.lock().unwrap();
            conn.query_row(
                "SELECT updated_at FROM service_metadata WHERE name='api'",
                [],
                |r| r.get(0),
            )
            .unwrap()
        };
        assert!(second > first);
    }

    #[test]
    fn test_database_info() {
        let (_dir, store) = open_temp();
        store.save_result(&result("api", Status::Up, 10)).unwrap();

        let info = store.database_info().unwrap();
        assert_eq!(info.storage_type, "sqlite");
        assert_eq!(info.total_records, 1);
        assert_eq!(info.total_services, 1);
        assert!(info.database_size_bytes.unwrap() > 0);
        assert!(info.oldest_record.is_some());
        assert!(info.newest_record.is_some());
    }
}
