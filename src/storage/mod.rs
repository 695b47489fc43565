// storage — Result persistence.
// Two interchangeable backends behind one trait: SQLite for
// durability, in-memory with optional JSON snapshots for light
// setups. Both are safe for concurrent saves from many tasks.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::MonitorError;
use crate::security;
use crate::types::{CheckResult, MemoryConfig, ServiceStats, StoredRecord};

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Summary of what a store currently holds.
#[derive(Debug, Clone)]
pub struct DatabaseInfo {
    pub storage_type: &'static str,
    pub path: String,
    pub total_records: i64,
    pub total_services: i64,
    pub database_size_bytes: Option<i64>,
    pub memory_usage_bytes: Option<i64>,
    pub oldest_record: Option<DateTime<Utc>>,
    pub newest_record: Option<DateTime<Utc>>,
}

/// Persistence contract consumed by the engine. Append-only result
/// log plus per-service metadata and derived aggregates.
pub trait Storage: Send + Sync {
    /// Append one record and upsert the service's metadata.
    fn save_result(&self, result: &CheckResult) -> Result<(), MonitorError>;

    /// Aggregates over records with `timestamp >= since`. Errors if
    /// the service has no data in the window.
    fn get_service_stats(
        &self,
        name: &str,
        since: DateTime<Utc>,
    ) -> Result<ServiceStats, MonitorError>;

    /// Stats for every known service, alphabetically by name.
    /// Services without data in the window are skipped.
    fn get_all_service_stats(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ServiceStats>, MonitorError>;

    /// Most recent records first, bounded by `limit`.
    fn get_service_history(
        &self,
        name: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, MonitorError>;

    /// Drop records with `created_at` older than `max_age`. Returns
    /// how many were removed. Metadata is kept.
    fn cleanup_old_data(&self, max_age: Duration) -> Result<u64, MonitorError>;

    fn database_info(&self) -> Result<DatabaseInfo, MonitorError>;

    /// Flush pending state. Safe to call more than once.
    fn close(&self) -> Result<(), MonitorError>;
}

/// Choose a backend from the configured storage path.
///
/// - `:memory:` — volatile in-memory store.
/// - `memory://some/file.json` — in-memory with a JSON snapshot.
/// - anything else — SQLite at that path.
pub fn open(path: &str, memory: &MemoryConfig) -> Result<Arc<dyn Storage>, MonitorError> {
    let per_service_cap = if memory.enabled {
        memory.max_history_per_service
    } else {
        0
    };

    if path == ":memory:" {
        return Ok(MemoryStorage::with_per_service_cap(None, per_service_cap));
    }
    if let Some(snapshot) = path.strip_prefix("memory://") {
        security::validate_file_path(snapshot)?;
        return Ok(MemoryStorage::with_per_service_cap(
            Some(snapshot.into()),
            per_service_cap,
        ));
    }
    security::validate_file_path(path)?;
    Ok(Arc::new(SqliteStorage::open(path)?))
}

/// Storage keys records by check type, but probe results do not
/// carry one; recover it from the shape of the target.
pub(crate) fn infer_check_type(result: &CheckResult) -> &'static str {
    if result.cert_info.is_some() {
        "ssl"
    } else if result.url.starts_with("http://") || result.url.starts_with("https://") {
        "http"
    } else {
        "tcp"
    }
}
