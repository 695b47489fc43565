// storage/memory.rs — In-memory result store.
// Bounded ring of records with optional JSON snapshots: written
// atomically (temp file + rename) on an interval and reloaded on
// construction. Useful for setups that don't want SQLite on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{DatabaseInfo, Storage};
use crate::errors::MonitorError;
use crate::types::{CheckResult, ServiceMetadata, ServiceStats, StoredRecord};

/// Hard cap on retained records; the oldest 10% are evicted when
/// it is reached and ids are rewritten to stay dense.
const MAX_RESULTS: usize = 10_000;

const SNAPSHOT_VERSION: &str = "1.0";

/// How often the snapshot worker writes to disk.
const SAVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: String,
    saved_at: DateTime<Utc>,
    results: Vec<StoredRecord>,
    services: HashMap<String, ServiceMetadata>,
}

#[derive(Default)]
struct Inner {
    results: Vec<StoredRecord>,
    services: HashMap<String, ServiceMetadata>,
}

pub struct MemoryStorage {
    inner: Mutex<Inner>,
    snapshot_path: Option<PathBuf>,
    /// Per-service record cap; 0 disables the cap.
    max_per_service: usize,
}

impl MemoryStorage {
    pub fn new(snapshot_path: Option<PathBuf>) -> Arc<Self> {
        Self::with_per_service_cap(snapshot_path, 0)
    }

    /// Create the store, load an existing snapshot if one is present,
    /// and start the periodic snapshot task when persistence is
    /// enabled and a runtime is available.
    pub fn with_per_service_cap(snapshot_path: Option<PathBuf>, max_per_service: usize) -> Arc<Self> {
        let storage = Arc::new(MemoryStorage {
            inner: Mutex::new(Inner::default()),
            snapshot_path,
            max_per_service,
        });

        if storage.snapshot_path.is_some() {
            if let Err(e) = storage.load_snapshot() {
                warn!("failed to load snapshot: {e}");
            }
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(snapshot_worker(Arc::downgrade(&storage)));
            }
        }

        storage
    }

    fn load_snapshot(&self) -> Result<(), MonitorError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MonitorError::storage(format!("read snapshot: {e}"))),
        };

        let snapshot: Snapshot = serde_json::from_slice(&data)
            .map_err(|e| MonitorError::storage(format!("parse snapshot: {e}")))?;

        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.results = snapshot.results;
        inner.services = snapshot.services;
        info!(
            results = inner.results.len(),
            services = inner.services.len(),
            path = %path.display(),
            "loaded snapshot"
        );
        Ok(())
    }

    fn save_snapshot(&self) -> Result<(), MonitorError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let snapshot = {
            let inner = self.inner.lock().expect("memory store lock poisoned");
            Snapshot {
                version: SNAPSHOT_VERSION.to_string(),
                saved_at: Utc::now(),
                results: inner.results.clone(),
                services: inner.services.clone(),
            }
        };

        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| MonitorError::storage(format!("encode snapshot: {e}")))?;

        // Write-then-rename keeps the snapshot atomic.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &data)
            .map_err(|e| MonitorError::storage(format!("write snapshot: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600));
        }
        std::fs::rename(&tmp, path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            MonitorError::storage(format!("rename snapshot: {e}"))
        })?;

        Ok(())
    }
}

/// Ids stay dense after any eviction.
fn renumber(results: &mut [StoredRecord]) {
    for (i, record) in results.iter_mut().enumerate() {
        record.id = i as i64 + 1;
    }
}

async fn snapshot_worker(storage: Weak<MemoryStorage>) {
    let mut ticker = tokio::time::interval(SAVE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(storage) = storage.upgrade() else {
            return;
        };
        if let Err(e) = storage.save_snapshot() {
            warn!("periodic snapshot failed: {e}");
        }
    }
}

impl Storage for MemoryStorage {
    fn save_result(&self, result: &CheckResult) -> Result<(), MonitorError> {
        let check_type = super::infer_check_type(result);
        let now = Utc::now();

        let mut inner = self.inner.lock().expect("memory store lock poisoned");

        let record = StoredRecord {
            id: inner.results.len() as i64 + 1,
            name: result.name.clone(),
            url: result.url.clone(),
            check_type: check_type.to_string(),
            status: result.status.as_i64(),
            error: result.error.clone(),
            response_time_ms: result.response_time.as_millis() as i64,
            status_code: result.status_code.map(i64::from),
            body_size: result.body_size as i64,
            timestamp: result.timestamp,
            created_at: now,
        };
        inner.results.push(record);

        // Per-service cap: drop that service's oldest record.
        if self.max_per_service > 0 {
            let count = inner
                .results
                .iter()
                .filter(|r| r.name == result.name)
                .count();
            if count > self.max_per_service {
                if let Some(pos) = inner.results.iter().position(|r| r.name == result.name) {
                    inner.results.remove(pos);
                }
                renumber(&mut inner.results);
            }
        }

        if inner.results.len() > MAX_RESULTS {
            let evict = MAX_RESULTS / 10;
            inner.results.drain(..evict);
            renumber(&mut inner.results);
            debug!(evicted = evict, "memory store over capacity, evicted oldest records");
        }

        match inner.services.get_mut(&result.name) {
            Some(service) => {
                service.url = result.url.clone();
                service.check_type = check_type.to_string();
                service.updated_at = now;
            }
            None => {
                inner.services.insert(
                    result.name.clone(),
                    ServiceMetadata {
                        name: result.name.clone(),
                        url: result.url.clone(),
                        check_type: check_type.to_string(),
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }

        Ok(())
    }

    fn get_service_stats(
        &self,
        name: &str,
        since: DateTime<Utc>,
    ) -> Result<ServiceStats, MonitorError> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        let service = inner
            .services
            .get(name)
            .ok_or_else(|| MonitorError::storage(format!("service {name} not found")))?;

        let mut total = 0i64;
        let mut successful = 0i64;
        let mut response_times = Vec::new();
        let mut last_check: Option<DateTime<Utc>> = None;
        let mut last_success: Option<DateTime<Utc>> = None;
        let mut last_failure: Option<DateTime<Utc>> = None;

        for record in &inner.results {
            if record.name != name || record.timestamp < since {
                continue;
            }
            total += 1;
            response_times.push(record.response_time_ms);
            last_check = last_check.max(Some(record.timestamp));
            if record.status == 0 {
                successful += 1;
                last_success = last_success.max(Some(record.timestamp));
            } else {
                last_failure = last_failure.max(Some(record.timestamp));
            }
        }

        if total == 0 {
            return Err(MonitorError::storage(format!(
                "no data found for service {name} since {since}"
            )));
        }

        let sum: i64 = response_times.iter().sum();
        Ok(ServiceStats {
            name: name.to_string(),
            url: service.url.clone(),
            check_type: service.check_type.clone(),
            total_checks: total,
            successful_checks: successful,
            failed_checks: total - successful,
            avg_response_time_ms: sum as f64 / total as f64,
            min_response_time_ms: response_times.iter().copied().min().unwrap_or(0),
            max_response_time_ms: response_times.iter().copied().max().unwrap_or(0),
            uptime_percent: (successful as f64 / total as f64) * 100.0,
            last_check,
            last_success,
            last_failure,
        })
    }

    fn get_all_service_stats(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ServiceStats>, MonitorError> {
        let names: Vec<String> = {
            let inner = self.inner.lock().expect("memory store lock poisoned");
            inner.services.keys().cloned().collect()
        };

        let mut all: Vec<ServiceStats> = names
            .iter()
            .filter_map(|name| self.get_service_stats(name, since).ok())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    fn get_service_history(
        &self,
        name: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, MonitorError> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        let mut records: Vec<StoredRecord> = inner
            .results
            .iter()
            .filter(|r| r.name == name && r.timestamp >= since)
            .cloned()
            .collect();

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if limit > 0 {
            records.truncate(limit);
        }
        Ok(records)
    }

    fn cleanup_old_data(&self, max_age: Duration) -> Result<u64, MonitorError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| MonitorError::storage(format!("bad max_age: {e}")))?;

        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let before = inner.results.len();
        inner.results.retain(|r| r.created_at >= cutoff);
        let removed = (before - inner.results.len()) as u64;

        if removed > 0 {
            renumber(&mut inner.results);
            info!(removed, max_age = ?max_age, "cleaned up old in-memory results");
        }
        Ok(removed)
    }

    fn database_info(&self) -> Result<DatabaseInfo, MonitorError> {
        let inner = self.inner.lock().expect("memory store lock poisoned");

        // Rough footprint estimate; exact accounting is not worth
        // walking every allocation.
        let mut usage = inner.results.len() * std::mem::size_of::<StoredRecord>();
        for (name, service) in &inner.services {
            usage += name.len() + service.url.len() + service.check_type.len() + 64;
        }

        Ok(DatabaseInfo {
            storage_type: "memory",
            path: self
                .snapshot_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string()),
            total_records: inner.results.len() as i64,
            total_services: inner.services.len() as i64,
            database_size_bytes: None,
            memory_usage_bytes: Some(usage as i64),
            oldest_record: inner.results.iter().map(|r| r.created_at).min(),
            newest_record: inner.results.iter().map(|r| r.created_at).max(),
        })
    }

    fn close(&self) -> Result<(), MonitorError> {
        self.save_snapshot()
    }
}

// ── Tests ──────────────────────────────────────────────────────
