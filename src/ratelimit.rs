// ratelimit.rs — Per-endpoint token buckets.
// Each check URL gets its own bucket, created lazily with the
// configured default limit and burst. `wait` is the blocking path
// used by the engine; `allow` is the non-blocking variant for
// back-pressure decisions.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::MonitorError;
use crate::shutdown::Shutdown;
use crate::types::RateLimitConfig;

/// Point-in-time view of one endpoint's bucket.
#[derive(Debug, Clone)]
pub struct RateLimitStats {
    pub key: String,
    pub limit: f64,
    pub burst: u32,
    pub available: f64,
    pub total_requests: u64,
    pub rejected: u64,
    pub last_request: Option<DateTime<Utc>>,
}

struct Bucket {
    limit: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
    total_requests: u64,
    rejected: u64,
    last_request: Option<DateTime<Utc>>,
}

impl Bucket {
    fn new(limit: f64, burst: u32) -> Self {
        Bucket {
            limit,
            burst: f64::from(burst),
            // A fresh bucket starts full so the first probes go out
            // immediately.
            tokens: f64::from(burst),
            last_refill: Instant::now(),
            total_requests: 0,
            rejected: 0,
            last_request: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.limit).min(self.burst);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one becomes available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if self.limit <= 0.0 {
            // A zero rate would wait forever; treat as unlimited
            // rather than deadlocking the scheduler.
            return Ok(());
        }
        let deficit = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(deficit / self.limit))
    }
}

/// Per-endpoint rate limiter. The membership map is guarded by a
/// read-write lock; each bucket carries its own mutex so hot keys
/// never contend on the map.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        RateLimiter::new(RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        })
    }

    /// Block until a token is available for `key`, or until shutdown
    /// is triggered. Cancellation surfaces as `MonitorError::Cancelled`
    /// — the engine reports it but records no probe result.
    pub async fn wait(&self, key: &str, shutdown: &Shutdown) -> Result<(), MonitorError> {
        if !self.config.enabled {
            return Ok(());
        }

        let bucket = self.bucket_for(key);
        {
            let mut b = bucket.lock().expect("bucket lock poisoned");
            b.total_requests += 1;
            b.last_request = Some(Utc::now());
        }

        loop {
            let needed = {
                let mut b = bucket.lock().expect("bucket lock poisoned");
                match b.try_take(Instant::now()) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(needed) => {}
                _ = shutdown.triggered() => {
                    return Err(MonitorError::Cancelled {
                        context: format!("rate limit wait for {key}"),
                    });
                }
            }
        }
    }

    /// Non-blocking check: take a token if one is available right now.
    pub fn allow(&self, key: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        let bucket = self.bucket_for(key);
        let mut b = bucket.lock().expect("bucket lock poisoned");
        b.total_requests += 1;
        b.last_request = Some(Utc::now());

        match b.try_take(Instant::now()) {
            Ok(()) => true,
            Err(_) => {
                b.rejected += 1;
                false
            }
        }
    }

    /// Override the limit and burst for one endpoint. Creates the
    /// bucket if it does not exist yet.
    pub fn set_limit(&self, key: &str, limit: f64, burst: u32) {
        let mut buckets = self.buckets.write().expect("bucket map lock poisoned");
        match buckets.get(key) {
            Some(bucket) => {
                let mut b = bucket.lock().expect("bucket lock poisoned");
                b.refill(Instant::now());
                b.limit = limit;
                b.burst = f64::from(burst);
                b.tokens = b.tokens.min(b.burst);
            }
            None => {
                buckets.insert(key.to_string(), Arc::new(Mutex::new(Bucket::new(limit, burst))));
            }
        }
    }

    pub fn remove(&self, key: &str) {
        self.buckets
            .write()
            .expect("bucket map lock poisoned")
            .remove(key);
    }

    /// Snapshot of one endpoint's bucket, if it has been used.
    pub fn stats(&self, key: &str) -> Option<RateLimitStats> {
        let buckets = self.buckets.read().expect("bucket map lock poisoned");
        let bucket = buckets.get(key)?;
        let mut b = bucket.lock().expect("bucket lock poisoned");
        b.refill(Instant::now());
        Some(RateLimitStats {
            key: key.to_string(),
            limit: b.limit,
            burst: b.burst as u32,
            available: b.tokens,
            total_requests: b.total_requests,
            rejected: b.rejected,
            last_request: b.last_request,
        })
    }

    /// Snapshot of every bucket, for diagnostics.
    pub fn all_stats(&self) -> Vec<RateLimitStats> {
        let buckets = self.buckets.read().expect("bucket map lock poisoned");
        let keys: Vec<String> = buckets.keys().cloned().collect();
        drop(buckets);
        keys.iter().filter_map(|k| self.stats(k)).collect()
    }

    fn bucket_for(&self, key: &str) -> Arc<Mutex<Bucket>> {
        {
            let buckets = self.buckets.read().expect("bucket map lock poisoned");
            if let Some(bucket) = buckets.get(key) {
                return Arc::clone(bucket);
            }
        }

        let mut buckets = self.buckets.write().expect("bucket map lock poisoned");
        // Re-check under the write lock: another task may have won.
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }
        let bucket = Arc::new(Mutex::new(Bucket::new(
            self.config.default_limit,
            self.config.default_burst,
        )));
        buckets.insert(key.to_string(), Arc::clone(&bucket));
        bucket
    }
}

// ── Tests ──────────────────────────────────────────────────────
