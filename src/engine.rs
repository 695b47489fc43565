// ──────────────────────────────────────────────────────────────
//  Pulseguard — Monitoring Engine
//  Owns the per-check tasks and composes the protective layers
//  around every probe, in this order: shutdown check, rate-limit
//  wait, circuit breaker, retry loop. Every completed probe is
//  written to storage, offered to the notifier, and published on
//  the observer channel.
// ──────────────────────────────────────────────────────────────

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::breaker::{BreakerManager, BreakerMetrics};
use crate::checker::CheckerSet;
use crate::errors::{ErrorCollector, MonitorError};
use crate::notifier::{Notifier, NotifyOutcome};
use crate::ratelimit::{RateLimitStats, RateLimiter};
use crate::shutdown::Shutdown;
use crate::storage::Storage;
use crate::types::{
    Backoff, CheckConfig, CheckResult, CircuitBreakerConfig, RateLimitConfig, RetryConfig, Status,
};

/// Knobs the engine needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub user_agent: String,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// How often the maintenance task prunes old records.
    pub cleanup_interval: Duration,
    /// Records older than this are pruned.
    pub retention: Duration,
    pub observer_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            user_agent: concat!("pulseguard/", env!("CARGO_PKG_VERSION")).to_string(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cleanup_interval: Duration::from_secs(24 * 3600),
            retention: Duration::from_secs(30 * 24 * 3600),
            observer_capacity: 256,
        }
    }
}

// ── Metrics ────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    probes_total: AtomicU64,
    overlap_skips: AtomicU64,
    observer_drops: AtomicU64,
    breaker_rejections: AtomicU64,
    storage_failures: AtomicU64,
    notifications_dispatched: AtomicU64,
    notifications_suppressed: AtomicU64,
    notification_failures: AtomicU64,
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    pub probes_total: u64,
    pub overlap_skips: u64,
    pub observer_drops: u64,
    pub breaker_rejections: u64,
    pub storage_failures: u64,
    pub notifications_dispatched: u64,
    pub notifications_suppressed: u64,
    pub notification_failures: u64,
}

// ── Engine ─────────────────────────────────────────────────────

pub struct Engine {
    options: EngineOptions,
    checkers: CheckerSet,
    storage: Arc<dyn Storage>,
    notifier: Notifier,
    limiter: RateLimiter,
    breakers: BreakerManager,
    shutdown: Shutdown,
    observer_tx: Mutex<Option<mpsc::Sender<CheckResult>>>,
    observer_rx: Mutex<Option<mpsc::Receiver<CheckResult>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl Engine {
    pub fn new(
        options: EngineOptions,
        storage: Arc<dyn Storage>,
        notifier: Notifier,
    ) -> Result<Self, MonitorError> {
        let checkers = CheckerSet::new(&options.user_agent)?;
        let limiter = RateLimiter::new(options.rate_limit.clone());
        let breakers = BreakerManager::new(options.circuit_breaker.clone());
        let (observer_tx, observer_rx) = mpsc::channel(options.observer_capacity.max(1));

        Ok(Engine {
            options,
            checkers,
            storage,
            notifier,
            limiter,
            breakers,
            shutdown: Shutdown::new(),
            observer_tx: Mutex::new(Some(observer_tx)),
            observer_rx: Mutex::new(Some(observer_rx)),
            tasks: Mutex::new(HashMap::new()),
            maintenance: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    /// Take the observer stream. One consumer only; returns None on
    /// the second call.
    pub fn observer(&self) -> Option<mpsc::Receiver<CheckResult>> {
        self.observer_rx.lock().expect("observer lock poisoned").take()
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            probes_total: self.counters.probes_total.load(Ordering::Relaxed),
            overlap_skips: self.counters.overlap_skips.load(Ordering::Relaxed),
            observer_drops: self.counters.observer_drops.load(Ordering::Relaxed),
            breaker_rejections: self.counters.breaker_rejections.load(Ordering::Relaxed),
            storage_failures: self.counters.storage_failures.load(Ordering::Relaxed),
            notifications_dispatched: self
                .counters
                .notifications_dispatched
                .load(Ordering::Relaxed),
            notifications_suppressed: self
                .counters
                .notifications_suppressed
                .load(Ordering::Relaxed),
            notification_failures: self.counters.notification_failures.load(Ordering::Relaxed),
        }
    }

    pub fn breaker_metrics(&self, url: &str) -> BreakerMetrics {
        self.breakers.breaker_for(url).metrics()
    }

    pub fn rate_limit_stats(&self, url: &str) -> Option<RateLimitStats> {
        self.limiter.stats(url)
    }

    // ── Single probe occurrence ────────────────────────────────

    /// Run one probe occurrence through the full pipeline. Returns
    /// `Cancelled` (and nothing else) when shutdown interrupts the
    /// flow before a result exists; every produced result — genuine
    /// or synthetic — is stored, offered to the notifier, and
    /// published before being returned.
    pub async fn execute_check(&self, check: &CheckConfig) -> Result<CheckResult, MonitorError> {
        if self.shutdown.is_triggered() {
            return Err(MonitorError::Cancelled {
                context: format!("engine stopping before probe of {}", check.name),
            });
        }

        self.limiter.wait(&check.url, &self.shutdown).await?;

        let breaker = self.breakers.breaker_for(&check.url);
        let result = match breaker.execute(|| self.run_with_retry(check)).await {
            Ok(result) => result,
            Err(MonitorError::CircuitBreaker { retry_after, .. }) => {
                self.counters
                    .breaker_rejections
                    .fetch_add(1, Ordering::Relaxed);
                synthetic_open_result(check, retry_after)
            }
            Err(other) => return Err(other),
        };

        if let Err(e) = self.storage.save_result(&result) {
            self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
            warn!(name = %check.name, "failed to save result: {e}");
        }

        match self.notifier.notify(&result).await {
            Ok(NotifyOutcome::Dispatched) => {
                self.counters
                    .notifications_dispatched
                    .fetch_add(1, Ordering::Relaxed);
            }
            Ok(NotifyOutcome::Suppressed) => {
                self.counters
                    .notifications_suppressed
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters
                    .notification_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(name = %check.name, "notification error: {e}");
            }
        }

        self.publish(&result);
        Ok(result)
    }

    /// The retry loop lives inside the breaker's one logical call,
    /// so the breaker observes only the final outcome of a round.
    async fn run_with_retry(&self, check: &CheckConfig) -> CheckResult {
        let attempts = check.retry.attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = self.checkers.run(check).await;
            self.counters.probes_total.fetch_add(1, Ordering::Relaxed);

            if result.is_healthy() || attempt >= attempts {
                return result;
            }

            let delay = retry_delay(&check.retry, attempt);
            debug!(
                name = %check.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "probe unhealthy, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.triggered() => {
                    // Shutdown mid-backoff: the round ends with the
                    // result we already have.
                    return result;
                }
            }
            attempt += 1;
        }
    }

    fn publish(&self, result: &CheckResult) {
        let tx = self.observer_tx.lock().expect("observer lock poisoned");
        if let Some(tx) = tx.as_ref() {
            match tx.try_send(result.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.counters.observer_drops.fetch_add(1, Ordering::Relaxed);
                    debug!(name = %result.name, "observer channel full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    // ── One-shot fan-out ───────────────────────────────────────

    /// Probe every check concurrently, once. Returns when all have
    /// completed; cancelled or otherwise failed probes are reported
    /// through one aggregate error naming each check.
    pub async fn execute_checks(
        self: Arc<Self>,
        checks: &[CheckConfig],
    ) -> Result<Vec<CheckResult>, MonitorError> {
        if checks.is_empty() {
            return Err(MonitorError::validation("no checks provided"));
        }

        let mut join_set = tokio::task::JoinSet::new();
        for check in checks.iter().cloned() {
            let engine = Arc::clone(&self);
            join_set.spawn(async move {
                let outcome = engine.execute_check(&check).await;
                (check.name, outcome)
            });
        }

        let mut results = Vec::with_capacity(checks.len());
        let mut collector = ErrorCollector::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(result))) => results.push(result),
                Ok((name, Err(e))) => collector.add(name, e),
                Err(e) => collector.add("task", format!("probe task panicked: {e}")),
            }
        }

        collector.into_result()?;
        Ok(results)
    }

    // ── Continuous monitoring ──────────────────────────────────

    /// Spawn one monitor task per check plus the maintenance task.
    /// Names must be unique; registering a duplicate is an error.
    pub fn start_monitoring(self: Arc<Self>, checks: Vec<CheckConfig>) -> Result<(), MonitorError> {
        if checks.is_empty() {
            return Err(MonitorError::validation("no checks provided"));
        }

        {
            let mut tasks = self.tasks.lock().expect("task registry lock poisoned");

            // Validate the whole batch before spawning anything.
            let mut batch = std::collections::HashSet::new();
            for check in &checks {
                if tasks.contains_key(&check.name) || !batch.insert(check.name.as_str()) {
                    return Err(MonitorError::validation(format!(
                        "duplicate check name: {}",
                        check.name
                    )));
                }
            }

            for check in &checks {
                tasks.insert(
                    check.name.clone(),
                    spawn_monitor_task(Arc::clone(&self), check.clone()),
                );
            }
        }

        let mut maintenance = self.maintenance.lock().expect("maintenance lock poisoned");
        if maintenance.is_none() {
            *maintenance = Some(tokio::spawn(maintenance_task(Arc::clone(&self))));
        }

        info!(checks = checks.len(), "monitoring started");
        Ok(())
    }

    /// Trigger shutdown and wait for every task to finish. In-flight
    /// probes complete or hit their own timeouts; no new ticks fire.
    /// Never fails: teardown problems are logged.
    pub async fn stop(&self) {
        self.shutdown.trigger();

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock().expect("task registry lock poisoned");
            tasks.drain().collect()
        };
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!(task = %name, "monitor task ended abnormally: {e}");
            }
        }

        let maintenance = {
            self.maintenance
                .lock()
                .expect("maintenance lock poisoned")
                .take()
        };
        if let Some(handle) = maintenance {
            if let Err(e) = handle.await {
                warn!("maintenance task ended abnormally: {e}");
            }
        }

        // All producers are gone; closing the sender ends the
        // observer stream for its consumer.
        self.observer_tx
            .lock()
            .expect("observer lock poisoned")
            .take();

        if let Err(e) = self.storage.close() {
            error!("storage close failed: {e}");
        }

        let metrics = self.metrics();
        info!(
            probes = metrics.probes_total,
            overlap_skips = metrics.overlap_skips,
            observer_drops = metrics.observer_drops,
            breaker_rejections = metrics.breaker_rejections,
            "engine stopped"
        );
    }
}

// ── Per-check task ─────────────────────────────────────────────

/// One logical task per check: an immediate first probe, then one
/// probe per interval tick. A tick that arrives while the previous
/// probe is still in flight is skipped and counted.
fn spawn_monitor_task(engine: Arc<Engine>, check: CheckConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(handle) = &in_flight {
                        if !handle.is_finished() {
                            engine.counters.overlap_skips.fetch_add(1, Ordering::Relaxed);
                            debug!(name = %check.name, "previous probe still running, tick skipped");
                            continue;
                        }
                    }

                    let task_engine = Arc::clone(&engine);
                    let task_check = check.clone();
                    in_flight = Some(tokio::spawn(async move {
                        match task_engine.execute_check(&task_check).await {
                            Ok(result) => {
                                debug!(
                                    name = %task_check.name,
                                    status = %result.status,
                                    "probe finished"
                                );
                            }
                            Err(MonitorError::Cancelled { .. }) => {}
                            Err(e) => {
                                warn!(name = %task_check.name, "probe error: {e}");
                            }
                        }
                    }));
                }
                _ = engine.shutdown.triggered() => break,
            }
        }

        // STOPPING: let the in-flight probe run to completion (its
        // own timeout bounds it), then release.
        if let Some(handle) = in_flight {
            let _ = handle.await;
        }
        debug!(name = %check.name, "monitor task stopped");
    })
}

/// Engine-owned periodic cleanup of old persisted results.
async fn maintenance_task(engine: Arc<Engine>) {
    let mut ticker = tokio::time::interval(engine.options.cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The immediate first tick would clean on startup; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.storage.cleanup_old_data(engine.options.retention) {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "maintenance cleanup done");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("maintenance cleanup failed: {e}"),
                }
            }
            _ = engine.shutdown.triggered() => return,
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────

/// The breaker rejected the call: fabricate the DOWN result that
/// stands in for the probe. Zero response time marks it synthetic.
fn synthetic_open_result(check: &CheckConfig, retry_after: Duration) -> CheckResult {
    CheckResult {
        name: check.name.clone(),
        url: check.url.clone(),
        status: Status::Down,
        error: Some(format!(
            "circuit breaker is OPEN, retry in {}s",
            retry_after.as_secs().max(1)
        )),
        response_time: Duration::ZERO,
        status_code: None,
        timestamp: Utc::now(),
        headers: HashMap::new(),
        body_size: 0,
        cert_info: None,
    }
}

/// Backoff schedule between attempts: fixed, linear in the attempt
/// number, or doubling. `max_delay` caps all of them when set.
fn retry_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let base = retry.delay;
    let delay = match retry.backoff {
        Backoff::None => base,
        Backoff::Linear => base.saturating_mul(attempt),
        Backoff::Exponential => base.saturating_mul(1u32 << (attempt - 1).min(20)),
    };
    if retry.max_delay > Duration::ZERO && delay > retry.max_delay {
        retry.max_delay
    } else {
        delay
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(attempts: u32, delay_ms: u64, backoff: Backoff, max_ms: u64) -> RetryConfig {
        RetryConfig {
            attempts,
            delay: Duration::from_millis(delay_ms),
            backoff,
            max_delay: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn test_retry_delay_none_is_constant() {
        let r = retry(5, 100, Backoff::None, 0);
        assert_eq!(retry_delay(&r, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&r, 4), Duration::from_millis(100));
    }

    #[test]
    fn test_retry_delay_linear() {
        let r = retry(5, 100, Backoff::Linear, 0);
        assert_eq!(retry_delay(&r, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&r, 3), Duration::from_millis(300));
    }

    #[test]
    fn test_retry_delay_exponential_with_cap() {
        let r = retry(5, 100, Backoff::Exponential, 350);
        assert_eq!(retry_delay(&r, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&r, 2), Duration::from_millis(200));
        // 400ms uncapped, clamped to max_delay.
        assert_eq!(retry_delay(&r, 3), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_delay_no_cap_when_zero() {
        let r = retry(5, 100, Backoff::Exponential, 0);
        assert_eq!(retry_delay(&r, 4), Duration::from_millis(800));
    }

    #[test]
    fn test_synthetic_result_shape() {
        let check = CheckConfig {
            name: "api".to_string(),
            check_type: crate::types::CheckType::Http,
            url: "https://api.example.com".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            expected: Default::default(),
            retry: Default::default(),
            tags: Vec::new(),
        };

        let result = synthetic_open_result(&check, Duration::from_secs(42));
        assert_eq!(result.status, Status::Down);
        assert_eq!(result.response_time, Duration::ZERO);
        let error = result.error.unwrap();
        assert!(error.contains("circuit breaker is OPEN"));
        assert!(error.contains("42"));
    }
}
