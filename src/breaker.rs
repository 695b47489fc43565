// breaker.rs — Per-endpoint circuit breakers.
// Three-state machine (CLOSED → OPEN → HALF_OPEN) that stops
// hammering an endpoint after repeated failures and probes it
// again once the cool-off elapses. Retries run inside one logical
// `execute` call, so the breaker only ever observes the final
// outcome of a probe round.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::MonitorError;
use crate::types::{CheckResult, CircuitBreakerConfig};

/// Breaker state. OPEN rejects calls; HALF_OPEN admits trial calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counters and timestamps exposed for diagnostics.
#[derive(Debug, Clone)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    pub failures: u32,
    pub successes: u64,
    pub total_requests: u64,
    pub consecutive_successes: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    successes: u64,
    consecutive_successes: u32,
    total_requests: u64,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    // Instant drives the timeout arithmetic; the DateTime twin is
    // only for reporting.
    state_changed_at: Instant,
    last_state_change: DateTime<Utc>,
}

impl BreakerInner {
    fn transition(&mut self, to: BreakerState) {
        self.state = to;
        self.state_changed_at = Instant::now();
        self.last_state_change = Utc::now();
    }
}

/// One circuit breaker. State is guarded by a single mutex; the
/// lock is never held across an await point.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                consecutive_successes: 0,
                total_requests: 0,
                last_failure_time: None,
                last_success_time: None,
                state_changed_at: Instant::now(),
                last_state_change: Utc::now(),
            }),
        }
    }

    /// Run one probe round under breaker protection. An OPEN breaker
    /// whose timeout has not elapsed rejects with
    /// `MonitorError::CircuitBreaker` carrying the remaining wait;
    /// the caller turns that into a synthetic DOWN result.
    pub async fn execute<F, Fut>(&self, probe: F) -> Result<CheckResult, MonitorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CheckResult>,
    {
        if !self.config.enabled {
            return Ok(probe().await);
        }

        self.before_request()?;
        let result = probe().await;
        self.record(result.is_healthy());
        Ok(result)
    }

    fn before_request(&self) -> Result<(), MonitorError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.total_requests += 1;

        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.state_changed_at.elapsed();
                if elapsed >= self.config.timeout {
                    inner.transition(BreakerState::HalfOpen);
                    inner.consecutive_successes = 0;
                    Ok(())
                } else {
                    Err(MonitorError::CircuitBreaker {
                        state: BreakerState::Open.as_str(),
                        retry_after: self.config.timeout - elapsed,
                    })
                }
            }
        }
    }

    /// Record the final outcome of an admitted probe round.
    pub fn record(&self, success: bool) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if success {
            inner.successes += 1;
            inner.consecutive_successes += 1;
            inner.last_success_time = Some(Utc::now());

            match inner.state {
                BreakerState::HalfOpen => {
                    if inner.consecutive_successes >= self.config.success_threshold {
                        inner.transition(BreakerState::Closed);
                        inner.failures = 0;
                    }
                }
                BreakerState::Closed => {
                    inner.failures = 0;
                }
                BreakerState::Open => {}
            }
        } else {
            inner.failures += 1;
            inner.consecutive_successes = 0;
            inner.last_failure_time = Some(Utc::now());

            match inner.state {
                BreakerState::Closed => {
                    if inner.failures >= self.config.max_failures {
                        inner.transition(BreakerState::Open);
                    }
                }
                // Any failure while probing immediately re-opens.
                BreakerState::HalfOpen => {
                    inner.transition(BreakerState::Open);
                }
                BreakerState::Open => {}
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerMetrics {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            total_requests: inner.total_requests,
            consecutive_successes: inner.consecutive_successes,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            last_state_change: inner.last_state_change,
        }
    }

    /// Force the breaker back to CLOSED and clear its counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.transition(BreakerState::Closed);
        inner.failures = 0;
        inner.successes = 0;
        inner.consecutive_successes = 0;
    }
}

// ── Manager ────────────────────────────────────────────────────

/// Registry of breakers keyed by endpoint URL. Entries are created
/// lazily on first use and live until engine shutdown.
pub struct BreakerManager {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        BreakerManager {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn breaker_for(&self, key: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().expect("breaker map lock poisoned");
            if let Some(breaker) = breakers.get(key) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write().expect("breaker map lock poisoned");
        if let Some(breaker) = breakers.get(key) {
            return Arc::clone(breaker);
        }
        let breaker = Arc::new(CircuitBreaker::new(self.config.clone()));
        breakers.insert(key.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Metrics snapshots for every known endpoint.
    pub fn all_metrics(&self) -> HashMap<String, BreakerMetrics> {
        let breakers = self.breakers.read().expect("breaker map lock poisoned");
        breakers
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.metrics()))
            .collect()
    }

    pub fn reset_all(&self) {
        let breakers = self.breakers.read().expect("breaker map lock poisoned");
        for breaker in breakers.values() {
            breaker.reset();
        }
    }

    pub fn remove(&self, key: &str) {
        self.breakers
            .write()
            .expect("breaker map lock poisoned")
            .remove(key);
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;
    use chrono::Utc;
    use std::collections::HashMap;

    fn config(max_failures: u32, timeout: Duration, success_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            max_failures,
            timeout,
            success_threshold,
        }
    }

    fn result(status: Status) -> CheckResult {
        CheckResult {
            name: "test".to_string(),
            url: "https://example.com".to_string(),
            status,
            error: None,
            response_time: Duration::from_millis(10),
            status_code: None,
            timestamp: Utc::now(),
            headers: HashMap::new(),
            body_size: 0,
            cert_info: None,
        }
    }

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let breaker = CircuitBreaker::new(config(3, Duration::from_secs(60), 2));

        for _ in 0..3 {
            let out = breaker.execute(|| async { result(Status::Down) }).await;
            assert!(out.is_ok());
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // The next call is rejected without running the probe.
        let err = breaker
            .execute(|| async { panic!("probe must not run while open") })
            .await
            .unwrap_err();
        match err {
            MonitorError::CircuitBreaker { state, retry_after } => {
                assert_eq!(state, "OPEN");
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_in_closed() {
        let breaker = CircuitBreaker::new(config(3, Duration::from_secs(60), 2));

        breaker.execute(|| async { result(Status::Down) }).await.unwrap();
        breaker.execute(|| async { result(Status::Down) }).await.unwrap();
        breaker.execute(|| async { result(Status::Up) }).await.unwrap();
        assert_eq!(breaker.metrics().failures, 0);

        // Two more failures are not enough to open after the reset.
        breaker.execute(|| async { result(Status::Down) }).await.unwrap();
        breaker.execute(|| async { result(Status::Down) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery_and_relapse() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_secs(30), 2));

        breaker.execute(|| async { result(Status::Down) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;

        // Timeout elapsed: the next call is admitted and moves the
        // breaker to HALF_OPEN.
        breaker.execute(|| async { result(Status::Up) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Second consecutive success reaches the threshold.
        breaker.execute(|| async { result(Status::Up) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);

        // Relapse: open again, wait, then fail during the trial.
        breaker.execute(|| async { result(Status::Down) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Open);
        tokio::time::advance(Duration::from_secs(31)).await;
        breaker.execute(|| async { result(Status::Down) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_slow_counts_as_success() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_secs(60), 1));
        breaker.execute(|| async { result(Status::Slow) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.metrics().failures, 0);
    }

    #[tokio::test]
    async fn test_disabled_bypasses_state_machine() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: false,
            ..CircuitBreakerConfig::default()
        });

        for _ in 0..20 {
            breaker.execute(|| async { result(Status::Down) }).await.unwrap();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.metrics().total_requests, 0);
    }

    #[tokio::test]
    async fn test_manager_reuses_entries_per_key() {
        let manager = BreakerManager::new(config(1, Duration::from_secs(60), 1));

        let a1 = manager.breaker_for("https://a.example");
        let a2 = manager.breaker_for("https://a.example");
        assert!(Arc::ptr_eq(&a1, &a2));

        a1.execute(|| async { result(Status::Down) }).await.unwrap();
        assert_eq!(a2.state(), BreakerState::Open);

        let b = manager.breaker_for("https://b.example");
        assert_eq!(b.state(), BreakerState::Closed);

        let metrics = manager.all_metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics["https://a.example"].state, BreakerState::Open);
    }
}
