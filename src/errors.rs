// errors.rs — Error taxonomy for the monitoring engine.
// Probe outcomes are values (CheckResult); these errors cover
// program-level conditions: invalid input, open breakers, failing
// infrastructure.

use std::time::Duration;
use thiserror::Error;

/// How bad an error is, for logging and triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Errors produced by the monitoring core.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Bad URL, header injection, malformed check definition.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Missing required setting or contradictory settings
    /// (e.g. SMTP credentials without TLS).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// DNS, connect, or read failure while probing.
    #[error("network error: {message}")]
    Network {
        message: String,
        status_code: Option<u16>,
    },

    /// Probe deadline exceeded.
    #[error("timeout after {timeout:?}: {message}")]
    Timeout { message: String, timeout: Duration },

    /// Storage write or read failure.
    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    /// Token bucket empty and caller chose not to wait.
    #[error("rate limited: retry in {retry_after:?}")]
    RateLimit { retry_after: Duration },

    /// Circuit breaker rejected the call.
    #[error("circuit breaker is {state}, retry in {retry_after:?}")]
    CircuitBreaker {
        state: &'static str,
        retry_after: Duration,
    },

    /// Notification dispatch failed on one or more channels.
    #[error("notification failed: {message}")]
    Notification { message: String },

    /// Shutdown interrupted a blocking operation. Control flow, not
    /// a probe failure: nothing is stored, nothing is notified.
    #[error("cancelled: {context}")]
    Cancelled { context: String },

    /// Invariant violated; not recoverable.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Aggregate of several failures from a concurrent fan-out,
    /// each tagged with the failing check's name.
    #[error("{} check(s) failed: {}", failures.len(), summarize(failures))]
    Aggregate { failures: Vec<(String, String)> },
}

fn summarize(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, msg)| format!("{name}: {msg}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl MonitorError {
    pub fn validation(message: impl Into<String>) -> Self {
        MonitorError::Validation {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        MonitorError::Configuration {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>, status_code: Option<u16>) -> Self {
        MonitorError::Network {
            message: message.into(),
            status_code,
        }
    }

    pub fn timeout(message: impl Into<String>, timeout: Duration) -> Self {
        MonitorError::Timeout {
            message: message.into(),
            timeout,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        MonitorError::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        MonitorError::Internal {
            message: message.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            MonitorError::Validation { .. } => Severity::Medium,
            MonitorError::Configuration { .. } => Severity::High,
            MonitorError::Network { status_code, .. } => match status_code {
                Some(code) if *code >= 500 => Severity::High,
                _ => Severity::Medium,
            },
            MonitorError::Timeout { .. } => Severity::Medium,
            MonitorError::Storage { .. } => Severity::High,
            MonitorError::RateLimit { .. } => Severity::Low,
            MonitorError::CircuitBreaker { .. } => Severity::Medium,
            MonitorError::Cancelled { .. } => Severity::Low,
            MonitorError::Notification { .. } => Severity::Medium,
            MonitorError::Internal { .. } => Severity::Critical,
            MonitorError::Aggregate { .. } => Severity::Medium,
        }
    }

    /// Whether retrying the same operation could plausibly succeed.
    /// Network failures are retryable for transport errors and for
    /// status 429 / 5xx; validation and configuration never are.
    pub fn retryable(&self) -> bool {
        match self {
            MonitorError::Network { status_code, .. } => match status_code {
                None | Some(0) => true,
                Some(429) => true,
                Some(code) => *code >= 500,
            },
            MonitorError::Timeout { .. }
            | MonitorError::Storage { .. }
            | MonitorError::RateLimit { .. }
            | MonitorError::CircuitBreaker { .. } => true,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for MonitorError {
    fn from(err: rusqlite::Error) -> Self {
        MonitorError::Storage {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

// ── Aggregation ────────────────────────────────────────────────

/// Collects per-check failures during a concurrent fan-out and
/// folds them into a single aggregate error at the end.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    failures: Vec<(String, String)>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        ErrorCollector::default()
    }

    pub fn add(&mut self, name: impl Into<String>, error: impl std::fmt::Display) {
        self.failures.push((name.into(), error.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Consume the collector: Ok if nothing failed, otherwise an
    /// aggregate naming every failing check.
    pub fn into_result(self) -> Result<(), MonitorError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(MonitorError::Aggregate {
                failures: self.failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_retryability() {
        assert!(MonitorError::network("connect refused", None).retryable());
        assert!(MonitorError::network("throttled", Some(429)).retryable());
        assert!(MonitorError::network("bad gateway", Some(502)).retryable());
        assert!(!MonitorError::network("not found", Some(404)).retryable());
    }

    #[test]
    fn test_validation_never_retryable() {
        let err = MonitorError::validation("header contains CR/LF");
        assert!(!err.retryable());
        assert_eq!(err.severity(), Severity::Medium);
    }

    #[test]
    fn test_collector_aggregates_by_name() {
        let mut collector = ErrorCollector::new();
        assert!(collector.is_empty());
        collector.add("api", "connection refused");
        collector.add("db", "timeout after 5s");

        let err = collector.into_result().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("api: connection refused"));
        assert!(text.contains("db: timeout after 5s"));
        assert!(text.contains("2 check(s) failed"));
    }

    #[test]
    fn test_empty_collector_is_ok() {
        assert!(ErrorCollector::new().into_result().is_ok());
    }
}
