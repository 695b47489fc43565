// types.rs — Core value types for checks, results, and statistics.
// Everything here is plain data; behavior lives in the checker/engine modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ── Status ─────────────────────────────────────────────────────

/// Health status produced by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Down,
    Slow,
    Error,
    Warning,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "UP",
            Status::Down => "DOWN",
            Status::Slow => "SLOW",
            Status::Error => "ERROR",
            Status::Warning => "WARNING",
        }
    }

    /// Glyph used by the CLI printer.
    pub fn glyph(&self) -> &'static str {
        match self {
            Status::Up => "🟢",
            Status::Down => "🔴",
            Status::Slow => "🟡",
            Status::Error => "❌",
            Status::Warning => "⚠️",
        }
    }

    /// ANSI color escape for terminal output.
    pub fn color(&self) -> &'static str {
        match self {
            Status::Up => "\x1b[32m",
            Status::Down => "\x1b[31m",
            Status::Slow => "\x1b[33m",
            Status::Error => "\x1b[91m",
            Status::Warning => "\x1b[93m",
        }
    }

    /// UP and SLOW both mean the endpoint answered.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Status::Up | Status::Slow)
    }

    /// DOWN and ERROR require operator attention.
    pub fn is_critical(&self) -> bool {
        matches!(self, Status::Down | Status::Error)
    }

    /// Integer representation used by the stored-record schema.
    pub fn as_i64(&self) -> i64 {
        match self {
            Status::Up => 0,
            Status::Down => 1,
            Status::Slow => 2,
            Status::Error => 3,
            Status::Warning => 4,
        }
    }

    /// Decode the stored integer form. Unknown values map to ERROR.
    pub fn from_i64(v: i64) -> Status {
        match v {
            0 => Status::Up,
            1 => Status::Down,
            2 => Status::Slow,
            4 => Status::Warning,
            _ => Status::Error,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Check type ─────────────────────────────────────────────────

/// Kind of probe to run against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Http,
    Tcp,
    Ssl,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Http => "http",
            CheckType::Tcp => "tcp",
            CheckType::Ssl => "ssl",
        }
    }
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Check configuration ────────────────────────────────────────

/// Configuration for a single check. Built by the config loader,
/// treated as read-only by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub check_type: CheckType,
    pub url: String,
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub expected: Expected,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_method() -> String {
    "GET".to_string()
}

/// What constitutes a successful probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Expected {
    #[serde(default)]
    pub status: Option<u16>,
    /// Inclusive [lo, hi] range; overrides `status` when both are set.
    #[serde(default)]
    pub status_range: Option<(u16, u16)>,
    #[serde(default)]
    pub body_contains: Option<String>,
    #[serde(default)]
    pub body_not_contains: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub response_time_max: Option<Duration>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub min_body_size: Option<u64>,
    /// SSL only: warn when the certificate expires within this many days.
    #[serde(default)]
    pub cert_expiry_days: Option<i64>,
    /// SSL only: domains the certificate must cover.
    #[serde(default)]
    pub cert_valid_domains: Vec<String>,
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    None,
    Linear,
    Exponential,
}

/// Retry behavior for a check. Retries are driven by the engine,
/// never by the executors themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub attempts: u32,
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub delay: Duration,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(with = "humantime_serde", default)]
    pub max_delay: Duration,
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(2)
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: 0,
            delay: default_retry_delay(),
            backoff: Backoff::None,
            max_delay: Duration::ZERO,
        }
    }
}

// ── Probe results ──────────────────────────────────────────────

/// The outcome of a single probe. Produced by an executor (or
/// synthesized by the engine for breaker-open rejections), written
/// to storage, handed to the notifier, published on the observer
/// channel, then dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub url: String,
    pub status: Status,
    #[serde(default)]
    pub error: Option<String>,
    pub response_time: Duration,
    #[serde(default)]
    pub status_code: Option<u16>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body_size: u64,
    #[serde(default)]
    pub cert_info: Option<CertInfo>,
}

impl CheckResult {
    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    pub fn is_critical(&self) -> bool {
        self.status.is_critical()
    }
}

/// Leaf-certificate details captured by the SSL executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertInfo {
    pub subject: String,
    pub issuer: String,
    pub expiry_date: DateTime<Utc>,
    pub days_to_expiry: i64,
    pub is_valid: bool,
    pub common_name: String,
    pub dns_names: Vec<String>,
}

// ── Stored records and aggregates ──────────────────────────────

/// A persisted probe result as stored and queried back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub check_type: String,
    pub status: i64,
    #[serde(default)]
    pub error: Option<String>,
    pub response_time_ms: i64,
    #[serde(default)]
    pub status_code: Option<i64>,
    #[serde(default)]
    pub body_size: i64,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Per-service metadata, refreshed on every write for that service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub name: String,
    pub url: String,
    pub check_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregated statistics for a service over `[since, now)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub name: String,
    pub url: String,
    pub check_type: String,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub failed_checks: i64,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: i64,
    pub max_response_time_ms: i64,
    pub uptime_percent: f64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

// ── Protection-layer configuration ─────────────────────────────

/// Token-bucket rate limiting, keyed by check URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Tokens per second granted to each endpoint bucket.
    #[serde(default = "default_limit")]
    pub default_limit: f64,
    #[serde(default = "default_burst")]
    pub default_burst: u32,
    #[serde(default = "default_true")]
    pub per_endpoint: bool,
}

fn default_true() -> bool {
    true
}

fn default_limit() -> f64 {
    1.0
}

fn default_burst() -> u32 {
    5
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            enabled: true,
            default_limit: 1.0,
            default_burst: 5,
            per_endpoint: true,
        }
    }
}

/// Circuit breaking, keyed by check URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(with = "humantime_serde", default = "default_breaker_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_max_failures() -> u32 {
    5
}

fn default_breaker_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_success_threshold() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            enabled: true,
            max_failures: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

/// Bounds on the in-process history kept by the memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_history")]
    pub max_history_per_service: usize,
    #[serde(with = "humantime_serde", default = "default_history_age")]
    pub max_history_age: Duration,
    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,
    #[serde(default = "default_max_memory")]
    pub max_total_memory_mb: u64,
}

fn default_max_history() -> usize {
    100
}

fn default_history_age() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_memory() -> u64 {
    100
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            enabled: true,
            max_history_per_service: default_max_history(),
            max_history_age: default_history_age(),
            cleanup_interval: default_cleanup_interval(),
            max_total_memory_mb: default_max_memory(),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_predicates() {
        assert!(Status::Up.is_healthy());
        assert!(Status::Slow.is_healthy());
        assert!(!Status::Down.is_healthy());
        assert!(!Status::Warning.is_healthy());

        assert!(Status::Down.is_critical());
        assert!(Status::Error.is_critical());
        assert!(!Status::Slow.is_critical());
        assert!(!Status::Warning.is_critical());
    }

    #[test]
    fn test_status_int_roundtrip() {
        for status in [
            Status::Up,
            Status::Down,
            Status::Slow,
            Status::Error,
            Status::Warning,
        ] {
            assert_eq!(Status::from_i64(status.as_i64()), status);
        }
        // Unknown stored values decode as ERROR rather than panicking.
        assert_eq!(Status::from_i64(99), Status::Error);
    }

    #[test]
    fn test_check_config_yaml_defaults() {
        let yaml = r#"
name: api
type: http
url: https://api.example.com/health
"#;
        let check: CheckConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(check.method, "GET");
        assert_eq!(check.interval, Duration::from_secs(30));
        assert_eq!(check.timeout, Duration::from_secs(10));
        assert_eq!(check.retry.attempts, 0);
        assert_eq!(check.retry.backoff, Backoff::None);
    }

    #[test]
    fn test_expected_range_parses() {
        let yaml = r#"
name: api
type: http
url: https://api.example.com
expected:
  status_range: [200, 299]
  response_time_max: 500ms
"#;
        let check: CheckConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(check.expected.status_range, Some((200, 299)));
        assert_eq!(
            check.expected.response_time_max,
            Some(Duration::from_millis(500))
        );
    }
}
