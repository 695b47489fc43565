// checker/tcp.rs — TCP connect probe.
// Dials the configured host:port within the probe deadline; a
// completed handshake is UP (or SLOW past the response-time cap),
// anything else is DOWN.

use async_trait::async_trait;
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::Checker;
use crate::security;
use crate::types::{CheckConfig, CheckResult, Status};

pub struct TcpChecker;

impl TcpChecker {
    pub fn new() -> Self {
        TcpChecker
    }
}

impl Default for TcpChecker {
    fn default() -> Self {
        TcpChecker::new()
    }
}

#[async_trait]
impl Checker for TcpChecker {
    fn name(&self) -> &'static str {
        "TCP"
    }

    async fn check(&self, check: &CheckConfig) -> CheckResult {
        let start = Instant::now();
        let mut result = CheckResult {
            name: check.name.clone(),
            url: check.url.clone(),
            status: Status::Error,
            error: None,
            response_time: Duration::ZERO,
            status_code: None,
            timestamp: Utc::now(),
            headers: Default::default(),
            body_size: 0,
            cert_info: None,
        };

        // TCP targets share the host[:port] guard with SSL checks.
        if let Err(e) = security::validate_ssl_target(&check.url) {
            result.error = Some(format!("target validation failed: {e}"));
            result.response_time = start.elapsed();
            return result;
        }

        let connect = TcpStream::connect(check.url.as_str());
        match timeout(check.timeout, connect).await {
            Err(_) => {
                result.response_time = start.elapsed();
                result.status = Status::Down;
                result.error = Some(format!(
                    "connection timed out after {:?}",
                    check.timeout
                ));
            }
            Ok(Err(e)) => {
                result.response_time = start.elapsed();
                result.status = Status::Down;
                result.error = Some(format!("TCP connection failed: {e}"));
            }
            Ok(Ok(stream)) => {
                let duration = start.elapsed();
                result.response_time = duration;
                drop(stream);

                match check.expected.response_time_max {
                    Some(max) if duration > max => {
                        result.status = Status::Slow;
                        result.error = Some(format!(
                            "connection time {duration:?} exceeds maximum {max:?}"
                        ));
                    }
                    _ => {
                        result.status = Status::Up;
                    }
                }
            }
        }

        result
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckType, Expected};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    fn check(url: &str) -> CheckConfig {
        CheckConfig {
            name: "tcp-test".to_string(),
            check_type: CheckType::Tcp,
            url: url.to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(1),
            method: String::new(),
            headers: HashMap::new(),
            body: None,
            expected: Expected::default(),
            retry: Default::default(),
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_open_port_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let checker = TcpChecker::new();
        let result = checker.check(&check(&addr.to_string())).await;
        assert_eq!(result.status, Status::Up);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_closed_port_is_down() {
        // Bind then drop to get a port that is almost surely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let checker = TcpChecker::new();
        let result = checker.check(&check(&addr.to_string())).await;
        assert_eq!(result.status, Status::Down);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_slow_connection_flagged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut cfg = check(&addr.to_string());
        cfg.expected.response_time_max = Some(Duration::ZERO);

        let checker = TcpChecker::new();
        let result = checker.check(&cfg).await;
        assert_eq!(result.status, Status::Slow);
        assert!(result.error.unwrap().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_private_target_rejected() {
        let checker = TcpChecker::new();
        let result = checker.check(&check("10.0.0.5:5432")).await;
        assert_eq!(result.status, Status::Error);
    }
}
