// checker/http.rs — HTTP/HTTPS probe executor.
// Validates the target before any I/O, sends one request with the
// probe deadline, reads the body up to a cap, and grades the
// response against the check's expectations.

use async_trait::async_trait;
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::Checker;
use crate::security;
use crate::types::{CheckConfig, CheckResult, Expected, Status};

/// Response headers copied into the result.
const PROJECTED_HEADERS: &[&str] = &["Content-Type", "Content-Length", "Server", "Cache-Control"];

/// Bodies are read at most this far; anything beyond is discarded
/// but still counted toward min_body_size checks up to the cap.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const MAX_REDIRECTS: usize = 5;

pub struct HttpChecker {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpChecker {
    /// Build the shared client: pooled connections, TLS ≥ 1.2,
    /// certificate verification on, and a redirect policy that
    /// caps hops at five and re-runs the SSRF guard on every hop.
    pub fn new(user_agent: &str) -> Result<Self, crate::errors::MonitorError> {
        let redirect_policy = reqwest::redirect::Policy::custom(|attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error(format!("too many redirects (max {MAX_REDIRECTS})"));
            }
            if let Err(e) = security::validate_url(attempt.url().as_str()) {
                return attempt.error(format!("redirect target rejected: {e}"));
            }
            attempt.follow()
        });

        let client = reqwest::Client::builder()
            .redirect(redirect_policy)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| {
                crate::errors::MonitorError::internal(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(HttpChecker {
            client,
            user_agent: user_agent.to_string(),
        })
    }
}

#[async_trait]
impl Checker for HttpChecker {
    fn name(&self) -> &'static str {
        "HTTP"
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

        // Reject before any I/O: SSRF guard and header injection.
        if let Err(e) = security::validate_url(&check.url) {
            result.error = Some(format!("URL validation failed: {e}"));
            result.response_time = start.elapsed();
            return result;
        }
        if let Err(e) = security::validate_http_headers(&check.headers) {
            result.error = Some(format!("header validation failed: {e}"));
            result.response_time = start.elapsed();
            return result;
        }

        let method = match reqwest::Method::from_bytes(check.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                result.error = Some(format!("invalid HTTP method: {}", check.method));
                result.response_time = start.elapsed();
                return result;
            }
        };

        let mut request = self
            .client
            .request(method, &check.url)
            .timeout(check.timeout);

        for (key, value) in &check.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if !check.headers.keys().any(|k| k.eq_ignore_ascii_case("user-agent")) {
            request = request.header("User-Agent", &self.user_agent);
        }
        if let Some(body) = &check.body {
            request = request.body(body.clone());
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                result.response_time = start.elapsed();
                result.status = Status::Down;
                result.error = Some(if e.is_timeout() {
                    format!("request timed out after {:?}", check.timeout)
                } else if e.is_redirect() {
                    // Carries either the hop-cap or a blocked hop.
                    format!("too many redirects or rejected redirect: {e}")
                } else {
                    format!("request failed: {e}")
                });
                return result;
            }
        };

        // Response time is measured to first response, matching how
        // slow-endpoint thresholds are usually meant.
        let duration = start.elapsed();
        result.response_time = duration;

        let status_code = response.status().as_u16();
        result.status_code = Some(status_code);

        for header in PROJECTED_HEADERS {
            if let Some(value) = response.headers().get(*header) {
                if let Ok(text) = value.to_str() {
                    result.headers.insert((*header).to_string(), text.to_string());
                }
            }
        }
        let content_type = result.headers.get("Content-Type").cloned();

        let body = match read_body_capped(response).await {
            Ok(body) => body,
            Err(e) => {
                result.status = Status::Error;
                result.error = Some(format!("failed to read response body: {e}"));
                return result;
            }
        };
        result.body_size = body.len() as u64;
        debug!(
            name = %check.name,
            status_code,
            body_size = result.body_size,
            elapsed_ms = duration.as_millis() as u64,
            "http probe completed"
        );

        if let Err(reason) =
            validate_response(status_code, &body, content_type.as_deref(), &check.expected)
        {
            // A response that also ran over the time budget grades
            // SLOW; every other validation failure is DOWN.
            result.status = match check.expected.response_time_max {
                Some(max) if duration > max => Status::Slow,
                _ => Status::Down,
            };
            result.error = Some(format!("response validation failed: {reason}"));
            return result;
        }

        if let Some(max) = check.expected.response_time_max {
            if duration > max {
                result.status = Status::Slow;
                result.error = Some(format!(
                    "response time {duration:?} exceeds maximum {max:?}"
                ));
                return result;
            }
        }

        result.status = Status::Up;
        result
    }
}

/// Drain the body up to MAX_BODY_BYTES.
async fn read_body_capped(mut response: reqwest::Response) -> Result<Vec<u8>, reqwest::Error> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let remaining = MAX_BODY_BYTES.saturating_sub(body.len());
        if remaining == 0 {
            break;
        }
        let take = remaining.min(chunk.len());
        body.extend_from_slice(&chunk[..take]);
        if take < chunk.len() {
            break;
        }
    }
    Ok(body)
}

/// Grade a response against the expectations. Returns the first
/// failure in evaluation order: status code, body content, content
/// type, body size.
fn validate_response(
    status_code: u16,
    body: &[u8],
    content_type: Option<&str>,
    expected: &Expected,
) -> Result<(), String> {
    if let Some((lo, hi)) = expected.status_range {
        if status_code < lo || status_code > hi {
            return Err(format!(
                "status code {status_code} not in expected range {lo}-{hi}"
            ));
        }
    } else if let Some(want) = expected.status {
        if status_code != want {
            return Err(format!("expected status {want}, got {status_code}"));
        }
    }

    let body_text = String::from_utf8_lossy(body);

    if let Some(needle) = &expected.body_contains {
        if !body_text.contains(needle.as_str()) {
            return Err(format!("response body does not contain '{needle}'"));
        }
    }
    if let Some(needle) = &expected.body_not_contains {
        if body_text.contains(needle.as_str()) {
            return Err(format!("response body contains unwanted content '{needle}'"));
        }
    }

    if let Some(want) = &expected.content_type {
        let got = content_type.unwrap_or("");
        if !got.contains(want.as_str()) {
            return Err(format!("expected content type '{want}', got '{got}'"));
        }
    }

    if let Some(min) = expected.min_body_size {
        if (body.len() as u64) < min {
            return Err(format!(
                "response body size {} bytes is less than minimum {min} bytes",
                body.len()
            ));
        }
    }

    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────
