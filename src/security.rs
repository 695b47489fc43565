// ──────────────────────────────────────────────────────────────
//  Pulseguard — Security Validator
//  Guards every outbound probe against SSRF (private, loopback,
//  and link-local targets), blocks header injection, restricts
//  file paths, and masks secrets before they reach the logs.
// ──────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use tracing::warn;
use url::Url;

use crate::errors::MonitorError;

// ── URL / target validation ────────────────────────────────────

/// Validate a probe URL. Rejects non-HTTP(S) schemes and any host
/// that is (or resolves to) a private, loopback, or link-local
/// address. `localhost`, `127.0.0.1`, and `::1` are permitted for
/// development setups.
///
/// Called before the first request and again on every redirect hop.
pub fn validate_url(raw: &str) -> Result<(), MonitorError> {
    if raw.is_empty() {
        return Err(MonitorError::validation("URL cannot be empty"));
    }

    let parsed =
        Url::parse(raw).map_err(|e| MonitorError::validation(format!("invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(MonitorError::validation(format!(
                "only http and https schemes are allowed, got: {other}"
            )))
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| MonitorError::validation("URL must have a hostname"))?;

    ensure_host_not_private(host)
}

/// Validate an SSL check target. Accepts both `scheme://host[:port]`
/// URLs and bare `host[:port]` strings; applies the same private-IP
/// guard as [`validate_url`].
pub fn validate_ssl_target(target: &str) -> Result<(), MonitorError> {
    if target.is_empty() {
        return Err(MonitorError::validation("target cannot be empty"));
    }

    if target.contains("://") {
        let parsed = Url::parse(target)
            .map_err(|e| MonitorError::validation(format!("invalid URL: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(MonitorError::validation(format!(
                    "only http and https schemes are allowed for SSL checks, got: {other}"
                )))
            }
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| MonitorError::validation("URL must have a hostname"))?;
        return ensure_host_not_private(host);
    }

    // host[:port] form. IPv6 literals arrive bracketed: [::1]:443
    let host = split_host(target);
    if host.is_empty() {
        return Err(MonitorError::validation("hostname cannot be empty"));
    }
    ensure_host_not_private(host)
}

/// Extract the host portion of a `host[:port]` string.
fn split_host(target: &str) -> &str {
    if let Some(stripped) = target.strip_prefix('[') {
        return stripped.split(']').next().unwrap_or(stripped);
    }
    // A bare IPv6 address has more than one colon and no brackets.
    if target.matches(':').count() > 1 {
        return target;
    }
    target.split(':').next().unwrap_or(target)
}

fn ensure_host_not_private(host: &str) -> Result<(), MonitorError> {
    // Development exemption: explicit loopback names are fine.
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        return Ok(());
    }

    // Literal IP — check the ranges directly, no DNS involved.
    if let Ok(ip) = host.parse::<IpAddr>() {
        if let Some(reason) = private_ip_reason(ip) {
            warn!(host = host, reason = %reason, "probe target blocked: private address");
            return Err(MonitorError::validation(format!(
                "target is a private address: {reason}"
            )));
        }
        return Ok(());
    }

    // Hostname — resolve and check every address it maps to.
    let addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| MonitorError::validation(format!("failed to resolve {host}: {e}")))?;

    for addr in addrs {
        if let Some(reason) = private_ip_reason(addr.ip()) {
            warn!(host = host, reason = %reason, "probe target blocked: resolves to private address");
            return Err(MonitorError::validation(format!(
                "{host} resolves to a private address: {reason}"
            )));
        }
    }

    Ok(())
}

/// Classify an address against the off-limits ranges. Returns a
/// human-readable reason for the first matching range, or None when
/// the address is publicly routable. Standard-library predicates
/// cover most ranges; CGNAT and the 0.0.0.0/8 block need explicit
/// octet checks.
fn private_ip_reason(ip: IpAddr) -> Option<String> {
    let matched_range = match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            let table: &[(bool, &str)] = &[
                (v4.is_loopback(), "the loopback range 127.0.0.0/8"),
                (octets[0] == 0, "the this-network block 0.0.0.0/8"),
                (v4.is_private(), "RFC 1918 private space"),
                (v4.is_link_local(), "the link-local range 169.254.0.0/16"),
                (
                    octets[0] == 100 && (64..128).contains(&octets[1]),
                    "the carrier-grade NAT range 100.64.0.0/10",
                ),
                (v4.is_broadcast(), "the limited-broadcast address"),
            ];
            table
                .iter()
                .find_map(|&(matches, range)| matches.then_some(range))
        }
        IpAddr::V6(v6) => {
            let head = v6.segments()[0];
            let table: &[(bool, &str)] = &[
                (v6.is_loopback(), "the IPv6 loopback address"),
                (v6.is_unspecified(), "the IPv6 unspecified address"),
                (head & 0xffc0 == 0xfe80, "the IPv6 link-local range fe80::/10"),
                (head & 0xfe00 == 0xfc00, "the IPv6 unique-local range fc00::/7"),
            ];
            table
                .iter()
                .find_map(|&(matches, range)| matches.then_some(range))
        }
    };

    matched_range.map(|range| format!("{ip} falls in {range}"))
}

// ── Header validation ──────────────────────────────────────────

/// Reject request headers that could smuggle extra header lines or
/// override transport framing. Runs before any network I/O.
pub fn validate_http_headers(headers: &HashMap<String, String>) -> Result<(), MonitorError> {
    for (key, value) in headers {
        if key.contains('\r') || key.contains('\n') {
            return Err(MonitorError::validation(format!(
                "header name contains CR/LF: {}",
                sanitize_for_logs(key)
            )));
        }
        if value.contains('\r') || value.contains('\n') {
            return Err(MonitorError::validation(format!(
                "header value contains CR/LF for key: {key}"
            )));
        }
        if key.trim().is_empty() {
            return Err(MonitorError::validation("header name cannot be empty"));
        }

        match key.to_ascii_lowercase().as_str() {
            "content-length" => {
                return Err(MonitorError::validation(
                    "content-length must not be set manually",
                ))
            }
            "host" => validate_host_header(value)?,
            _ => {}
        }
    }
    Ok(())
}

fn validate_host_header(host: &str) -> Result<(), MonitorError> {
    if host.is_empty() {
        return Err(MonitorError::validation("host header cannot be empty"));
    }
    Url::parse(&format!("http://{host}"))
        .map_err(|e| MonitorError::validation(format!("invalid host header: {e}")))?;
    Ok(())
}

// ── File-path validation ───────────────────────────────────────

const SENSITIVE_PREFIXES: &[&str] = &[
    "/etc/", "/proc/", "/sys/", "/dev/", "/root/", "/home/", "/usr/",
];

/// Reject paths with traversal components or under system directories.
/// Used for the storage path and snapshot file locations.
pub fn validate_file_path(path: &str) -> Result<(), MonitorError> {
    if path.is_empty() {
        return Err(MonitorError::validation("file path cannot be empty"));
    }
    if path.contains("..") {
        return Err(MonitorError::validation(format!(
            "file path contains traversal component: {path}"
        )));
    }
    for prefix in SENSITIVE_PREFIXES {
        if path.starts_with(prefix) {
            return Err(MonitorError::validation(format!(
                "access to sensitive path not allowed: {path}"
            )));
        }
    }
    Ok(())
}

// ── Log hygiene ────────────────────────────────────────────────

/// Mask the local part of an email address: `user@example.com`
/// becomes `us***@example.com`.
pub fn mask_email(email: &str) -> String {
    if email.is_empty() {
        return String::new();
    }
    let mut parts = email.splitn(2, '@');
    let local = parts.next().unwrap_or("");
    let Some(domain) = parts.next() else {
        return "***".to_string();
    };
    if local.chars().count() <= 2 {
        return format!("***@{domain}");
    }
    let prefix: String = local.chars().take(2).collect();
    format!("{prefix}***@{domain}")
}

/// Mask the path of a URL, keeping scheme and host. Webhook URLs
/// carry their secret in the path, so everything after the host is
/// replaced.
pub fn mask_url(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    match Url::parse(raw) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or("***");
            format!("{}://{}/***", parsed.scheme(), host)
        }
        Err(_) => "***".to_string(),
    }
}

/// Blank out `key=value` style secrets embedded in free-form text
/// before it is logged.
pub fn sanitize_for_logs(message: &str) -> String {
    static SECRET_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = SECRET_RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\b(password|token|api_key|secret|key|webhook)=\S+")
            .expect("secret pattern is valid")
    });
    re.replace_all(message, "$1=***").into_owned()
}

// ── Tests ──────────────────────────────────────────────────────
