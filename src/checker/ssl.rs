// checker/ssl.rs — TLS certificate probe.
// Performs a verified handshake against the target, reads the leaf
// certificate, and grades validity, time-to-expiry, and domain
// coverage. Accepts both URLs and bare host[:port] targets.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use url::Url;
use x509_parser::prelude::*;

use super::Checker;
use crate::security;
use crate::types::{CertInfo, CheckConfig, CheckResult, Expected, Status};

pub struct SslChecker {
    connector: TlsConnector,
}

impl SslChecker {
    /// Build the connector with the webpki root set. Chain
    /// verification is never skipped.
    pub fn new() -> Result<Self, crate::errors::MonitorError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        // Pinning the provider keeps the build independent of which
        // crypto backends other dependencies pull in.
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| {
                crate::errors::MonitorError::internal(format!("TLS config rejected: {e}"))
            })?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(SslChecker {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Checker for SslChecker {
    fn name(&self) -> &'static str {
        "SSL"
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

        if let Err(e) = security::validate_ssl_target(&check.url) {
            result.error = Some(format!("target validation failed: {e}"));
            result.response_time = start.elapsed();
            return result;
        }

        let (host, port) = match parse_host_port(&check.url) {
            Ok(pair) => pair,
            Err(e) => {
                result.error = Some(format!("failed to parse host:port from target: {e}"));
                result.response_time = start.elapsed();
                return result;
            }
        };

        let cert_info = match timeout(check.timeout, self.fetch_leaf_cert(&host, port)).await {
            Err(_) => {
                result.response_time = start.elapsed();
                result.status = Status::Down;
                result.error = Some(format!(
                    "TLS handshake timed out after {:?}",
                    check.timeout
                ));
                return result;
            }
            Ok(Err(e)) => {
                result.response_time = start.elapsed();
                result.status = Status::Down;
                result.error = Some(format!("failed to get certificate info: {e}"));
                return result;
            }
            Ok(Ok(info)) => info,
        };

        let duration = start.elapsed();
        result.response_time = duration;
        result.cert_info = Some(cert_info.clone());

        if let Err(reason) = validate_certificate(&cert_info, &check.expected) {
            result.status = Status::Warning;
            result.error = Some(format!("certificate validation failed: {reason}"));
            return result;
        }

        if let Some(max) = check.expected.response_time_max {
            if duration > max {
                result.status = Status::Slow;
                result.error = Some(format!(
                    "TLS handshake time {duration:?} exceeds maximum {max:?}"
                ));
                return result;
            }
        }

        result.status = Status::Up;
        result
    }
}

impl SslChecker {
    /// Connect, handshake with SNI = host, and parse the leaf.
    async fn fetch_leaf_cert(&self, host: &str, port: u16) -> Result<CertInfo, String> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| format!("TCP connection failed: {e}"))?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| format!("invalid server name '{host}': {e}"))?;

        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| format!("TLS handshake failed: {e}"))?;

        let (_, conn) = tls.get_ref();
        let certs = conn
            .peer_certificates()
            .ok_or_else(|| "no certificates presented".to_string())?;
        let leaf = certs
            .first()
            .ok_or_else(|| "empty certificate chain".to_string())?;

        parse_cert_info(leaf.as_ref())
    }
}

/// Extract the fields we report from a DER-encoded certificate.
fn parse_cert_info(der: &[u8]) -> Result<CertInfo, String> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| format!("failed to parse certificate: {e}"))?;

    let not_before = DateTime::<Utc>::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .ok_or_else(|| "certificate not_before out of range".to_string())?;
    let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| "certificate not_after out of range".to_string())?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push((*dns).to_string());
            }
        }
    }

    let now = Utc::now();
    Ok(CertInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        expiry_date: not_after,
        days_to_expiry: (not_after - now).num_days(),
        is_valid: now >= not_before && now < not_after,
        common_name,
        dns_names,
    })
}

/// Certificate validation ladder, first failure wins: current
/// validity, expiry threshold, then domain coverage.
fn validate_certificate(cert: &CertInfo, expected: &Expected) -> Result<(), String> {
    if !cert.is_valid {
        return Err("certificate is not currently valid (expired or not yet valid)".to_string());
    }

    if let Some(threshold) = expected.cert_expiry_days {
        if threshold > 0 && cert.days_to_expiry <= threshold {
            return Err(format!(
                "certificate expires in {} days (threshold: {} days)",
                cert.days_to_expiry, threshold
            ));
        }
    }

    if !expected.cert_valid_domains.is_empty() {
        let mut covered_names: Vec<&str> = Vec::with_capacity(cert.dns_names.len() + 1);
        if !cert.common_name.is_empty() {
            covered_names.push(&cert.common_name);
        }
        covered_names.extend(cert.dns_names.iter().map(String::as_str));

        for domain in &expected.cert_valid_domains {
            if !domain_covered(domain, &covered_names) {
                return Err(format!(
                    "certificate does not cover expected domain: {domain}"
                ));
            }
        }
    }

    Ok(())
}

/// Exact match, or wildcard `*.X` covering `sub.X`.
fn domain_covered(domain: &str, names: &[&str]) -> bool {
    names.iter().any(|name| {
        if *name == domain {
            return true;
        }
        name.strip_prefix("*.")
            .is_some_and(|suffix| domain.ends_with(&format!(".{suffix}")))
    })
}

/// Split a URL or bare `host[:port]` target, defaulting to 443.
fn parse_host_port(target: &str) -> Result<(String, u16), String> {
    if target.contains("://") {
        let parsed = Url::parse(target).map_err(|e| format!("invalid URL: {e}"))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| "URL has no hostname".to_string())?
            .trim_matches(['[', ']'])
            .to_string();
        let port = parsed.port().unwrap_or(match parsed.scheme() {
            "http" => 80,
            _ => 443,
        });
        return Ok((host, port));
    }

    // Bracketed IPv6 literal: [::1]:8443
    if let Some(stripped) = target.strip_prefix('[') {
        let mut parts = stripped.splitn(2, ']');
        let host = parts.next().unwrap_or_default().to_string();
        let port = match parts.next() {
            Some(rest) if rest.starts_with(':') => rest[1..]
                .parse::<u16>()
                .map_err(|_| format!("invalid port in target: {target}"))?,
            _ => 443,
        };
        return Ok((host, port));
    }

    // Bare IPv6 without brackets has multiple colons: no port part.
    if target.matches(':').count() > 1 {
        return Ok((target.to_string(), 443));
    }

    match target.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid port in target: {target}"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((target.to_string(), 443)),
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cert(days_to_expiry: i64, is_valid: bool, cn: &str, dns: &[&str]) -> CertInfo {
        CertInfo {
            subject: format!("CN={cn}"),
            issuer: "CN=Test CA".to_string(),
            expiry_date: Utc::now() + chrono::Duration::days(days_to_expiry),
            days_to_expiry,
            is_valid,
            common_name: cn.to_string(),
            dns_names: dns.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_host_port_forms() {
        assert_eq!(
            parse_host_port("https://api.example.com").unwrap(),
            ("api.example.com".to_string(), 443)
        );
        assert_eq!(
            parse_host_port("https://api.example.com:8443").unwrap(),
            ("api.example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_host_port("http://api.example.com").unwrap(),
            ("api.example.com".to_string(), 80)
        );
        assert_eq!(
            parse_host_port("api.example.com").unwrap(),
            ("api.example.com".to_string(), 443)
        );
        assert_eq!(
            parse_host_port("api.example.com:993").unwrap(),
            ("api.example.com".to_string(), 993)
        );
        assert_eq!(
            parse_host_port("[::1]:8443").unwrap(),
            ("::1".to_string(), 8443)
        );
        assert!(parse_host_port("host:notaport").is_err());
    }

    #[test]
    fn test_invalid_certificate_fails_first() {
        let expected = Expected {
            cert_expiry_days: Some(30),
            ..Expected::default()
        };
        let err = validate_certificate(&cert(-5, false, "example.com", &[]), &expected)
            .unwrap_err();
        assert!(err.contains("not currently valid"));
    }

    #[test]
    fn test_near_expiry_warns() {
        let expected = Expected {
            cert_expiry_days: Some(14),
            ..Expected::default()
        };
        let err =
            validate_certificate(&cert(7, true, "example.com", &[]), &expected).unwrap_err();
        assert!(err.contains("expires in 7 days"));
        assert!(err.contains("threshold: 14"));

        // Outside the threshold: fine.
        assert!(validate_certificate(&cert(60, true, "example.com", &[]), &expected).is_ok());
    }

    #[test]
    fn test_domain_coverage_exact_and_wildcard() {
        let expected = Expected {
            cert_valid_domains: vec!["api.example.com".to_string()],
            ..Expected::default()
        };

        // Exact SAN entry.
        assert!(validate_certificate(
            &cert(90, true, "example.com", &["api.example.com"]),
            &expected
        )
        .is_ok());

        // Wildcard SAN covers one level down.
        assert!(validate_certificate(
            &cert(90, true, "example.com", &["*.example.com"]),
            &expected
        )
        .is_ok());

        // No coverage at all.
        let err = validate_certificate(&cert(90, true, "other.org", &["other.org"]), &expected)
            .unwrap_err();
        assert!(err.contains("does not cover"));
    }

    #[test]
    fn test_wildcard_does_not_match_bare_domain() {
        // *.example.com must not cover example.com itself.
        assert!(!domain_covered("example.com", &["*.example.com"]));
        assert!(domain_covered("api.example.com", &["*.example.com"]));
        assert!(!domain_covered("deep.api.example.com", &["*.api.example.org"]));
    }

    #[tokio::test]
    async fn test_handshake_against_plain_listener_is_down() {
        // A plain TCP listener cannot complete a TLS handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let checker = SslChecker::new().unwrap();
        let check = CheckConfig {
            name: "ssl-test".to_string(),
            check_type: crate::types::CheckType::Ssl,
            url: format!("127.0.0.1:{}", addr.port()),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(2),
            method: String::new(),
            headers: HashMap::new(),
            body: None,
            expected: Expected::default(),
            retry: Default::default(),
            tags: Vec::new(),
        };

        let result = checker.check(&check).await;
        assert_eq!(result.status, Status::Down);
        assert!(result.error.is_some());
    }
}
