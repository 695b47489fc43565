// ──────────────────────────────────────────────────────────────
//  Pulseguard — Configuration
//  YAML (or JSON) document with global settings, the check list,
//  and notification channels. Environment tokens ${VAR} and
//  ${VAR:default} are interpolated before parsing; the whole
//  document is validated before the engine ever sees it.
// ──────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::MonitorError;
use crate::notifier::{NotificationsConfig, Notifier};
use crate::security;
use crate::types::{CheckConfig, CheckType, CircuitBreakerConfig, MemoryConfig, RateLimitConfig};

const EXAMPLE_CONFIG: &str = include_str!("../config/pulseguard.yaml");

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH"];
const ALLOWED_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error", "fatal"];

const MAX_NAME_LEN: usize = 100;
const MAX_RETRY_ATTEMPTS: u32 = 10;

// ── Document shape ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub default_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub default_interval: Duration,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub disable_colors: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub memory_management: MemoryConfig,
}

fn default_max_workers() -> usize {
    10
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_storage_path() -> String {
    "./pulseguard.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_user_agent() -> String {
    concat!("pulseguard/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            max_workers: default_max_workers(),
            default_timeout: default_timeout(),
            default_interval: default_interval(),
            storage_path: default_storage_path(),
            log_level: default_log_level(),
            disable_colors: false,
            user_agent: default_user_agent(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            memory_management: MemoryConfig::default(),
        }
    }
}

// ── Loading ────────────────────────────────────────────────────

impl AppConfig {
    /// Read, interpolate, parse, and validate a config file. The
    /// YAML parser also accepts JSON documents.
    pub fn load(path: &str) -> Result<Self, MonitorError> {
        security::validate_file_path(path)?;

        let raw = std::fs::read_to_string(path).map_err(|e| {
            MonitorError::configuration(format!("failed to read config {path}: {e}"))
        })?;

        let expanded = expand_env(&raw);
        let config: AppConfig = serde_yaml::from_str(&expanded)
            .map_err(|e| MonitorError::configuration(format!("failed to parse {path}: {e}")))?;

        config.validate()?;
        info!(path = path, checks = config.checks.len(), "configuration loaded");
        Ok(config)
    }

    /// The annotated example document shipped with the binary.
    pub fn example() -> &'static str {
        EXAMPLE_CONFIG
    }

    /// Validate the whole document. Returns the first problem found.
    pub fn validate(&self) -> Result<(), MonitorError> {
        let g = &self.global;
        if g.max_workers == 0 {
            return Err(MonitorError::configuration("global.max_workers must be > 0"));
        }
        if g.default_timeout.is_zero() {
            return Err(MonitorError::configuration(
                "global.default_timeout must be > 0",
            ));
        }
        if g.default_interval < Duration::from_secs(1) {
            return Err(MonitorError::configuration(
                "global.default_interval must be at least 1s",
            ));
        }
        if g.user_agent.trim().is_empty() {
            return Err(MonitorError::configuration(
                "global.user_agent must not be empty",
            ));
        }
        if !ALLOWED_LOG_LEVELS.contains(&g.log_level.as_str()) {
            return Err(MonitorError::configuration(format!(
                "global.log_level must be one of {ALLOWED_LOG_LEVELS:?}, got '{}'",
                g.log_level
            )));
        }
        if g.max_retries > MAX_RETRY_ATTEMPTS {
            return Err(MonitorError::configuration(format!(
                "global.max_retries must be at most {MAX_RETRY_ATTEMPTS}"
            )));
        }
        if g.storage_path.is_empty() {
            return Err(MonitorError::configuration(
                "global.storage_path must not be empty",
            ));
        }
        if g.storage_path != ":memory:" {
            let path = g
                .storage_path
                .strip_prefix("memory://")
                .unwrap_or(&g.storage_path);
            security::validate_file_path(path)?;
        }

        let mut seen = HashSet::new();
        for check in &self.checks {
            validate_check(check)?;
            if !seen.insert(check.name.as_str()) {
                return Err(MonitorError::configuration(format!(
                    "duplicate check name: {}",
                    check.name
                )));
            }
        }

        self.assert_env_expanded()?;

        // Channel construction performs the per-channel checks
        // (required parameters, the TLS/auth contradiction).
        Notifier::new(&self.notifications)?;

        Ok(())
    }

    /// Enabled channels must not carry unexpanded `${VAR}` tokens —
    /// that means a required environment variable was never set.
    fn assert_env_expanded(&self) -> Result<(), MonitorError> {
        let n = &self.notifications;
        let mut unexpanded: Vec<(&str, &str)> = Vec::new();

        if n.email.enabled {
            for (field, value) in [
                ("email.smtp_host", n.email.smtp_host.as_str()),
                ("email.username", n.email.username.as_str()),
                ("email.password", n.email.password.as_str()),
                ("email.from", n.email.from.as_str()),
            ] {
                if value.contains("${") {
                    unexpanded.push((field, value));
                }
            }
        }
        if n.slack.enabled && n.slack.webhook_url.contains("${") {
            unexpanded.push(("slack.webhook_url", n.slack.webhook_url.as_str()));
        }
        if n.discord.enabled && n.discord.webhook_url.contains("${") {
            unexpanded.push(("discord.webhook_url", n.discord.webhook_url.as_str()));
        }
        if n.webhook.enabled && n.webhook.url.contains("${") {
            unexpanded.push(("webhook.url", n.webhook.url.as_str()));
        }
        if n.telegram.enabled {
            if n.telegram.bot_token.contains("${") {
                unexpanded.push(("telegram.bot_token", "***"));
            }
            if n.telegram.chat_id.contains("${") {
                unexpanded.push(("telegram.chat_id", n.telegram.chat_id.as_str()));
            }
        }

        for check in &self.checks {
            for (name, value) in &check.headers {
                if value.contains("${") {
                    return Err(MonitorError::configuration(format!(
                        "check {}: header {name} references an unset environment variable",
                        check.name
                    )));
                }
            }
        }

        if let Some((field, _)) = unexpanded.first() {
            return Err(MonitorError::configuration(format!(
                "notifications.{field} references an unset environment variable"
            )));
        }
        Ok(())
    }
}

fn validate_check(check: &CheckConfig) -> Result<(), MonitorError> {
    if check.name.trim().is_empty() {
        return Err(MonitorError::configuration("check name must not be empty"));
    }
    if check.name.chars().count() > MAX_NAME_LEN {
        let preview: String = check.name.chars().take(MAX_NAME_LEN).collect();
        return Err(MonitorError::configuration(format!(
            "check name '{preview}…' exceeds {MAX_NAME_LEN} characters"
        )));
    }
    if check.url.trim().is_empty() {
        return Err(MonitorError::configuration(format!(
            "check {}: url must not be empty",
            check.name
        )));
    }
    if check.interval.is_zero() {
        return Err(MonitorError::configuration(format!(
            "check {}: interval must be > 0",
            check.name
        )));
    }
    if check.timeout.is_zero() {
        return Err(MonitorError::configuration(format!(
            "check {}: timeout must be > 0",
            check.name
        )));
    }
    if check.timeout >= check.interval {
        return Err(MonitorError::configuration(format!(
            "check {}: timeout must be shorter than interval",
            check.name
        )));
    }

    match check.check_type {
        CheckType::Http => {
            let method = check.method.to_ascii_uppercase();
            if !ALLOWED_METHODS.contains(&method.as_str()) {
                return Err(MonitorError::configuration(format!(
                    "check {}: method '{}' is not allowed",
                    check.name, check.method
                )));
            }
            // Syntactic URL check here; the resolving SSRF guard
            // runs again on every probe.
            let parsed = url::Url::parse(&check.url).map_err(|e| {
                MonitorError::configuration(format!("check {}: invalid url: {e}", check.name))
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(MonitorError::configuration(format!(
                    "check {}: http checks require an http(s) url",
                    check.name
                )));
            }
            security::validate_http_headers(&check.headers)?;
        }
        CheckType::Tcp | CheckType::Ssl => {
            if check.url.contains("://") {
                let parsed = url::Url::parse(&check.url).map_err(|e| {
                    MonitorError::configuration(format!("check {}: invalid url: {e}", check.name))
                })?;
                if parsed.host_str().is_none() {
                    return Err(MonitorError::configuration(format!(
                        "check {}: target has no hostname",
                        check.name
                    )));
                }
            }
        }
    }

    if let Some((lo, hi)) = check.expected.status_range {
        if lo > hi {
            return Err(MonitorError::configuration(format!(
                "check {}: status_range [{lo}, {hi}] is inverted",
                check.name
            )));
        }
    }

    if check.retry.attempts > MAX_RETRY_ATTEMPTS {
        return Err(MonitorError::configuration(format!(
            "check {}: retry.attempts must be at most {MAX_RETRY_ATTEMPTS}",
            check.name
        )));
    }

    Ok(())
}

// ── Environment interpolation ──────────────────────────────────

/// Replace `${VAR}`, `${VAR:default}`, and bare `$VAR` tokens with
/// environment values. Unset variables without a default keep the
/// token so validation can point at it.
pub fn expand_env(input: &str) -> String {
    static BRACED: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    static BARE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let braced = BRACED.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}")
            .expect("braced env pattern is valid")
    });
    let bare = BARE.get_or_init(|| {
        regex::Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("bare env pattern is valid")
    });

    let pass1 = braced.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => value,
            _ => match caps.get(2) {
                Some(default) if !default.as_str().is_empty() => default.as_str().to_string(),
                _ => {
                    warn!(variable = name, "environment variable not set and no default given");
                    caps[0].to_string()
                }
            },
        }
    });

    bare.replace_all(&pass1, |caps: &regex::Captures<'_>| {
        match std::env::var(&caps[1]) {
            Ok(value) if !value.is_empty() => value,
            _ => caps[0].to_string(),
        }
    })
    .into_owned()
}

// ── Tests ──────────────────────────────────────────────────────
