// notifier — Alert dispatch.
// Rule-gated fan-out to every enabled channel. Global rules decide
// whether a result is alertable at all; per-service cooldown and a
// rolling alert cap keep channels from being flooded. Channels are
// attempted in a fixed order and failures are aggregated, never
// short-circuited.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::MonitorError;
use crate::security;
use crate::types::{CheckResult, Status};

mod discord;
mod email;
mod slack;
mod telegram;
mod webhook;

pub use discord::DiscordChannel;
pub use email::EmailChannel;
pub use slack::SlackChannel;
pub use telegram::TelegramChannel;
pub use webhook::WebhookChannel;

// ── Configuration ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub global_rules: NotificationRules,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default = "default_true")]
    pub tls: bool,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub icon_emoji: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_webhook_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(with = "humantime_serde", default = "default_webhook_timeout")]
    pub timeout: Duration,
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

/// When alerts fire and how often.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRules {
    #[serde(default)]
    pub on_success: bool,
    #[serde(default = "default_true")]
    pub on_failure: bool,
    #[serde(default = "default_true")]
    pub on_recovery: bool,
    #[serde(default = "default_true")]
    pub on_slow_response: bool,
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub cooldown: Duration,
    #[serde(default = "default_max_alerts")]
    pub max_alerts: u32,
    /// Accepted and round-tripped; escalation itself is not wired up.
    #[serde(with = "humantime_serde", default = "default_escalation_delay")]
    pub escalation_delay: Duration,
}

fn default_cooldown() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_alerts() -> u32 {
    10
}

fn default_escalation_delay() -> Duration {
    Duration::from_secs(15 * 60)
}

impl Default for NotificationRules {
    fn default() -> Self {
        NotificationRules {
            on_success: false,
            on_failure: true,
            on_recovery: true,
            on_slow_response: true,
            cooldown: default_cooldown(),
            max_alerts: default_max_alerts(),
            escalation_delay: default_escalation_delay(),
        }
    }
}

// ── Channel contract ───────────────────────────────────────────

/// A single delivery mechanism. Channels format and send; they do
/// not decide whether a result is alertable.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, result: &CheckResult) -> Result<(), MonitorError>;
}

/// Whether a result actually went out to any channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Dispatched,
    Suppressed,
}

// ── Manager ────────────────────────────────────────────────────

struct NotifierState {
    last_sent: HashMap<String, DateTime<Utc>>,
    previous_status: HashMap<String, Status>,
    dispatch_log: HashMap<String, Vec<DateTime<Utc>>>,
}

pub struct Notifier {
    rules: NotificationRules,
    channels: Vec<Box<dyn Channel>>,
    state: Mutex<NotifierState>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("rules", &self.rules)
            .field("channels", &self.channels.iter().map(|c| c.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Notifier {
    /// Build the dispatcher from config. Channel misconfiguration
    /// (e.g. SMTP credentials without TLS) fails here, before the
    /// first send ever happens.
    pub fn new(config: &NotificationsConfig) -> Result<Self, MonitorError> {
        let mut channels: Vec<Box<dyn Channel>> = Vec::new();

        // Deterministic dispatch order.
        if config.email.enabled {
            info!(
                host = %config.email.smtp_host,
                from = %security::mask_email(&config.email.from),
                "email notifications enabled"
            );
            channels.push(Box::new(EmailChannel::new(config.email.clone())?));
        }
        if config.slack.enabled {
            info!(url = %security::mask_url(&config.slack.webhook_url), "slack notifications enabled");
            channels.push(Box::new(SlackChannel::new(config.slack.clone())?));
        }
        if config.discord.enabled {
            info!(url = %security::mask_url(&config.discord.webhook_url), "discord notifications enabled");
            channels.push(Box::new(DiscordChannel::new(config.discord.clone())?));
        }
        if config.webhook.enabled {
            info!(url = %security::mask_url(&config.webhook.url), "webhook notifications enabled");
            channels.push(Box::new(WebhookChannel::new(config.webhook.clone())?));
        }
        if config.telegram.enabled {
            info!("telegram notifications enabled");
            channels.push(Box::new(TelegramChannel::new(config.telegram.clone())?));
        }

        Ok(Notifier {
            rules: config.global_rules.clone(),
            channels,
            state: Mutex::new(NotifierState {
                last_sent: HashMap::new(),
                previous_status: HashMap::new(),
                dispatch_log: HashMap::new(),
            }),
        })
    }

    /// Evaluate the rules for one result and dispatch if they pass.
    /// Per-channel failures are collected into one aggregate error;
    /// a single successful channel still counts as dispatched and
    /// arms the cooldown.
    pub async fn notify(&self, result: &CheckResult) -> Result<NotifyOutcome, MonitorError> {
        let now = Utc::now();

        let should_send = {
            let mut state = self.state.lock().expect("notifier lock poisoned");

            let previous = state.previous_status.get(&result.name).copied();
            state.previous_status.insert(result.name.clone(), result.status);

            let recovery =
                result.status == Status::Up && previous.is_some_and(|p| !p.is_healthy());

            let rule_allows = match result.status {
                Status::Up => self.rules.on_success || (recovery && self.rules.on_recovery),
                Status::Down | Status::Error | Status::Warning => self.rules.on_failure,
                Status::Slow => self.rules.on_slow_response,
            };
            if !rule_allows {
                debug!(name = %result.name, status = %result.status, "notification suppressed by rules");
                false
            } else if let Some(last) = state.last_sent.get(&result.name) {
                let elapsed = (now - *last)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if elapsed < self.rules.cooldown {
                    debug!(name = %result.name, "notification suppressed by cooldown");
                    false
                } else {
                    self.within_alert_cap(&mut state, &result.name, now)
                }
            } else {
                self.within_alert_cap(&mut state, &result.name, now)
            }
        };

        if !should_send {
            return Ok(NotifyOutcome::Suppressed);
        }
        if self.channels.is_empty() {
            debug!(name = %result.name, "no notification channels enabled");
            return Ok(NotifyOutcome::Suppressed);
        }

        let mut failed: Vec<String> = Vec::new();
        let mut delivered = 0usize;
        for channel in &self.channels {
            match channel.send(result).await {
                Ok(()) => {
                    delivered += 1;
                    debug!(channel = channel.name(), name = %result.name, "notification sent");
                }
                Err(e) => {
                    warn!(channel = channel.name(), name = %result.name, "notification failed: {e}");
                    failed.push(format!("{}: {e}", channel.name()));
                }
            }
        }

        if delivered > 0 {
            let mut state = self.state.lock().expect("notifier lock poisoned");
            state.last_sent.insert(result.name.clone(), now);
            state
                .dispatch_log
                .entry(result.name.clone())
                .or_default()
                .push(now);
        }

        if failed.is_empty() {
            Ok(NotifyOutcome::Dispatched)
        } else {
            Err(MonitorError::Notification {
                message: failed.join("; "),
            })
        }
    }

    /// Rolling-window alert cap. The window is at least as long as
    /// the cooldown so the cap cannot be starved by it.
    fn within_alert_cap(
        &self,
        state: &mut NotifierState,
        name: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if self.rules.max_alerts == 0 {
            return true;
        }
        let window = self.rules.cooldown.max(Duration::from_secs(3600));
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1));

        let log = state.dispatch_log.entry(name.to_string()).or_default();
        log.retain(|sent| now - *sent <= window);

        if log.len() >= self.rules.max_alerts as usize {
            debug!(name = name, "notification suppressed by max_alerts cap");
            return false;
        }
        true
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

// ── Shared formatting helpers ──────────────────────────────────

/// One-line summary used by the chat-style channels.
pub(crate) fn summary_line(result: &CheckResult) -> String {
    let mut line = format!(
        "{} {} — {} ({:?})",
        result.status.glyph(),
        result.name,
        result.status,
        result.response_time
    );
    if let Some(code) = result.status_code {
        line.push_str(&format!(" [HTTP {code}]"));
    }
    if let Some(error) = &result.error {
        line.push_str(&format!(": {error}"));
    }
    line
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingChannel {
        sent: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, _result: &CheckResult) -> Result<(), MonitorError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(MonitorError::Notification {
                    message: "boom".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn notifier_with(rules: NotificationRules, fail: bool) -> (Notifier, Arc<AtomicUsize>) {
        let sent = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier {
            rules,
            channels: vec![Box::new(RecordingChannel {
                sent: Arc::clone(&sent),
                fail,
            })],
            state: Mutex::new(NotifierState {
                last_sent: HashMap::new(),
                previous_status: HashMap::new(),
                dispatch_log: HashMap::new(),
            }),
        };
        (notifier, sent)
    }

    fn result(name: &str, status: Status) -> CheckResult {
        CheckResult {
            name: name.to_string(),
            url: "https://api.example.com".to_string(),
            status,
            error: None,
            response_time: Duration::from_millis(12),
            status_code: Some(200),
            timestamp: Utc::now(),
            headers: HashMap::new(),
            body_size: 0,
            cert_info: None,
        }
    }

    fn rules(cooldown: Duration) -> NotificationRules {
        NotificationRules {
            on_success: false,
            on_failure: true,
            on_recovery: true,
            on_slow_response: true,
            cooldown,
            max_alerts: 100,
            escalation_delay: Duration::from_secs(900),
        }
    }

    #[tokio::test]
    async fn test_failure_dispatches_success_suppressed() {
        let (notifier, sent) = notifier_with(rules(Duration::ZERO), false);

        let out = notifier.notify(&result("api", Status::Down)).await.unwrap();
        assert_eq!(out, NotifyOutcome::Dispatched);
        assert_eq!(sent.load(Ordering::SeqCst), 1);

        // First UP after DOWN is a recovery, so it goes out even with
        // on_success disabled.
        let out = notifier.notify(&result("api", Status::Up)).await.unwrap();
        assert_eq!(out, NotifyOutcome::Dispatched);
        assert_eq!(sent.load(Ordering::SeqCst), 2);

        // Second UP in a row is plain success: suppressed.
        let out = notifier.notify(&result("api", Status::Up)).await.unwrap();
        assert_eq!(out, NotifyOutcome::Suppressed);
        assert_eq!(sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_warning_routes_through_on_failure() {
        let (notifier, sent) = notifier_with(rules(Duration::ZERO), false);
        let out = notifier
            .notify(&result("ssl", Status::Warning))
            .await
            .unwrap();
        assert_eq!(out, NotifyOutcome::Dispatched);
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat_alerts() {
        let (notifier, sent) = notifier_with(rules(Duration::from_secs(300)), false);

        let first = notifier.notify(&result("api", Status::Down)).await.unwrap();
        assert_eq!(first, NotifyOutcome::Dispatched);

        // Two minutes later (well within cooldown) — suppressed.
        let second = notifier.notify(&result("api", Status::Down)).await.unwrap();
        assert_eq!(second, NotifyOutcome::Suppressed);
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cooldown_is_per_name() {
        let (notifier, sent) = notifier_with(rules(Duration::from_secs(300)), false);

        notifier.notify(&result("api", Status::Down)).await.unwrap();
        notifier.notify(&result("db", Status::Down)).await.unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_channel_failure_surfaces_aggregate() {
        let (notifier, sent) = notifier_with(rules(Duration::ZERO), true);

        let err = notifier
            .notify(&result("api", Status::Down))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("recording"));
        assert_eq!(sent.load(Ordering::SeqCst), 1);

        // Nothing was delivered, so the cooldown is not armed and the
        // next failure is attempted again.
        let _ = notifier.notify(&result("api", Status::Down)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_max_alerts_cap() {
        let mut r = rules(Duration::ZERO);
        r.max_alerts = 2;
        let (notifier, sent) = notifier_with(r, false);

        notifier.notify(&result("api", Status::Down)).await.unwrap();
        notifier.notify(&result("api", Status::Down)).await.unwrap();
        let third = notifier.notify(&result("api", Status::Down)).await.unwrap();
        assert_eq!(third, NotifyOutcome::Suppressed);
        assert_eq!(sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_email_auth_without_tls_is_config_error() {
        let config = NotificationsConfig {
            email: EmailConfig {
                enabled: true,
                smtp_host: "smtp.example.com".to_string(),
                smtp_port: 25,
                username: "alerts".to_string(),
                password: "hunter2".to_string(),
                from: "alerts@example.com".to_string(),
                to: vec!["ops@example.com".to_string()],
                subject: None,
                tls: false,
            },
            ..NotificationsConfig::default()
        };

        let err = Notifier::new(&config).unwrap_err();
        assert!(matches!(err, MonitorError::Configuration { .. }));
    }

    #[test]
    fn test_rules_roundtrip_escalation_delay() {
        let yaml = "cooldown: 5m\nescalation_delay: 20m\n";
        let rules: NotificationRules = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.escalation_delay, Duration::from_secs(20 * 60));

        let out = serde_yaml::to_string(&rules).unwrap();
        assert!(out.contains("escalation_delay"));
    }
}
