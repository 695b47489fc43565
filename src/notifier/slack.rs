// notifier/slack.rs — Slack incoming-webhook channel.

use async_trait::async_trait;
use std::time::Duration;

use super::{summary_line, Channel, SlackConfig};
use crate::errors::MonitorError;
use crate::security;
use crate::types::{CheckResult, Status};

pub struct SlackChannel {
    config: SlackConfig,
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(config: SlackConfig) -> Result<Self, MonitorError> {
        if config.webhook_url.is_empty() {
            return Err(MonitorError::configuration("slack: webhook_url is required"));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MonitorError::internal(format!("slack: build client: {e}")))?;

        Ok(SlackChannel { config, client })
    }
}

fn attachment_color(status: Status) -> &'static str {
    match status {
        Status::Up => "good",
        Status::Slow | Status::Warning => "warning",
        Status::Down | Status::Error => "danger",
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, result: &CheckResult) -> Result<(), MonitorError> {
        let mut payload = serde_json::json!({
            "username": self.config.username.as_deref().unwrap_or("pulseguard"),
            "text": summary_line(result),
            "attachments": [{
                "color": attachment_color(result.status),
                "fields": [
                    {"title": "URL", "value": result.url, "short": false},
                    {
                        "title": "Response Time",
                        "value": format!("{:?}", result.response_time),
                        "short": true
                    },
                ],
                "ts": result.timestamp.timestamp(),
            }],
        });
        if let Some(channel) = &self.config.channel {
            payload["channel"] = serde_json::json!(channel);
        }
        if let Some(icon) = &self.config.icon_emoji {
            payload["icon_emoji"] = serde_json::json!(icon);
        }

        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MonitorError::Notification {
                message: format!(
                    "slack post to {} failed: {e}",
                    security::mask_url(&self.config.webhook_url)
                ),
            })?;

        if !response.status().is_success() {
            return Err(MonitorError::Notification {
                message: format!("slack returned status {}", response.status()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_webhook_url_rejected() {
        assert!(SlackChannel::new(SlackConfig::default()).is_err());
    }

    #[test]
    fn test_attachment_colors() {
        assert_eq!(attachment_color(Status::Up), "good");
        assert_eq!(attachment_color(Status::Slow), "warning");
        assert_eq!(attachment_color(Status::Warning), "warning");
        assert_eq!(attachment_color(Status::Down), "danger");
    }
}
