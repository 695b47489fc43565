// notifier/discord.rs — Discord webhook channel.

use async_trait::async_trait;
use std::time::Duration;

use super::{Channel, DiscordConfig};
use crate::errors::MonitorError;
use crate::security;
use crate::types::{CheckResult, Status};

#[derive(Debug)]
pub struct DiscordChannel {
    config: DiscordConfig,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(config: DiscordConfig) -> Result<Self, MonitorError> {
        if config.webhook_url.is_empty() {
            return Err(MonitorError::configuration(
                "discord: webhook_url is required",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MonitorError::internal(format!("discord: build client: {e}")))?;

        Ok(DiscordChannel { config, client })
    }
}

fn embed_color(status: Status) -> u32 {
    match status {
        Status::Up => 0x00ff00,
        Status::Down | Status::Error => 0xff0000,
        Status::Slow => 0xffa500,
        Status::Warning => 0xffff00,
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn send(&self, result: &CheckResult) -> Result<(), MonitorError> {
        let mut fields = vec![
            serde_json::json!({"name": "URL", "value": result.url, "inline": false}),
            serde_json::json!({
                "name": "Response Time",
                "value": format!("{:?}", result.response_time),
                "inline": true
            }),
        ];
        if let Some(code) = result.status_code {
            fields.push(serde_json::json!({
                "name": "Status Code", "value": code.to_string(), "inline": true
            }));
        }
        if let Some(error) = &result.error {
            fields.push(serde_json::json!({
                "name": "Error", "value": error, "inline": false
            }));
        }

        let payload = serde_json::json!({
            "username": self.config.username.as_deref().unwrap_or("pulseguard"),
            "avatar_url": self.config.avatar_url,
            "embeds": [{
                "title": format!("{} {} is {}", result.status.glyph(), result.name, result.status),
                "color": embed_color(result.status),
                "fields": fields,
                "timestamp": result.timestamp.to_rfc3339(),
            }],
        });

        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MonitorError::Notification {
                message: format!(
                    "discord post to {} failed: {e}",
                    security::mask_url(&self.config.webhook_url)
                ),
            })?;

        if !response.status().is_success() {
            return Err(MonitorError::Notification {
                message: format!("discord returned status {}", response.status()),
            });
        }
        Ok(())
    }
}
