// notifier/telegram.rs — Telegram bot channel.

use async_trait::async_trait;
use std::time::Duration;

use super::{summary_line, Channel, TelegramConfig};
use crate::errors::MonitorError;
use crate::types::CheckResult;

pub struct TelegramChannel {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Result<Self, MonitorError> {
        if config.bot_token.is_empty() || config.chat_id.is_empty() {
            return Err(MonitorError::configuration(
                "telegram: bot_token and chat_id are required",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MonitorError::internal(format!("telegram: build client: {e}")))?;

        Ok(TelegramChannel { config, client })
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, result: &CheckResult) -> Result<(), MonitorError> {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.config.bot_token
        );
        let payload = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": summary_line(result),
            "disable_web_page_preview": true,
        });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            // The token is part of the URL; never echo it.
            .map_err(|e| MonitorError::Notification {
                message: format!("telegram send failed: {}", e.without_url()),
            })?;

        if !response.status().is_success() {
            return Err(MonitorError::Notification {
                message: format!("telegram returned status {}", response.status()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credentials_rejected() {
        assert!(TelegramChannel::new(TelegramConfig::default()).is_err());

        let partial = TelegramConfig {
            enabled: true,
            bot_token: "123:abc".to_string(),
            chat_id: String::new(),
        };
        assert!(TelegramChannel::new(partial).is_err());
    }
}
