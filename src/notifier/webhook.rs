// notifier/webhook.rs — Generic webhook channel.
// Ships the whole result as JSON to a user-supplied endpoint with
// optional extra headers. Headers go through the same injection
// guard as probe headers.

use async_trait::async_trait;

use super::{Channel, WebhookConfig};
use crate::errors::MonitorError;
use crate::security;
use crate::types::CheckResult;

pub struct WebhookChannel {
    config: WebhookConfig,
    client: reqwest::Client,
    method: reqwest::Method,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Result<Self, MonitorError> {
        if config.url.is_empty() {
            return Err(MonitorError::configuration("webhook: url is required"));
        }
        security::validate_http_headers(&config.headers)?;

        let method = reqwest::Method::from_bytes(config.method.as_bytes())
            .map_err(|_| {
                MonitorError::configuration(format!("webhook: invalid method {}", config.method))
            })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MonitorError::internal(format!("webhook: build client: {e}")))?;

        Ok(WebhookChannel {
            config,
            client,
            method,
        })
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, result: &CheckResult) -> Result<(), MonitorError> {
        let payload = serde_json::json!({
            "event": "check_result",
            "name": result.name,
            "url": result.url,
            "status": result.status.as_str(),
            "error": result.error,
            "response_time_ms": result.response_time.as_millis() as u64,
            "status_code": result.status_code,
            "body_size": result.body_size,
            "timestamp": result.timestamp.to_rfc3339(),
            "cert_info": result.cert_info,
        });

        let mut request = self
            .client
            .request(self.method.clone(), &self.config.url)
            .json(&payload);
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| MonitorError::Notification {
            message: format!(
                "webhook {} failed: {e}",
                security::mask_url(&self.config.url)
            ),
        })?;

        if !response.status().is_success() {
            return Err(MonitorError::Notification {
                message: format!("webhook returned status {}", response.status()),
            });
        }
        Ok(())
    }
}
