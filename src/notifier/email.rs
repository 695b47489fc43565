// notifier/email.rs — SMTP alert channel.
// Sends an HTML summary per alertable result. TLS is mandatory the
// moment credentials are configured; that contradiction is caught
// at construction, long before the first send.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{Channel, EmailConfig};
use crate::errors::MonitorError;
use crate::security;
use crate::types::CheckResult;

pub struct EmailChannel {
    config: EmailConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailChannel {
    pub fn new(config: EmailConfig) -> Result<Self, MonitorError> {
        if config.smtp_host.is_empty() {
            return Err(MonitorError::configuration("email: smtp_host is required"));
        }
        if config.from.is_empty() || config.to.is_empty() {
            return Err(MonitorError::configuration(
                "email: from and at least one recipient are required",
            ));
        }

        let has_auth = !config.username.is_empty() || !config.password.is_empty();
        if has_auth && !config.tls {
            return Err(MonitorError::configuration(
                "email: TLS is required when SMTP authentication is configured; \
                 refusing to send credentials over cleartext",
            ));
        }

        let mut builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| MonitorError::configuration(format!("email: bad SMTP host: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };
        builder = builder.port(config.smtp_port);

        if has_auth {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(EmailChannel {
            transport: builder.build(),
            config,
        })
    }

    fn subject(&self, result: &CheckResult) -> String {
        match &self.config.subject {
            Some(subject) if !subject.is_empty() => {
                subject.replace("{name}", &result.name).replace(
                    "{status}",
                    result.status.as_str(),
                )
            }
            _ => format!(
                "[pulseguard] {} is {}",
                result.name,
                result.status.as_str()
            ),
        }
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, result: &CheckResult) -> Result<(), MonitorError> {
        let from = self
            .config
            .from
            .parse()
            .map_err(|e| MonitorError::configuration(format!("email: bad from address: {e}")))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(self.subject(result))
            .header(ContentType::TEXT_HTML);

        for recipient in &self.config.to {
            let to = recipient.parse().map_err(|e| {
                MonitorError::configuration(format!(
                    "email: bad recipient {}: {e}",
                    security::mask_email(recipient)
                ))
            })?;
            builder = builder.to(to);
        }

        let message = builder
            .body(render_body(result))
            .map_err(|e| MonitorError::internal(format!("email: build message: {e}")))?;

        self.transport.send(message).await.map_err(|e| {
            MonitorError::Notification {
                message: format!("email send failed: {e}"),
            }
        })?;
        Ok(())
    }
}

/// Small self-contained HTML body; chat channels get the one-liner,
/// email gets the table.
fn render_body(result: &CheckResult) -> String {
    let status_color = match result.status {
        crate::types::Status::Up => "#28a745",
        crate::types::Status::Slow | crate::types::Status::Warning => "#ffc107",
        _ => "#dc3545",
    };

    let mut rows = format!(
        "<tr><td><strong>Status</strong></td><td style=\"color:{status_color}\">{} {}</td></tr>\
         <tr><td><strong>Target</strong></td><td>{}</td></tr>\
         <tr><td><strong>Response time</strong></td><td>{:?}</td></tr>",
        result.status.glyph(),
        result.status.as_str(),
        result.url,
        result.response_time,
    );
    if let Some(code) = result.status_code {
        rows.push_str(&format!(
            "<tr><td><strong>HTTP status</strong></td><td>{code}</td></tr>"
        ));
    }
    if let Some(error) = &result.error {
        rows.push_str(&format!(
            "<tr><td><strong>Error</strong></td><td>{error}</td></tr>"
        ));
    }
    if let Some(cert) = &result.cert_info {
        rows.push_str(&format!(
            "<tr><td><strong>Certificate expires</strong></td><td>{} ({} days)</td></tr>",
            cert.expiry_date.format("%Y-%m-%d"),
            cert.days_to_expiry
        ));
    }

    format!(
        "<!DOCTYPE html><html><body style=\"font-family:sans-serif\">\
         <h2>{} {}</h2>\
         <table cellpadding=\"6\">{rows}</table>\
         <p style=\"color:#6c757d;font-size:12px\">Checked at {} — sent by pulseguard</p>\
         </body></html>",
        result.status.glyph(),
        result.name,
        result.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}
