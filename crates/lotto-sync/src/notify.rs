//! Best-effort fan-out of operator alerts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lotto_core::{EventKind, NotificationEvent, NotifyResult};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const PRODUCT: &str = "Lottery Draw Ingestion";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("channel rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

fn emoji(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Anomaly => "\u{1F6A8}",
        EventKind::Divergence => "\u{26A0}\u{FE0F}",
    }
}

fn subject(kind: EventKind) -> String {
    match kind {
        EventKind::Anomaly => format!("ANOMALY DETECTED - {PRODUCT}"),
        EventKind::Divergence => format!("SOURCE DIVERGENCE - {PRODUCT}"),
    }
}

fn body_text(event: &NotificationEvent) -> String {
    if event.context.is_null() {
        return event.message.clone();
    }
    let context = serde_json::to_string_pretty(&event.context).unwrap_or_default();
    format!("{}\n\n{context}", event.message)
}

async fn check_response(resp: reqwest::Response) -> Result<(), NotifyError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(NotifyError::Rejected {
        status: status.as_u16(),
        body: body.chars().take(300).collect(),
    })
}

/// Telegram Bot API `sendMessage`.
pub struct TelegramChannel {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramChannel {
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }

    fn format(event: &NotificationEvent) -> String {
        format!("{} {PRODUCT}\n\n{}", emoji(event.kind), body_text(event))
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token
        );
        let resp = self
            .client
            .post(url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": Self::format(event),
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;
        check_response(resp).await
    }
}

/// Mail delivered through an HTTP relay accepting `{from,to,subject,text}`.
pub struct EmailChannel {
    client: reqwest::Client,
    relay_url: String,
    api_token: Option<String>,
    from: String,
    to: Vec<String>,
}

impl EmailChannel {
    pub fn new(
        client: reqwest::Client,
        relay_url: impl Into<String>,
        api_token: Option<String>,
        from: impl Into<String>,
        to: Vec<String>,
    ) -> Self {
        Self {
            client,
            relay_url: relay_url.into(),
            api_token,
            from: from.into(),
            to,
        }
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.relay_url).json(&json!({
            "from": self.from,
            "to": self.to,
            "subject": subject(event.kind),
            "text": body_text(event),
        }));
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        check_response(request.send().await?).await
    }
}

/// Writes the alert to the log. Always succeeds.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        warn!(kind = %event.kind, context = %event.context, "{}", event.message);
        Ok(())
    }
}

#[derive(Clone)]
pub struct Notifier {
    channels: Vec<Arc<dyn NotificationChannel>>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, timeout: Duration) -> Self {
        Self { channels, timeout }
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    /// Send to every channel concurrently. Never fails; the result says who got it.
    pub async fn notify(&self, event: &NotificationEvent) -> NotifyResult {
        let mut result = NotifyResult::default();
        if self.channels.is_empty() {
            warn!(kind = %event.kind, "no notification channel configured");
            return result;
        }

        let mut sends = JoinSet::new();
        for channel in &self.channels {
            let channel = Arc::clone(channel);
            let event = event.clone();
            let timeout = self.timeout;
            sends.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, channel.send(&event)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(NotifyError::Timeout(timeout)),
                };
                (channel.name().to_string(), outcome)
            });
        }

        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    result.delivered.insert(name);
                }
                Ok((name, Err(err))) => {
                    error!(channel = %name, kind = %event.kind, error = %err, "notification failed");
                    result.failed.insert(name);
                }
                Err(join_err) => error!(error = %join_err, "notification task aborted"),
            }
        }

        // Tasks that panicked never report a name; count them as failed.
        for name in self.channel_names() {
            if !result.delivered.contains(&name) {
                result.failed.insert(name);
            }
        }

        info!(
            kind = %event.kind,
            delivered = result.delivered.len(),
            failed = result.failed.len(),
            "notification dispatched"
        );
        result
    }
}
