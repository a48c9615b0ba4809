// =============================================================================
// Delivery channels — push and digest surfaces behind one trait
// =============================================================================
//
// Push-class channels (webhook) are subject to quiet hours and rate caps; the
// log channel is not, so a fired alert always leaves at least one trace.
// Failed sends are retried with exponential backoff before the dispatcher
// records a delivery error.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::SignalError;

use super::Alert;

/// Base backoff between delivery retries; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_millis(200);

#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Push-class channels interrupt the user and honour quiet hours and
    /// rate caps. Non-push channels always deliver.
    fn push_class(&self) -> bool;

    async fn send(&self, alert: &Alert) -> Result<(), SignalError>;

    /// Deliver a batch of low-priority alerts in one message. The default
    /// sends them individually.
    async fn send_digest(&self, alerts: &[Alert]) -> Result<(), SignalError> {
        for alert in alerts {
            self.send(alert).await?;
        }
        Ok(())
    }
}

/// Retry wrapper shared by immediate and digest delivery.
pub async fn deliver_with_retry(
    channel: &dyn AlertChannel,
    alert: &Alert,
    retries: u32,
) -> Result<(), SignalError> {
    let mut backoff = RETRY_BASE;
    let attempts = retries.max(1);

    for attempt in 1..=attempts {
        match channel.send(alert).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                warn!(
                    channel = channel.name(),
                    alert = %alert.id,
                    attempt,
                    error = %e,
                    "delivery failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                return Err(SignalError::DeliveryFailure {
                    channel: channel.name().to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
    unreachable!("retry loop always returns")
}

// =============================================================================
// Webhook channel
// =============================================================================

/// POSTs each alert as JSON to a configured endpoint.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl std::fmt::Debug for WebhookChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Webhook URLs frequently embed tokens; keep them out of logs.
        f.debug_struct("WebhookChannel").field("url", &"<redacted>").finish()
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn push_class(&self) -> bool {
        true
    }

    async fn send(&self, alert: &Alert) -> Result<(), SignalError> {
        self.client
            .post(&self.url)
            .json(alert)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn send_digest(&self, alerts: &[Alert]) -> Result<(), SignalError> {
        let body = serde_json::json!({
            "digest": true,
            "count": alerts.len(),
            "alerts": alerts,
        });
        self.client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// =============================================================================
// Log channel
// =============================================================================

/// Structured-log sink. Always succeeds, never push-class.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn push_class(&self) -> bool {
        false
    }

    async fn send(&self, alert: &Alert) -> Result<(), SignalError> {
        info!(
            alert = %alert.id,
            symbol = %alert.symbol,
            pattern = %alert.pattern_name,
            direction = %alert.direction,
            tier = %alert.quality_tier,
            score = format!("{:.3}", alert.composite_score),
            entry = alert.entry_price,
            stop = alert.stop_price,
            target = alert.target_price,
            "ALERT"
        );
        Ok(())
    }

    async fn send_digest(&self, alerts: &[Alert]) -> Result<(), SignalError> {
        info!(count = alerts.len(), "ALERT DIGEST");
        for alert in alerts {
            self.send(alert).await?;
        }
        Ok(())
    }
}
