//! Ops alert delivery
//!
//! Terminal notification failures are surfaced to the operations side through
//! a webhook (Slack-compatible payload) in addition to the queryable failed
//! event record. Nothing is silently dropped.

use cuenty_shared::NotificationEvent;
use serde_json::json;

/// Webhook notifier for actionable automation failures
#[derive(Clone)]
pub struct OpsAlertNotifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl OpsAlertNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Post a delivery-failure alert. Best-effort: a failing webhook is logged,
    /// never propagated, because the event record is the durable trail.
    pub async fn notify_delivery_failure(&self, event: &NotificationEvent, service: &str) {
        let Some(ref webhook_url) = self.webhook_url else {
            tracing::warn!(
                subscription_id = %event.subscription_id,
                kind = %event.kind,
                "Ops webhook not configured; failed delivery only recorded"
            );
            return;
        };

        let payload = json!({
            "text": format!(
                ":warning: *Notification delivery failed terminally* for {}",
                service
            ),
            "attachments": [{
                "color": "#FF0000",
                "fields": [
                    { "title": "Subscription", "value": event.subscription_id.to_string(), "short": true },
                    { "title": "Kind", "value": event.kind.to_string(), "short": true },
                    { "title": "Cycle", "value": event.cycle_date.to_string(), "short": true },
                    { "title": "Attempts", "value": event.retry_count.to_string(), "short": true },
                    { "title": "Last error", "value": event.last_error.clone().unwrap_or_default(), "short": false }
                ]
            }]
        });

        match self.client.post(webhook_url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(
                    subscription_id = %event.subscription_id,
                    "Delivery-failure alert posted"
                );
            }
            Ok(response) => {
                tracing::error!(
                    status = %response.status(),
                    "Ops webhook rejected delivery-failure alert"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to post delivery-failure alert");
            }
        }
    }
}
