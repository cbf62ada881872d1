//! Notification dispatcher
//!
//! Delivers reminders and credential payloads through the configured channel
//! with bounded retries and at-most-once-per-event semantics. The event key
//! `(subscription, kind, cycle_date)` is checked before any outbound call, so
//! re-running the scheduler on the same day sends nothing twice. No store lock
//! is held while a channel call is in flight.

use std::sync::Arc;
use std::time::Duration;

use cuenty_shared::{
    AutomationSettings, NotificationEvent, NotificationKind, NotificationStatus, SubscriptionId,
};
use time::{Date, OffsetDateTime};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{info, warn};

use crate::alerts::OpsAlertNotifier;
use crate::channels::{NotificationChannel, NotificationPayload};
use crate::error::EngineResult;
use crate::store::SubscriptionStore;

/// Result of a dispatch call for one event key
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// Delivery confirmed on this call
    Delivered { attempts: u32 },
    /// A prior call already delivered this event; nothing was sent
    AlreadyDelivered,
    /// Retries are exhausted; the event is terminally failed and alerted
    Failed { attempts: u32, reason: String },
    /// No channel or recipient available; nothing was attempted
    Skipped { reason: String },
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    subs: Arc<dyn SubscriptionStore>,
    primary: Option<Arc<dyn NotificationChannel>>,
    email_copy: Option<Arc<dyn NotificationChannel>>,
    alerts: OpsAlertNotifier,
    max_attempts: u32,
    attempt_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        subs: Arc<dyn SubscriptionStore>,
        primary: Option<Arc<dyn NotificationChannel>>,
        email_copy: Option<Arc<dyn NotificationChannel>>,
        settings: &AutomationSettings,
    ) -> Self {
        Self {
            subs,
            primary,
            email_copy,
            alerts: OpsAlertNotifier::new(settings.ops_webhook_url.clone()),
            max_attempts: settings.max_notification_attempts.max(1),
            attempt_timeout: Duration::from_secs(settings.notification_timeout_secs),
        }
    }

    /// Deliver one notification event, idempotently.
    pub async fn send(
        &self,
        subscription_id: SubscriptionId,
        kind: NotificationKind,
        cycle_date: Date,
        payload: NotificationPayload,
    ) -> EngineResult<DeliveryOutcome> {
        // Idempotency check comes first: a recorded success is final.
        let existing = self
            .subs
            .get_notification_event(subscription_id, kind, cycle_date)
            .await?;

        let mut event = match existing {
            Some(event) if event.status == NotificationStatus::Succeeded => {
                info!(
                    subscription_id = %subscription_id,
                    kind = %kind,
                    cycle_date = %cycle_date,
                    "Notification already delivered; skipping"
                );
                return Ok(DeliveryOutcome::AlreadyDelivered);
            }
            Some(event) if event.status == NotificationStatus::Failed => {
                // Terminal; a later attempt record would mask the recorded
                // failure the admin side is acting on.
                return Ok(DeliveryOutcome::Failed {
                    attempts: event.retry_count,
                    reason: event.last_error.unwrap_or_default(),
                });
            }
            // A Pending leftover means a previous run died mid-flight; resume
            // from its retry count.
            Some(event) => event,
            None => NotificationEvent::pending(subscription_id, kind, cycle_date),
        };

        let Some(channel) = self.primary.clone() else {
            warn!(kind = %kind, "No messaging channel configured; notification skipped");
            return Ok(DeliveryOutcome::Skipped {
                reason: "no messaging channel configured".to_string(),
            });
        };

        let Some(recipient) = channel.recipient(&payload) else {
            event.status = NotificationStatus::Failed;
            event.last_error = Some("subscription has no recipient handle".to_string());
            event.updated_at = OffsetDateTime::now_utc();
            self.subs.upsert_notification_event(&event).await?;
            self.alerts
                .notify_delivery_failure(&event, &payload.service)
                .await;
            return Ok(DeliveryOutcome::Failed {
                attempts: event.retry_count,
                reason: "subscription has no recipient handle".to_string(),
            });
        };

        // 500ms, 1s, 2s, ... with jitter
        let mut delays = ExponentialBackoff::from_millis(2).factor(250).map(jitter);

        loop {
            event.retry_count += 1;
            event.updated_at = OffsetDateTime::now_utc();

            let attempt = tokio::time::timeout(
                self.attempt_timeout,
                channel.deliver(&recipient, kind, &payload),
            )
            .await;

            match attempt {
                Ok(Ok(receipt)) => {
                    event.status = NotificationStatus::Succeeded;
                    event.message_ref = receipt.message_ref;
                    event.last_error = None;
                    self.subs.upsert_notification_event(&event).await?;
                    info!(
                        subscription_id = %subscription_id,
                        kind = %kind,
                        channel = channel.name(),
                        attempts = event.retry_count,
                        "Notification delivered"
                    );
                    self.send_email_copy(kind, &payload).await;
                    return Ok(DeliveryOutcome::Delivered {
                        attempts: event.retry_count,
                    });
                }
                Ok(Err(e)) => {
                    event.last_error = Some(e.to_string());
                }
                Err(_) => {
                    // A late-arriving response is ignored: the next attempt (or
                    // the terminal record) owns the outcome from here.
                    event.last_error = Some(format!(
                        "delivery timed out after {}s",
                        self.attempt_timeout.as_secs()
                    ));
                }
            }

            warn!(
                subscription_id = %subscription_id,
                kind = %kind,
                attempt = event.retry_count,
                error = event.last_error.as_deref().unwrap_or(""),
                "Notification attempt failed"
            );

            if event.retry_count >= self.max_attempts {
                event.status = NotificationStatus::Failed;
                self.subs.upsert_notification_event(&event).await?;
                self.alerts
                    .notify_delivery_failure(&event, &payload.service)
                    .await;
                return Ok(DeliveryOutcome::Failed {
                    attempts: event.retry_count,
                    reason: event.last_error.clone().unwrap_or_default(),
                });
            }

            // Persist progress so a crash resumes with the right count
            self.subs.upsert_notification_event(&event).await?;

            if let Some(delay) = delays.next() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Best-effort email copy. Never affects the event status; the messaging
    /// channel is the delivery of record.
    async fn send_email_copy(&self, kind: NotificationKind, payload: &NotificationPayload) {
        let Some(copy) = self.email_copy.clone() else {
            return;
        };
        let Some(recipient) = copy.recipient(payload) else {
            return;
        };
        match tokio::time::timeout(self.attempt_timeout, copy.deliver(&recipient, kind, payload))
            .await
        {
            Ok(Ok(_)) => {
                info!(to = %recipient, kind = %kind, "Email copy sent");
            }
            Ok(Err(e)) => {
                warn!(to = %recipient, kind = %kind, error = %e, "Email copy failed (non-fatal)");
            }
            Err(_) => {
                warn!(to = %recipient, kind = %kind, "Email copy timed out (non-fatal)");
            }
        }
    }
}
