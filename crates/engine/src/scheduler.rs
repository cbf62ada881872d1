//! Renewal scheduler
//!
//! One logical job, run once per configured daily window. Scans every live
//! subscription, buckets by urgency, attempts due renewals, dispatches
//! reminders, and expires elapsed grace windows. Only one run may be in
//! flight system-wide: an overlapping trigger is skipped and logged, with the
//! idempotency keys as the second line of defense.

use std::collections::HashSet;
use std::sync::Arc;

use cuenty_shared::{
    AutomationSettings, CustomerId, FeatureGate, NotificationKind, Plan, PlanId, RenewalStatus,
    Subscription, SubscriptionId, SubscriptionState, UrgencyTier,
};
use serde::Serialize;
use time::Date;
use tracing::{error, info, warn};

use crate::channels::NotificationPayload;
use crate::dispatcher::{DeliveryOutcome, NotificationDispatcher};
use crate::error::EngineResult;
use crate::lifecycle::{RenewalOutcome, SubscriptionLifecycle};
use crate::store::{CatalogStore, SubscriptionStore};

/// Urgency census across one scan
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UrgencyCensus {
    pub due_now: usize,
    pub one_day: usize,
    pub two_to_three_days: usize,
    pub four_to_seven_days: usize,
    pub later: usize,
}

impl UrgencyCensus {
    fn record(&mut self, days: i64) {
        match UrgencyTier::from_days_remaining(days) {
            UrgencyTier::DueNow => self.due_now += 1,
            UrgencyTier::OneDay => self.one_day += 1,
            UrgencyTier::TwoToThreeDays => self.two_to_three_days += 1,
            UrgencyTier::FourToSevenDays => self.four_to_seven_days += 1,
            UrgencyTier::Later => self.later += 1,
        }
    }
}

/// What one scheduler run did
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_date: Date,
    pub scanned: usize,
    pub census: UrgencyCensus,
    pub renewals_succeeded: u32,
    pub renewals_failed: u32,
    pub renewals_deduped: u32,
    pub lapsed: u32,
    pub reminders_sent: u32,
    pub reminders_deduped: u32,
    pub reminders_failed: u32,
    pub expired: u32,
    /// Renewal/expiry sub-steps were skipped because the gate is off
    pub renewals_gated: bool,
    /// Notification sub-steps were skipped because the gate is off
    pub notifications_gated: bool,
}

impl RunSummary {
    fn new(run_date: Date, scanned: usize) -> Self {
        Self {
            run_date,
            scanned,
            census: UrgencyCensus::default(),
            renewals_succeeded: 0,
            renewals_failed: 0,
            renewals_deduped: 0,
            lapsed: 0,
            reminders_sent: 0,
            reminders_deduped: 0,
            reminders_failed: 0,
            expired: 0,
            renewals_gated: false,
            notifications_gated: false,
        }
    }
}

/// One subscription in the admin urgency report
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionDigest {
    pub id: SubscriptionId,
    pub customer_id: CustomerId,
    pub plan_id: PlanId,
    pub state: SubscriptionState,
    pub auto_renew: bool,
    pub next_renewal_date: Date,
    pub days_remaining: i64,
}

/// Live subscriptions grouped by urgency tier
#[derive(Debug, Clone, Serialize)]
pub struct UrgencyGroup {
    pub tier: UrgencyTier,
    pub subscriptions: Vec<SubscriptionDigest>,
}

#[derive(Clone)]
pub struct RenewalScheduler {
    subs: Arc<dyn SubscriptionStore>,
    catalog: Arc<dyn CatalogStore>,
    lifecycle: SubscriptionLifecycle,
    dispatcher: NotificationDispatcher,
    gate: FeatureGate,
    settings: AutomationSettings,
    run_guard: Arc<tokio::sync::Mutex<()>>,
}

impl RenewalScheduler {
    pub fn new(
        subs: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn CatalogStore>,
        lifecycle: SubscriptionLifecycle,
        dispatcher: NotificationDispatcher,
        gate: FeatureGate,
        settings: AutomationSettings,
    ) -> Self {
        Self {
            subs,
            catalog,
            lifecycle,
            dispatcher,
            gate,
            settings,
            run_guard: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Run the daily scan unless a run is already executing.
    ///
    /// Returns `None` when the trigger was skipped because the previous run is
    /// still in flight.
    pub async fn try_run(&self, today: Date) -> EngineResult<Option<RunSummary>> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            warn!("Previous scheduler run still in flight; skipping this trigger");
            return Ok(None);
        };
        let summary = self.run_once(today).await?;
        Ok(Some(summary))
    }

    async fn run_once(&self, today: Date) -> EngineResult<RunSummary> {
        let subs = self
            .subs
            .list_by_states(&[SubscriptionState::Active, SubscriptionState::Grace])
            .await?;
        let mut summary = RunSummary::new(today, subs.len());
        summary.renewals_gated = !self.gate.auto_renewals;
        summary.notifications_gated = !self.gate.auto_notifications;

        // The census always runs, even with every automation off, so the
        // urgency data stays current for manual admin action.
        for sub in &subs {
            summary.census.record(sub.days_remaining(today));
        }

        // Subscriptions already handled by the renewal step; the reminder step
        // must not follow up with a stale days-remaining value.
        let mut processed: HashSet<SubscriptionId> = HashSet::new();

        if self.gate.auto_renewals {
            self.process_due_renewals(&subs, today, &mut summary, &mut processed)
                .await;
        }

        if self.gate.auto_notifications {
            self.process_reminders(&subs, today, &mut summary, &processed)
                .await;
        }

        if self.gate.auto_renewals {
            self.process_grace_expiry(&subs, today, &mut summary).await;
        }

        info!(
            run_date = %today,
            scanned = summary.scanned,
            due_now = summary.census.due_now,
            renewals_succeeded = summary.renewals_succeeded,
            renewals_failed = summary.renewals_failed,
            lapsed = summary.lapsed,
            reminders_sent = summary.reminders_sent,
            reminders_deduped = summary.reminders_deduped,
            expired = summary.expired,
            "Scheduler run complete"
        );
        Ok(summary)
    }

    /// Step 3: attempt auto-renewals for due subscriptions; lapse due ones
    /// without auto-renew into grace.
    async fn process_due_renewals(
        &self,
        subs: &[Subscription],
        today: Date,
        summary: &mut RunSummary,
        processed: &mut HashSet<SubscriptionId>,
    ) {
        for sub in subs {
            if sub.state != SubscriptionState::Active || sub.days_remaining(today) > 0 {
                continue;
            }

            if !sub.auto_renew {
                match self.lifecycle.lapse_to_grace(sub.id).await {
                    Ok(()) => {
                        summary.lapsed += 1;
                        processed.insert(sub.id);
                        // The missed renewal surfaces as a grace reminder, not
                        // a silent hold.
                        if self.gate.auto_notifications {
                            self.notify(sub, NotificationKind::ReminderUrgent, today, summary)
                                .await;
                        }
                    }
                    Err(e) => {
                        error!(subscription_id = %sub.id, error = %e, "Failed to lapse subscription");
                    }
                }
                continue;
            }

            match self.lifecycle.renew(sub.id, today).await {
                Ok(RenewalOutcome::Renewed { .. }) => {
                    summary.renewals_succeeded += 1;
                    processed.insert(sub.id);
                    if self.gate.auto_notifications {
                        self.notify(sub, NotificationKind::RenewalReceipt, today, summary)
                            .await;
                    }
                }
                Ok(RenewalOutcome::Failed { .. }) => {
                    summary.renewals_failed += 1;
                    processed.insert(sub.id);
                    // A failed renewal surfaces as a grace reminder, not a
                    // silent suspension.
                    if self.gate.auto_notifications {
                        self.notify(sub, NotificationKind::ReminderUrgent, today, summary)
                            .await;
                    }
                }
                Ok(RenewalOutcome::AlreadyProcessed { status }) => {
                    summary.renewals_deduped += 1;
                    processed.insert(sub.id);
                    if status == RenewalStatus::Failed {
                        summary.renewals_failed += 1;
                    }
                }
                Ok(RenewalOutcome::AlreadyCurrent) => {
                    processed.insert(sub.id);
                }
                Err(e) => {
                    error!(subscription_id = %sub.id, error = %e, "Renewal attempt errored");
                }
            }
        }
    }

    /// Step 4: reminders at the configured thresholds, deduplicated by the
    /// notification event key.
    async fn process_reminders(
        &self,
        subs: &[Subscription],
        today: Date,
        summary: &mut RunSummary,
        processed: &HashSet<SubscriptionId>,
    ) {
        for sub in subs {
            if sub.state != SubscriptionState::Active || processed.contains(&sub.id) {
                continue;
            }
            let days = sub.days_remaining(today);
            let Some(kind) = self.reminder_kind(days) else {
                continue;
            };
            self.notify(sub, kind, today, summary).await;
        }
    }

    /// Step 5: expire grace subscriptions whose window has elapsed.
    async fn process_grace_expiry(
        &self,
        subs: &[Subscription],
        today: Date,
        summary: &mut RunSummary,
    ) {
        for sub in subs {
            if sub.state != SubscriptionState::Grace {
                continue;
            }
            match self.lifecycle.expire_if_due(sub.id, today).await {
                Ok(true) => {
                    summary.expired += 1;
                    if self.gate.auto_notifications {
                        self.notify(sub, NotificationKind::ExpiryNotice, today, summary)
                            .await;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    error!(subscription_id = %sub.id, error = %e, "Grace expiry check errored");
                }
            }
        }
    }

    fn reminder_kind(&self, days: i64) -> Option<NotificationKind> {
        if !self.settings.reminder_thresholds.contains(&days) {
            return None;
        }
        if days <= 1 {
            Some(NotificationKind::ReminderUrgent)
        } else {
            Some(NotificationKind::ReminderSoon)
        }
    }

    async fn notify(
        &self,
        sub: &Subscription,
        kind: NotificationKind,
        today: Date,
        summary: &mut RunSummary,
    ) {
        let payload = match self.build_payload(sub, today).await {
            Ok(payload) => payload,
            Err(e) => {
                error!(subscription_id = %sub.id, error = %e, "Failed to build notification payload");
                summary.reminders_failed += 1;
                return;
            }
        };
        match self.dispatcher.send(sub.id, kind, today, payload).await {
            Ok(DeliveryOutcome::Delivered { .. }) => summary.reminders_sent += 1,
            Ok(DeliveryOutcome::AlreadyDelivered) => summary.reminders_deduped += 1,
            Ok(DeliveryOutcome::Failed { .. }) => summary.reminders_failed += 1,
            Ok(DeliveryOutcome::Skipped { .. }) => {}
            Err(e) => {
                error!(subscription_id = %sub.id, kind = %kind, error = %e, "Dispatch errored");
                summary.reminders_failed += 1;
            }
        }
    }

    async fn build_payload(
        &self,
        sub: &Subscription,
        today: Date,
    ) -> EngineResult<NotificationPayload> {
        // Re-read so a renewal receipt carries the advanced expiry date, not
        // the scan-time snapshot.
        let sub = self
            .subs
            .get_subscription(sub.id)
            .await?
            .unwrap_or_else(|| sub.clone());
        let plan = self.plan_for(&sub).await?;
        Ok(NotificationPayload {
            service: plan.service,
            plan: plan.name,
            recipient_phone: sub.contact_phone.clone(),
            recipient_email: sub.contact_email.clone(),
            expires_on: sub.next_renewal_date,
            days_remaining: Some(sub.days_remaining(today)),
            credentials: None,
        })
    }

    async fn plan_for(&self, sub: &Subscription) -> EngineResult<Plan> {
        self.catalog
            .get_plan(sub.plan_id)
            .await?
            .ok_or(crate::error::EngineError::PlanNotFound(sub.plan_id))
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Live subscriptions grouped by urgency tier, for the admin surface.
    ///
    /// Reads only; runs regardless of any feature gate. A subscription with an
    /// in-flight renewal attempt for today reports as `PendingRenewal`.
    pub async fn urgency_report(&self, today: Date) -> EngineResult<Vec<UrgencyGroup>> {
        let subs = self
            .subs
            .list_by_states(&[SubscriptionState::Active, SubscriptionState::Grace])
            .await?;

        let mut groups: Vec<UrgencyGroup> = [
            UrgencyTier::DueNow,
            UrgencyTier::OneDay,
            UrgencyTier::TwoToThreeDays,
            UrgencyTier::FourToSevenDays,
            UrgencyTier::Later,
        ]
        .into_iter()
        .map(|tier| UrgencyGroup {
            tier,
            subscriptions: Vec::new(),
        })
        .collect();

        for sub in subs {
            let days = sub.days_remaining(today);
            let mut state = sub.state;
            if state == SubscriptionState::Active {
                if let Some(attempt) = self.subs.get_renewal_attempt(sub.id, today).await? {
                    if attempt.status == RenewalStatus::Scheduled {
                        state = SubscriptionState::PendingRenewal;
                    }
                }
            }
            let digest = SubscriptionDigest {
                id: sub.id,
                customer_id: sub.customer_id,
                plan_id: sub.plan_id,
                state,
                auto_renew: sub.auto_renew,
                next_renewal_date: sub.next_renewal_date,
                days_remaining: days,
            };
            let tier = UrgencyTier::from_days_remaining(days);
            if let Some(group) = groups.iter_mut().find(|g| g.tier == tier) {
                group.subscriptions.push(digest);
            }
        }

        Ok(groups)
    }
}
