//! Subscription lifecycle
//!
//! The single writer for subscription state. Every transition is validated
//! against the state machine and committed atomically together with its
//! renewal-attempt record, so a re-run of the scheduler (or a crash between
//! steps) can never double-process a cycle.
//!
//! Locks are only held inside the store commit; the renewal charge and any
//! channel I/O happen outside them with a bounded timeout.

use std::sync::Arc;
use std::time::Duration;

use cuenty_shared::{
    AutomationSettings, CustomerId, OrderId, Plan, PlanId, RenewalAttempt, RenewalStatus,
    Subscription, SubscriptionId, SubscriptionState,
};
use time::{Date, OffsetDateTime};
use tracing::{error, info, warn};

use crate::allocator::SlotAllocator;
use crate::charge::PaymentCharger;
use crate::error::{EngineError, EngineResult};
use crate::pool::AccountPool;
use crate::store::{AccountStore, AttemptClaim, CatalogStore, SubscriptionStore};

/// Inputs for creating a subscription from a confirmed order
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub customer_id: CustomerId,
    pub plan_id: PlanId,
    pub order_id: Option<OrderId>,
    pub auto_renew: bool,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
}

/// Result of a renewal call for one cycle
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RenewalOutcome {
    /// The charge went through; the renewal date advanced
    Renewed {
        next_renewal_date: Date,
        reference: String,
    },
    /// This cycle was already processed; the recorded result is returned
    AlreadyProcessed { status: RenewalStatus },
    /// The renewal date is already beyond this cycle; nothing to do
    AlreadyCurrent,
    /// The charge failed or timed out; the subscription entered Grace
    Failed { reason: String },
}

#[derive(Clone)]
pub struct SubscriptionLifecycle {
    subs: Arc<dyn SubscriptionStore>,
    accounts: Arc<dyn AccountStore>,
    catalog: Arc<dyn CatalogStore>,
    charger: Arc<dyn PaymentCharger>,
    allocator: SlotAllocator,
    pool: AccountPool,
    settings: AutomationSettings,
}

impl SubscriptionLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subs: Arc<dyn SubscriptionStore>,
        accounts: Arc<dyn AccountStore>,
        catalog: Arc<dyn CatalogStore>,
        charger: Arc<dyn PaymentCharger>,
        allocator: SlotAllocator,
        pool: AccountPool,
        settings: AutomationSettings,
    ) -> Self {
        Self {
            subs,
            accounts,
            catalog,
            charger,
            allocator,
            pool,
            settings,
        }
    }

    pub fn grace_days(&self) -> i64 {
        self.settings.grace_days as i64
    }

    // =========================================================================
    // Creation / Activation
    // =========================================================================

    /// Create a Pending subscription for a confirmed-paid order
    pub async fn create_pending(
        &self,
        new: NewSubscription,
        today: Date,
    ) -> EngineResult<Subscription> {
        let plan = self.require_plan(new.plan_id).await?;
        let now = OffsetDateTime::now_utc();
        let sub = Subscription {
            id: SubscriptionId::new(),
            customer_id: new.customer_id,
            plan_id: plan.id,
            order_id: new.order_id,
            slot: None,
            state: SubscriptionState::Pending,
            auto_renew: new.auto_renew,
            start_date: None,
            next_renewal_date: today + time::Duration::days(plan.duration_days as i64),
            renewals_completed: 0,
            contact_phone: new.contact_phone,
            contact_email: new.contact_email,
            cancel_reason: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };
        self.subs.insert_subscription(sub.clone()).await?;
        info!(subscription_id = %sub.id, plan = %plan.name, "Subscription created (pending)");
        Ok(sub)
    }

    /// Bind an allocated slot and activate. The renewal clock starts here.
    pub async fn activate(
        &self,
        id: SubscriptionId,
        slot: cuenty_shared::SlotRef,
        today: Date,
    ) -> EngineResult<Subscription> {
        let mut sub = self.require_subscription(id).await?;
        self.check_transition(&sub, SubscriptionState::Active)?;
        let plan = self.require_plan(sub.plan_id).await?;

        sub.state = SubscriptionState::Active;
        sub.slot = Some(slot);
        sub.start_date = Some(today);
        sub.next_renewal_date = today + time::Duration::days(plan.duration_days as i64);
        sub.updated_at = OffsetDateTime::now_utc();
        self.subs.commit_transition(&sub, None, None).await?;
        info!(subscription_id = %id, account_id = %slot.account_id, slot_index = slot.slot_index, "Subscription activated");
        Ok(sub)
    }

    // =========================================================================
    // Renewal
    // =========================================================================

    /// Attempt a renewal for one cycle.
    ///
    /// Idempotent per `(subscription, cycle_date)`: a second call for the same
    /// cycle returns the recorded result without charging again. A late
    /// response from a timed-out attempt is ignored because the attempt record
    /// already holds a terminal status.
    pub async fn renew(&self, id: SubscriptionId, cycle_date: Date) -> EngineResult<RenewalOutcome> {
        let mut sub = self.require_subscription(id).await?;

        if !matches!(
            sub.state,
            SubscriptionState::Active | SubscriptionState::Grace
        ) {
            return Err(EngineError::InvalidTransition {
                from: sub.state,
                to: SubscriptionState::Active,
            });
        }

        let mut attempt = match self.subs.claim_renewal_attempt(id, cycle_date).await? {
            AttemptClaim::Existing(prior) => {
                info!(
                    subscription_id = %id,
                    cycle_date = %cycle_date,
                    status = %prior.status,
                    "Renewal cycle already processed"
                );
                return Ok(RenewalOutcome::AlreadyProcessed {
                    status: prior.status,
                });
            }
            AttemptClaim::Claimed(attempt) => attempt,
        };

        // An admin may have force-renewed on a different cycle already
        if sub.next_renewal_date > cycle_date {
            attempt.status = RenewalStatus::Skipped;
            attempt.updated_at = OffsetDateTime::now_utc();
            self.subs
                .commit_transition(&sub, Some(&attempt), None)
                .await?;
            return Ok(RenewalOutcome::AlreadyCurrent);
        }

        let plan = self.require_plan(sub.plan_id).await?;

        // Charge outside any lock, with a bounded timeout; a hung gateway must
        // not wedge the scheduler.
        let charge = tokio::time::timeout(
            Duration::from_secs(self.settings.charge_timeout_secs),
            self.charger.charge(&sub, &plan, cycle_date),
        )
        .await;

        match charge {
            Ok(Ok(receipt)) => {
                self.keep_or_reassign_slot(&mut sub).await?;

                // Renewed on time extends from the scheduled date; a late
                // (grace) renewal restarts from the cycle day.
                let base = if sub.next_renewal_date > cycle_date {
                    sub.next_renewal_date
                } else {
                    cycle_date
                };
                sub.state = SubscriptionState::Active;
                sub.next_renewal_date = base + time::Duration::days(plan.duration_days as i64);
                sub.renewals_completed += 1;
                sub.updated_at = OffsetDateTime::now_utc();

                attempt.status = RenewalStatus::Succeeded;
                attempt.reference = Some(receipt.reference.clone());
                attempt.updated_at = sub.updated_at;

                self.subs
                    .commit_transition(&sub, Some(&attempt), None)
                    .await?;
                info!(
                    subscription_id = %id,
                    next_renewal_date = %sub.next_renewal_date,
                    renewals_completed = sub.renewals_completed,
                    "Renewal succeeded"
                );
                Ok(RenewalOutcome::Renewed {
                    next_renewal_date: sub.next_renewal_date,
                    reference: receipt.reference,
                })
            }
            Ok(Err(e)) => {
                self.record_renewal_failure(&mut sub, &mut attempt, e.to_string())
                    .await
            }
            Err(_) => {
                let reason = format!(
                    "charge timed out after {}s",
                    self.settings.charge_timeout_secs
                );
                self.record_renewal_failure(&mut sub, &mut attempt, reason)
                    .await
            }
        }
    }

    async fn record_renewal_failure(
        &self,
        sub: &mut Subscription,
        attempt: &mut RenewalAttempt,
        reason: String,
    ) -> EngineResult<RenewalOutcome> {
        warn!(
            subscription_id = %sub.id,
            reason = %reason,
            "Renewal failed, entering grace"
        );
        // Grace keeps the slot: a customer likely to renew should not lose
        // their profile to reassignment thrash.
        sub.state = SubscriptionState::Grace;
        sub.updated_at = OffsetDateTime::now_utc();

        attempt.status = RenewalStatus::Failed;
        attempt.retry_count += 1;
        attempt.error = Some(reason.clone());
        attempt.updated_at = sub.updated_at;

        self.subs.commit_transition(sub, Some(attempt), None).await?;
        Ok(RenewalOutcome::Failed { reason })
    }

    /// Keep the existing slot unless its account was deactivated, in which
    /// case the tightest-fit search runs again.
    async fn keep_or_reassign_slot(&self, sub: &mut Subscription) -> EngineResult<()> {
        let Some(old_slot) = sub.slot else {
            return Ok(());
        };
        let account = self.accounts.get_account(old_slot.account_id).await?;
        if account.map(|a| a.active).unwrap_or(false) {
            return Ok(());
        }

        // Allocate the replacement before releasing the old lease so a failed
        // search leaves the customer on the (deactivated) account rather than
        // with nothing.
        match self.allocator.allocate(sub.plan_id, sub.id, None).await {
            Ok(new_slot) => {
                self.pool.release_slot(&old_slot).await?;
                sub.slot = Some(new_slot);
                info!(
                    subscription_id = %sub.id,
                    old_account = %old_slot.account_id,
                    new_account = %new_slot.account_id,
                    "Reassigned slot away from deactivated account"
                );
            }
            Err(e) if e.is_capacity() => {
                error!(
                    subscription_id = %sub.id,
                    account_id = %old_slot.account_id,
                    "No capacity to reassign from deactivated account; keeping old slot"
                );
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Move a due subscription without auto-renew into Grace.
    ///
    /// No attempt record is written: nothing was attempted, and the state
    /// change itself makes a re-run a no-op. The customer can still renew
    /// manually for this cycle.
    pub async fn lapse_to_grace(&self, id: SubscriptionId) -> EngineResult<()> {
        let mut sub = self.require_subscription(id).await?;
        if sub.state != SubscriptionState::Active {
            return Ok(());
        }
        sub.state = SubscriptionState::Grace;
        sub.updated_at = OffsetDateTime::now_utc();
        self.subs.commit_transition(&sub, None, None).await?;
        info!(subscription_id = %id, "Renewal due without auto-renew; entering grace");
        Ok(())
    }

    /// Expire a Grace subscription whose window has elapsed, freeing its slot.
    ///
    /// Returns `true` when the subscription expired on this call.
    pub async fn expire_if_due(&self, id: SubscriptionId, today: Date) -> EngineResult<bool> {
        let mut sub = self.require_subscription(id).await?;
        if sub.state != SubscriptionState::Grace {
            return Ok(false);
        }
        let overdue_days = (today - sub.next_renewal_date).whole_days();
        if overdue_days < self.grace_days() {
            return Ok(false);
        }

        let slot = sub.slot.take();
        sub.state = SubscriptionState::Expired;
        sub.updated_at = OffsetDateTime::now_utc();
        self.subs.commit_transition(&sub, None, None).await?;

        // Release after the commit: a crash in between leaves the slot held
        // (safe direction) for the invariant checker to surface.
        if let Some(slot) = slot {
            self.pool.release_slot(&slot).await?;
        }
        info!(
            subscription_id = %id,
            overdue_days,
            "Grace window elapsed; subscription expired and slot released"
        );
        Ok(true)
    }

    // =========================================================================
    // Explicit operations
    // =========================================================================

    /// Cancel a subscription. Legal from Active, Grace, and Paused; releases
    /// the slot immediately (no grace) and is irreversible.
    pub async fn cancel(&self, id: SubscriptionId, reason: &str) -> EngineResult<Subscription> {
        let mut sub = self.require_subscription(id).await?;
        self.check_transition(&sub, SubscriptionState::Cancelled)?;

        let slot = sub.slot.take();
        sub.state = SubscriptionState::Cancelled;
        sub.cancel_reason = Some(reason.to_string());
        sub.cancelled_at = Some(OffsetDateTime::now_utc());
        sub.updated_at = OffsetDateTime::now_utc();
        self.subs.commit_transition(&sub, None, None).await?;

        if let Some(slot) = slot {
            self.pool.release_slot(&slot).await?;
        }
        info!(subscription_id = %id, reason = %reason, "Subscription cancelled");
        Ok(sub)
    }

    pub async fn pause(&self, id: SubscriptionId) -> EngineResult<Subscription> {
        let mut sub = self.require_subscription(id).await?;
        self.check_transition(&sub, SubscriptionState::Paused)?;
        sub.state = SubscriptionState::Paused;
        sub.updated_at = OffsetDateTime::now_utc();
        self.subs.commit_transition(&sub, None, None).await?;
        info!(subscription_id = %id, "Subscription paused");
        Ok(sub)
    }

    pub async fn resume(&self, id: SubscriptionId) -> EngineResult<Subscription> {
        let mut sub = self.require_subscription(id).await?;
        if sub.state != SubscriptionState::Paused {
            return Err(EngineError::InvalidTransition {
                from: sub.state,
                to: SubscriptionState::Active,
            });
        }
        sub.state = SubscriptionState::Active;
        sub.updated_at = OffsetDateTime::now_utc();
        self.subs.commit_transition(&sub, None, None).await?;
        info!(subscription_id = %id, "Subscription resumed");
        Ok(sub)
    }

    pub async fn set_auto_renew(
        &self,
        id: SubscriptionId,
        enabled: bool,
    ) -> EngineResult<Subscription> {
        let mut sub = self.require_subscription(id).await?;
        if sub.state.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: sub.state,
                to: sub.state,
            });
        }
        sub.auto_renew = enabled;
        sub.updated_at = OffsetDateTime::now_utc();
        self.subs.commit_transition(&sub, None, None).await?;
        info!(subscription_id = %id, enabled, "Auto-renew toggled");
        Ok(sub)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn require_subscription(&self, id: SubscriptionId) -> EngineResult<Subscription> {
        self.subs
            .get_subscription(id)
            .await?
            .ok_or(EngineError::SubscriptionNotFound(id))
    }

    async fn require_plan(&self, id: PlanId) -> EngineResult<Plan> {
        self.catalog
            .get_plan(id)
            .await?
            .ok_or(EngineError::PlanNotFound(id))
    }

    fn check_transition(
        &self,
        sub: &Subscription,
        to: SubscriptionState,
    ) -> EngineResult<()> {
        if !sub.state.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                from: sub.state,
                to,
            });
        }
        Ok(())
    }
}
