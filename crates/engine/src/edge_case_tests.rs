// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Renewal Engine
//!
//! Exercises boundary conditions and race conditions in:
//! - Slot capacity under concurrency
//! - Tightest-fit allocation
//! - Lifecycle transitions and renewal idempotency
//! - Scheduler dedupe, gating, overlap, and grace expiry
//! - Notification retry and at-most-once delivery
//! - Combo pricing

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cuenty_shared::{
    Account, AppConfig, AutomationSettings, Combo, ComboId, ComboLine, CustomerId, EmailConfig,
    FeatureGate, NotificationKind, OrderId, Plan, PlanId, RenewalStatus, ScheduleConfig,
    ScheduleTime, Subscription, SubscriptionId, SubscriptionState,
};
use time::{Date, Duration as TimeDuration, OffsetDateTime};

use crate::channels::{DeliveryReceipt, NotificationChannel, NotificationPayload};
use crate::charge::{ChargeReceipt, PaymentCharger};
use crate::dispatcher::DeliveryOutcome;
use crate::error::EngineError;
use crate::lifecycle::{NewSubscription, RenewalOutcome};
use crate::orders::{AssignmentOutcome, PaidOrder};
use crate::store::{AccountStore, CatalogStore, MemoryStore, SubscriptionStore};
use crate::Engine;

// =============================================================================
// Test Doubles
// =============================================================================

/// Channel that records deliveries and can be told to fail
struct MockChannel {
    delivered: tokio::sync::Mutex<Vec<(String, NotificationKind)>>,
    fail_remaining: AtomicU32,
    delay_ms: u64,
}

impl MockChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: tokio::sync::Mutex::new(Vec::new()),
            fail_remaining: AtomicU32::new(0),
            delay_ms: 0,
        })
    }

    fn with_delay(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            delivered: tokio::sync::Mutex::new(Vec::new()),
            fail_remaining: AtomicU32::new(0),
            delay_ms,
        })
    }

    fn fail_next(&self, times: u32) {
        self.fail_remaining.store(times, Ordering::SeqCst);
    }

    async fn total(&self) -> usize {
        self.delivered.lock().await.len()
    }

    async fn count(&self, kind: NotificationKind) -> usize {
        self.delivered
            .lock()
            .await
            .iter()
            .filter(|(_, k)| *k == kind)
            .count()
    }
}

#[async_trait]
impl NotificationChannel for MockChannel {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn recipient(&self, payload: &NotificationPayload) -> Option<String> {
        payload.recipient_phone.clone()
    }

    async fn deliver(
        &self,
        recipient: &str,
        kind: NotificationKind,
        _payload: &NotificationPayload,
    ) -> crate::error::EngineResult<DeliveryReceipt> {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Transport("mock channel down".to_string()));
        }
        self.delivered
            .lock()
            .await
            .push((recipient.to_string(), kind));
        Ok(DeliveryReceipt {
            message_ref: Some("mock-msg".to_string()),
        })
    }
}

/// Charger that approves unless told to decline
struct MockCharger {
    decline: AtomicBool,
}

impl MockCharger {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            decline: AtomicBool::new(false),
        })
    }

    fn set_decline(&self, decline: bool) {
        self.decline.store(decline, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentCharger for MockCharger {
    async fn charge(
        &self,
        subscription: &Subscription,
        plan: &Plan,
        cycle_date: Date,
    ) -> crate::error::EngineResult<ChargeReceipt> {
        if self.decline.load(Ordering::SeqCst) {
            return Err(EngineError::ChargeDeclined("card declined".to_string()));
        }
        Ok(ChargeReceipt {
            reference: format!("test-{}-{}", subscription.id, cycle_date),
            amount_cents: plan.price_cents,
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

struct TestHarness {
    store: Arc<MemoryStore>,
    engine: Engine,
    channel: Arc<MockChannel>,
    charger: Arc<MockCharger>,
}

fn test_config(gate: FeatureGate) -> AppConfig {
    AppConfig {
        features: gate,
        schedules: ScheduleConfig {
            renewal_check: ScheduleTime { hour: 9, minute: 0 },
            log_cleanup: ScheduleTime { hour: 2, minute: 0 },
        },
        automation: AutomationSettings {
            grace_days: 3,
            reminder_thresholds: vec![7, 3, 1, 0],
            retention_days: 90,
            max_notification_attempts: 2,
            notification_timeout_secs: 2,
            charge_timeout_secs: 5,
            ops_webhook_url: None,
        },
        chatwoot: None,
        email: EmailConfig {
            resend_api_key: String::new(),
            email_from: "Cuenty <noreply@cuenty.shop>".to_string(),
            app_name: "Cuenty".to_string(),
            support_email: "soporte@cuenty.shop".to_string(),
        },
    }
}

fn harness_with(gate: FeatureGate, channel: Arc<MockChannel>) -> TestHarness {
    let store = Arc::new(MemoryStore::new());
    let charger = MockCharger::new();
    let primary: Option<Arc<dyn NotificationChannel>> = Some(channel.clone());
    let engine = Engine::with_parts(
        test_config(gate),
        store.clone(),
        store.clone(),
        store.clone(),
        charger.clone(),
        primary,
        None,
    );
    TestHarness {
        store,
        engine,
        channel,
        charger,
    }
}

fn harness() -> TestHarness {
    harness_with(FeatureGate::all_enabled(), MockChannel::new())
}

fn today() -> Date {
    OffsetDateTime::now_utc().date()
}

async fn seed_plan(h: &TestHarness, service: &str) -> Plan {
    let plan = Plan {
        id: PlanId::new(),
        service: service.to_string(),
        name: format!("{} Monthly", service),
        duration_days: 30,
        price_cents: 12_900,
        cost_cents: 8_000,
        active: true,
        created_at: OffsetDateTime::now_utc(),
    };
    h.store.insert_plan(plan.clone()).await.unwrap();
    plan
}

async fn seed_account(h: &TestHarness, service: &str, capacity: u32, age_minutes: i64) -> Account {
    let mut account = Account::new(
        service,
        format!("{}@accounts.example", service),
        "sup3r-s3cret",
        capacity,
    );
    account.created_at = OffsetDateTime::now_utc() - TimeDuration::minutes(age_minutes);
    h.store.insert_account(account.clone()).await.unwrap();
    account
}

/// Fill `n` slots on an account with placeholder leases
async fn occupy(h: &TestHarness, account: &Account, n: u32) {
    for _ in 0..n {
        h.store
            .reserve_slot(account.id, SubscriptionId::new())
            .await
            .unwrap();
    }
}

/// Create an Active subscription with an allocated slot and a renewal date
/// `next_in_days` from today
async fn active_subscription(
    h: &TestHarness,
    plan: &Plan,
    auto_renew: bool,
    next_in_days: i64,
) -> Subscription {
    let sub = h
        .engine
        .lifecycle
        .create_pending(
            NewSubscription {
                customer_id: CustomerId::new(),
                plan_id: plan.id,
                order_id: None,
                auto_renew,
                contact_phone: Some("+5215512345678".to_string()),
                contact_email: Some("ana@example.com".to_string()),
            },
            today(),
        )
        .await
        .unwrap();
    let slot = h
        .engine
        .allocator
        .allocate(plan.id, sub.id, None)
        .await
        .unwrap();
    let mut sub = h.engine.lifecycle.activate(sub.id, slot, today()).await.unwrap();
    sub.next_renewal_date = today() + TimeDuration::days(next_in_days);
    h.store.commit_transition(&sub, None, None).await.unwrap();
    sub
}

fn reminder_payload(sub: &Subscription, plan: &Plan) -> NotificationPayload {
    NotificationPayload {
        service: plan.service.clone(),
        plan: plan.name.clone(),
        recipient_phone: sub.contact_phone.clone(),
        recipient_email: sub.contact_email.clone(),
        expires_on: sub.next_renewal_date,
        days_remaining: Some(3),
        credentials: None,
    }
}

// =============================================================================
// CAP: Capacity under concurrency
// =============================================================================

mod capacity_tests {
    use super::*;
    use tokio::sync::Barrier;

    // =========================================================================
    // CAP-01: capacity+1 concurrent reservations yield exactly capacity
    // successes and the remainder NoCapacity
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_reservations_respect_capacity() {
        let h = harness();
        let account = seed_account(&h, "netflix", 4, 10).await;

        let barrier = Arc::new(Barrier::new(5));
        let mut handles = vec![];
        for _ in 0..5 {
            let pool = h.engine.pool.clone();
            let barrier = Arc::clone(&barrier);
            let account_id = account.id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                pool.reserve_slot(account_id, SubscriptionId::new()).await
            }));
        }

        let mut ok = 0;
        let mut no_capacity = 0;
        let mut indexes = std::collections::HashSet::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(slot) => {
                    ok += 1;
                    indexes.insert(slot.slot_index);
                }
                Err(EngineError::NoCapacity { .. }) => no_capacity += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(ok, 4, "Exactly capacity reservations should succeed");
        assert_eq!(no_capacity, 1, "The overflow caller gets NoCapacity");
        assert_eq!(indexes.len(), 4, "No two callers share a slot index");
        assert_eq!(h.engine.pool.capacity_remaining(account.id).await.unwrap(), 0);
    }

    // =========================================================================
    // CAP-02: releasing a slot twice is a no-op, not an error
    // =========================================================================
    #[tokio::test]
    async fn test_release_is_idempotent() {
        let h = harness();
        let account = seed_account(&h, "netflix", 2, 10).await;

        let slot = h
            .engine
            .pool
            .reserve_slot(account.id, SubscriptionId::new())
            .await
            .unwrap();
        assert_eq!(h.engine.pool.capacity_remaining(account.id).await.unwrap(), 1);

        h.engine.pool.release_slot(&slot).await.unwrap();
        h.engine.pool.release_slot(&slot).await.unwrap();
        assert_eq!(h.engine.pool.capacity_remaining(account.id).await.unwrap(), 2);
    }

    // =========================================================================
    // CAP-03: deactivated accounts refuse reservations
    // =========================================================================
    #[tokio::test]
    async fn test_inactive_account_refuses_reservation() {
        let h = harness();
        let account = seed_account(&h, "netflix", 2, 10).await;
        h.store.set_account_active(account.id, false).await.unwrap();

        let result = h
            .engine
            .pool
            .reserve_slot(account.id, SubscriptionId::new())
            .await;
        assert!(matches!(result, Err(EngineError::NoCapacity { .. })));
    }
}

// =============================================================================
// ALLOC: Tightest-fit allocation
// =============================================================================

mod allocator_tests {
    use super::*;

    // =========================================================================
    // ALLOC-01: full account A is skipped; B takes the lease (spec scenario)
    // =========================================================================
    #[tokio::test]
    async fn test_full_account_falls_through_to_sibling() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let a = seed_account(&h, "netflix", 4, 20).await;
        let b = seed_account(&h, "netflix", 4, 10).await;
        occupy(&h, &a, 4).await;
        occupy(&h, &b, 1).await;

        let slot = h
            .engine
            .allocator
            .allocate(plan.id, SubscriptionId::new(), None)
            .await
            .unwrap();
        assert_eq!(slot.account_id, b.id);
        assert_eq!(h.engine.pool.capacity_remaining(b.id).await.unwrap(), 2);

        let snapshot = h.engine.pool.snapshot().await.unwrap();
        let b_snap = snapshot.iter().find(|s| s.account_id == b.id).unwrap();
        assert_eq!(b_snap.occupied, 2);
    }

    // =========================================================================
    // ALLOC-02: the account with the fewest free slots wins
    // =========================================================================
    #[tokio::test]
    async fn test_tightest_fit_prefers_fullest_account() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let roomy = seed_account(&h, "netflix", 5, 20).await;
        let tight = seed_account(&h, "netflix", 5, 10).await;
        occupy(&h, &roomy, 1).await;
        occupy(&h, &tight, 4).await;

        let slot = h
            .engine
            .allocator
            .allocate(plan.id, SubscriptionId::new(), None)
            .await
            .unwrap();
        assert_eq!(slot.account_id, tight.id, "Fewest-free account packs first");
    }

    // =========================================================================
    // ALLOC-03: equal free counts break the tie by creation order
    // =========================================================================
    #[tokio::test]
    async fn test_tie_breaks_by_account_age() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let older = seed_account(&h, "netflix", 3, 60).await;
        let _newer = seed_account(&h, "netflix", 3, 5).await;

        let slot = h
            .engine
            .allocator
            .allocate(plan.id, SubscriptionId::new(), None)
            .await
            .unwrap();
        assert_eq!(slot.account_id, older.id);
    }

    // =========================================================================
    // ALLOC-04: every matching account full => Exhausted
    // =========================================================================
    #[tokio::test]
    async fn test_all_full_returns_exhausted() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let a = seed_account(&h, "netflix", 2, 10).await;
        occupy(&h, &a, 2).await;
        // Other services don't count
        seed_account(&h, "spotify", 5, 10).await;

        let result = h
            .engine
            .allocator
            .allocate(plan.id, SubscriptionId::new(), None)
            .await;
        assert!(matches!(result, Err(EngineError::Exhausted { .. })));
    }
}

// =============================================================================
// LIFE: Lifecycle and renewal idempotency
// =============================================================================

mod lifecycle_tests {
    use super::*;

    // =========================================================================
    // LIFE-01: renewing the same cycle twice charges once (spec property)
    // =========================================================================
    #[tokio::test]
    async fn test_renew_is_idempotent_per_cycle() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 3, 10).await;
        let sub = active_subscription(&h, &plan, true, 0).await;

        let first = h.engine.lifecycle.renew(sub.id, today()).await.unwrap();
        let next_renewal_date = match first {
            RenewalOutcome::Renewed {
                next_renewal_date, ..
            } => next_renewal_date,
            other => panic!("expected Renewed, got {:?}", other),
        };
        assert_eq!(next_renewal_date, today() + TimeDuration::days(30));

        let second = h.engine.lifecycle.renew(sub.id, today()).await.unwrap();
        assert!(matches!(
            second,
            RenewalOutcome::AlreadyProcessed {
                status: RenewalStatus::Succeeded
            }
        ));

        let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.renewals_completed, 1, "One transition, not two");
        assert_eq!(stored.next_renewal_date, today() + TimeDuration::days(30));
    }

    // =========================================================================
    // LIFE-02: failed charge => Grace, slot kept
    // =========================================================================
    #[tokio::test]
    async fn test_failed_renewal_enters_grace_and_keeps_slot() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let account = seed_account(&h, "netflix", 3, 10).await;
        let sub = active_subscription(&h, &plan, true, 0).await;
        h.charger.set_decline(true);

        let outcome = h.engine.lifecycle.renew(sub.id, today()).await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::Failed { .. }));

        let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SubscriptionState::Grace);
        assert!(stored.slot.is_some(), "Grace holds the slot");
        assert_eq!(h.engine.pool.capacity_remaining(account.id).await.unwrap(), 2);
    }

    // =========================================================================
    // LIFE-03: a customer in Grace can renew manually on a later cycle
    // =========================================================================
    #[tokio::test]
    async fn test_manual_renewal_from_grace() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 3, 10).await;
        let sub = active_subscription(&h, &plan, true, 0).await;

        h.charger.set_decline(true);
        h.engine.lifecycle.renew(sub.id, today()).await.unwrap();
        h.charger.set_decline(false);

        let tomorrow = today() + TimeDuration::days(1);
        let outcome = h.engine.lifecycle.renew(sub.id, tomorrow).await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::Renewed { .. }));

        let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SubscriptionState::Active);
        // A late renewal restarts the clock from the cycle day
        assert_eq!(stored.next_renewal_date, tomorrow + TimeDuration::days(30));
    }

    // =========================================================================
    // LIFE-04: cancellation releases the slot immediately and is final
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_releases_slot_and_is_terminal() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let account = seed_account(&h, "netflix", 2, 10).await;
        let sub = active_subscription(&h, &plan, false, 10).await;
        assert_eq!(h.engine.pool.capacity_remaining(account.id).await.unwrap(), 1);

        let cancelled = h
            .engine
            .lifecycle
            .cancel(sub.id, "customer request")
            .await
            .unwrap();
        assert_eq!(cancelled.state, SubscriptionState::Cancelled);
        assert!(cancelled.slot.is_none());
        assert_eq!(h.engine.pool.capacity_remaining(account.id).await.unwrap(), 2);

        let again = h.engine.lifecycle.cancel(sub.id, "again").await;
        assert!(matches!(again, Err(EngineError::InvalidTransition { .. })));
    }

    // =========================================================================
    // LIFE-05: cancel is not legal from Pending
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_from_pending_rejected() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let sub = h
            .engine
            .lifecycle
            .create_pending(
                NewSubscription {
                    customer_id: CustomerId::new(),
                    plan_id: plan.id,
                    order_id: None,
                    auto_renew: false,
                    contact_phone: None,
                    contact_email: None,
                },
                today(),
            )
            .await
            .unwrap();

        let result = h.engine.lifecycle.cancel(sub.id, "oops").await;
        assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
    }

    // =========================================================================
    // LIFE-06: pause keeps the slot; resume restores Active
    // =========================================================================
    #[tokio::test]
    async fn test_pause_and_resume() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let account = seed_account(&h, "netflix", 2, 10).await;
        let sub = active_subscription(&h, &plan, false, 10).await;

        let paused = h.engine.lifecycle.pause(sub.id).await.unwrap();
        assert_eq!(paused.state, SubscriptionState::Paused);
        assert!(paused.slot.is_some());
        assert_eq!(h.engine.pool.capacity_remaining(account.id).await.unwrap(), 1);

        // Renewal is not legal while paused
        let renew = h.engine.lifecycle.renew(sub.id, today()).await;
        assert!(matches!(renew, Err(EngineError::InvalidTransition { .. })));

        let resumed = h.engine.lifecycle.resume(sub.id).await.unwrap();
        assert_eq!(resumed.state, SubscriptionState::Active);
    }

    // =========================================================================
    // LIFE-07: renewal reassigns away from a deactivated account
    // =========================================================================
    #[tokio::test]
    async fn test_renewal_reassigns_from_deactivated_account() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let old_home = seed_account(&h, "netflix", 2, 20).await;
        let sub = active_subscription(&h, &plan, true, 0).await;
        assert_eq!(sub.slot.unwrap().account_id, old_home.id);

        h.store.set_account_active(old_home.id, false).await.unwrap();
        let new_home = seed_account(&h, "netflix", 2, 5).await;

        let outcome = h.engine.lifecycle.renew(sub.id, today()).await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::Renewed { .. }));

        let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.slot.unwrap().account_id, new_home.id);
        assert_eq!(
            h.engine.pool.capacity_remaining(old_home.id).await.unwrap(),
            2,
            "Old slot was released"
        );
    }

    // =========================================================================
    // LIFE-08: a renewal for an already-covered cycle records Skipped
    // =========================================================================
    #[tokio::test]
    async fn test_renewal_for_covered_cycle_is_skipped() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 2, 10).await;
        let sub = active_subscription(&h, &plan, true, 10).await;

        let outcome = h.engine.lifecycle.renew(sub.id, today()).await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::AlreadyCurrent));

        let attempt = h
            .store
            .get_renewal_attempt(sub.id, today())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.status, RenewalStatus::Skipped);
    }
}

// =============================================================================
// SCHED: Scheduler behavior
// =============================================================================

mod scheduler_tests {
    use super::*;

    // =========================================================================
    // SCHED-01: running twice on the same day sends one ReminderSoon (spec)
    // =========================================================================
    #[tokio::test]
    async fn test_same_day_reminder_dedupe() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 3, 10).await;
        active_subscription(&h, &plan, false, 3).await;

        let first = h.engine.scheduler.try_run(today()).await.unwrap().unwrap();
        assert_eq!(first.reminders_sent, 1);

        let second = h.engine.scheduler.try_run(today()).await.unwrap().unwrap();
        assert_eq!(second.reminders_sent, 0);
        assert_eq!(second.reminders_deduped, 1);

        assert_eq!(h.channel.count(NotificationKind::ReminderSoon).await, 1);
    }

    // =========================================================================
    // SCHED-02: a due auto-renew subscription renews exactly once across runs
    // =========================================================================
    #[tokio::test]
    async fn test_due_auto_renewal_processed_once() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 3, 10).await;
        let sub = active_subscription(&h, &plan, true, 0).await;

        let first = h.engine.scheduler.try_run(today()).await.unwrap().unwrap();
        assert_eq!(first.renewals_succeeded, 1);
        assert_eq!(h.channel.count(NotificationKind::RenewalReceipt).await, 1);

        // After a successful renewal the subscription is no longer due, so the
        // second run has nothing to process for it.
        let second = h.engine.scheduler.try_run(today()).await.unwrap().unwrap();
        assert_eq!(second.renewals_succeeded, 0);

        let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.renewals_completed, 1);
    }

    // =========================================================================
    // SCHED-03: due without auto-renew lapses into Grace, keeping the slot
    // =========================================================================
    #[tokio::test]
    async fn test_due_without_auto_renew_lapses_to_grace() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let account = seed_account(&h, "netflix", 3, 10).await;
        let sub = active_subscription(&h, &plan, false, 0).await;

        let summary = h.engine.scheduler.try_run(today()).await.unwrap().unwrap();
        assert_eq!(summary.lapsed, 1);

        let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SubscriptionState::Grace);
        assert_eq!(
            h.engine.pool.capacity_remaining(account.id).await.unwrap(),
            2,
            "Grace keeps the slot reserved"
        );
    }

    // =========================================================================
    // SCHED-04: grace expiry releases capacity for a new order (spec scenario)
    // =========================================================================
    #[tokio::test]
    async fn test_grace_expiry_releases_capacity() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let account = seed_account(&h, "netflix", 1, 10).await;
        let sub = active_subscription(&h, &plan, false, 0).await;

        // Day 0: the missed renewal lapses into grace
        h.engine.scheduler.try_run(today()).await.unwrap().unwrap();
        assert_eq!(h.engine.pool.capacity_remaining(account.id).await.unwrap(), 0);

        // Day 3: the grace window has elapsed
        let day3 = today() + TimeDuration::days(3);
        let summary = h.engine.scheduler.try_run(day3).await.unwrap().unwrap();
        assert_eq!(summary.expired, 1);
        assert_eq!(h.channel.count(NotificationKind::ExpiryNotice).await, 1);

        let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SubscriptionState::Expired);
        assert!(stored.slot.is_none());

        let slots = h.store.list_slots(account.id).await.unwrap();
        assert!(slots[0].occupied_by.is_none(), "occupiedBy is empty");

        // The freed slot is immediately allocatable to a new order
        let slot = h
            .engine
            .allocator
            .allocate(plan.id, SubscriptionId::new(), None)
            .await
            .unwrap();
        assert_eq!(slot.account_id, account.id);
    }

    // =========================================================================
    // SCHED-05: grace does not expire before the window elapses
    // =========================================================================
    #[tokio::test]
    async fn test_grace_survives_until_window_elapses() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 1, 10).await;
        let sub = active_subscription(&h, &plan, false, 0).await;

        h.engine.scheduler.try_run(today()).await.unwrap().unwrap();
        let day2 = today() + TimeDuration::days(2);
        let summary = h.engine.scheduler.try_run(day2).await.unwrap().unwrap();
        assert_eq!(summary.expired, 0);

        let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SubscriptionState::Grace);
    }

    // =========================================================================
    // SCHED-06: gates off => scan still runs, nothing mutates or sends
    // =========================================================================
    #[tokio::test]
    async fn test_disabled_gates_scan_only() {
        let h = harness_with(FeatureGate::all_disabled(), MockChannel::new());
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 3, 10).await;
        let sub = active_subscription(&h, &plan, true, 0).await;

        let summary = h.engine.scheduler.try_run(today()).await.unwrap().unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.census.due_now, 1);
        assert!(summary.renewals_gated);
        assert!(summary.notifications_gated);
        assert_eq!(summary.renewals_succeeded, 0);
        assert_eq!(summary.reminders_sent, 0);

        let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SubscriptionState::Active, "No mutation when gated");
        assert_eq!(h.channel.total().await, 0);
    }

    // =========================================================================
    // SCHED-07: urgency census buckets match the tier boundaries
    // =========================================================================
    #[tokio::test]
    async fn test_urgency_census() {
        let h = harness_with(FeatureGate::all_disabled(), MockChannel::new());
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 8, 10).await;
        for days in [-2, 0, 1, 3, 5, 10] {
            active_subscription(&h, &plan, false, days).await;
        }

        let summary = h.engine.scheduler.try_run(today()).await.unwrap().unwrap();
        assert_eq!(summary.census.due_now, 2);
        assert_eq!(summary.census.one_day, 1);
        assert_eq!(summary.census.two_to_three_days, 1);
        assert_eq!(summary.census.four_to_seven_days, 1);
        assert_eq!(summary.census.later, 1);
    }

    // =========================================================================
    // SCHED-08: an overlapping trigger is skipped, not run concurrently
    // =========================================================================
    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let h = harness_with(FeatureGate::all_enabled(), MockChannel::with_delay(300));
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 3, 10).await;
        active_subscription(&h, &plan, false, 3).await;

        let (first, second) = tokio::join!(
            h.engine.scheduler.try_run(today()),
            h.engine.scheduler.try_run(today()),
        );
        let ran: Vec<bool> = vec![first.unwrap().is_some(), second.unwrap().is_some()];
        assert_eq!(
            ran.iter().filter(|r| **r).count(),
            1,
            "Exactly one of the overlapping triggers runs"
        );
        assert_eq!(h.channel.count(NotificationKind::ReminderSoon).await, 1);
    }

    // =========================================================================
    // SCHED-09: urgency report groups live subscriptions by tier
    // =========================================================================
    #[tokio::test]
    async fn test_urgency_report_groups() {
        let h = harness_with(FeatureGate::all_disabled(), MockChannel::new());
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 4, 10).await;
        let due = active_subscription(&h, &plan, false, 0).await;
        let soon = active_subscription(&h, &plan, false, 3).await;

        let report = h.engine.scheduler.urgency_report(today()).await.unwrap();
        let due_group = report
            .iter()
            .find(|g| g.tier == cuenty_shared::UrgencyTier::DueNow)
            .unwrap();
        assert!(due_group.subscriptions.iter().any(|d| d.id == due.id));

        let soon_group = report
            .iter()
            .find(|g| g.tier == cuenty_shared::UrgencyTier::TwoToThreeDays)
            .unwrap();
        assert!(soon_group.subscriptions.iter().any(|d| d.id == soon.id));
    }
}

// =============================================================================
// NOTIF: Dispatcher retry and idempotency
// =============================================================================

mod dispatcher_tests {
    use super::*;
    use cuenty_shared::NotificationStatus;

    // =========================================================================
    // NOTIF-01: sending the same event key twice delivers once (spec property)
    // =========================================================================
    #[tokio::test]
    async fn test_idempotent_send() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 2, 10).await;
        let sub = active_subscription(&h, &plan, false, 3).await;
        let payload = reminder_payload(&sub, &plan);

        let first = h
            .engine
            .dispatcher
            .send(sub.id, NotificationKind::ReminderSoon, today(), payload.clone())
            .await
            .unwrap();
        assert!(matches!(first, DeliveryOutcome::Delivered { attempts: 1 }));

        let second = h
            .engine
            .dispatcher
            .send(sub.id, NotificationKind::ReminderSoon, today(), payload)
            .await
            .unwrap();
        assert!(matches!(second, DeliveryOutcome::AlreadyDelivered));

        assert_eq!(h.channel.total().await, 1, "One outbound delivery sequence");
    }

    // =========================================================================
    // NOTIF-02: a transient failure is retried with backoff, then succeeds
    // =========================================================================
    #[tokio::test]
    async fn test_transient_failure_retried() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 2, 10).await;
        let sub = active_subscription(&h, &plan, false, 3).await;
        h.channel.fail_next(1);

        let outcome = h
            .engine
            .dispatcher
            .send(
                sub.id,
                NotificationKind::ReminderSoon,
                today(),
                reminder_payload(&sub, &plan),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Delivered { attempts: 2 }));
        assert_eq!(h.channel.total().await, 1);
    }

    // =========================================================================
    // NOTIF-03: retries exhausted => terminal Failed, surfaced as an alert
    // =========================================================================
    #[tokio::test]
    async fn test_retries_exhausted_fails_terminally() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 2, 10).await;
        let sub = active_subscription(&h, &plan, false, 3).await;
        h.channel.fail_next(10);

        let outcome = h
            .engine
            .dispatcher
            .send(
                sub.id,
                NotificationKind::ReminderSoon,
                today(),
                reminder_payload(&sub, &plan),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Failed { attempts: 2, .. }));

        let event = h
            .store
            .get_notification_event(sub.id, NotificationKind::ReminderSoon, today())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, NotificationStatus::Failed);
        assert_eq!(event.retry_count, 2);

        let alerts = h.engine.failed_notifications().await.unwrap();
        assert_eq!(alerts.len(), 1, "Terminal failure is queryable, not dropped");

        // A later send for the same key returns the recorded failure without
        // another delivery attempt sequence.
        h.channel.fail_next(0);
        let again = h
            .engine
            .dispatcher
            .send(
                sub.id,
                NotificationKind::ReminderSoon,
                today(),
                reminder_payload(&sub, &plan),
            )
            .await
            .unwrap();
        assert!(matches!(again, DeliveryOutcome::Failed { .. }));
        assert_eq!(h.channel.total().await, 0, "No delivery after terminal failure");
    }

    // =========================================================================
    // NOTIF-04: a payload without a recipient handle fails terminally
    // =========================================================================
    #[tokio::test]
    async fn test_missing_recipient_fails_terminally() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 2, 10).await;
        let sub = active_subscription(&h, &plan, false, 3).await;
        let mut payload = reminder_payload(&sub, &plan);
        payload.recipient_phone = None;

        let outcome = h
            .engine
            .dispatcher
            .send(sub.id, NotificationKind::ReminderSoon, today(), payload)
            .await
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Failed { .. }));
        assert_eq!(h.engine.failed_notifications().await.unwrap().len(), 1);
    }
}

// =============================================================================
// ORDER: Paid order intake
// =============================================================================

mod order_tests {
    use super::*;

    fn paid_order(plan: &Plan) -> PaidOrder {
        PaidOrder {
            order_id: OrderId::new(),
            customer_id: CustomerId::new(),
            plan_id: plan.id,
            auto_renew: true,
            contact_phone: Some("+5215598765432".to_string()),
            contact_email: Some("luis@example.com".to_string()),
        }
    }

    // =========================================================================
    // ORDER-01: a paid order gets a slot and its credentials
    // =========================================================================
    #[tokio::test]
    async fn test_paid_order_assigned_and_credentials_delivered() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let account = seed_account(&h, "netflix", 3, 10).await;

        let outcome = h
            .engine
            .orders
            .confirm_order_paid(paid_order(&plan), today())
            .await
            .unwrap();
        let (subscription_id, slot, credentials_delivered) = match outcome {
            AssignmentOutcome::Assigned {
                subscription_id,
                slot,
                credentials_delivered,
            } => (subscription_id, slot, credentials_delivered),
            other => panic!("expected Assigned, got {:?}", other),
        };
        assert_eq!(slot.account_id, account.id);
        assert!(credentials_delivered);
        assert_eq!(h.channel.count(NotificationKind::CredentialDelivery).await, 1);

        let stored = h
            .store
            .get_subscription(subscription_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, SubscriptionState::Active);
        assert_eq!(stored.start_date, Some(today()));
        assert_eq!(stored.next_renewal_date, today() + TimeDuration::days(30));
    }

    // =========================================================================
    // ORDER-02: exhausted capacity queues the order instead of failing it
    // =========================================================================
    #[tokio::test]
    async fn test_exhausted_capacity_queues_order() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        let account = seed_account(&h, "netflix", 1, 10).await;
        occupy(&h, &account, 1).await;

        let outcome = h
            .engine
            .orders
            .confirm_order_paid(paid_order(&plan), today())
            .await
            .unwrap();
        let subscription_id = match outcome {
            AssignmentOutcome::Queued {
                subscription_id, ..
            } => subscription_id,
            other => panic!("expected Queued, got {:?}", other),
        };

        let stored = h
            .store
            .get_subscription(subscription_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, SubscriptionState::Pending);
        assert!(stored.slot.is_none());
    }

    // =========================================================================
    // ORDER-03: assignment gate off => queued for manual handling
    // =========================================================================
    #[tokio::test]
    async fn test_assignment_gate_off_queues_order() {
        let mut gate = FeatureGate::all_enabled();
        gate.auto_assignment = false;
        let h = harness_with(gate, MockChannel::new());
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 3, 10).await;

        let outcome = h
            .engine
            .orders
            .confirm_order_paid(paid_order(&plan), today())
            .await
            .unwrap();
        assert!(matches!(outcome, AssignmentOutcome::Queued { .. }));
        assert_eq!(h.channel.total().await, 0);
    }
}

// =============================================================================
// COMBO: Aggregated pricing
// =============================================================================

mod combo_tests {
    use super::*;

    async fn seed_combo(
        h: &TestHarness,
        lines: Vec<ComboLine>,
        auto_calculate: bool,
        overrides: Option<(i64, i64)>,
    ) -> Combo {
        let combo = Combo {
            id: ComboId::new(),
            name: "Streaming Duo".to_string(),
            description: Some("Two services, one price".to_string()),
            lines,
            auto_calculate,
            price_override_cents: overrides.map(|(p, _)| p),
            cost_override_cents: overrides.map(|(_, c)| c),
            active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        h.store.insert_combo(combo.clone()).await.unwrap();
        combo
    }

    // =========================================================================
    // COMBO-01: auto-calculated totals are the sum of the lines (spec)
    // =========================================================================
    #[tokio::test]
    async fn test_auto_calculated_totals() {
        let h = harness();
        let p1 = seed_plan(&h, "netflix").await;
        let mut p2 = seed_plan(&h, "spotify").await;
        p2.price_cents = 9_900;
        p2.cost_cents = 6_500;
        h.store.insert_plan(p2.clone()).await.unwrap();

        let combo = seed_combo(
            &h,
            vec![
                ComboLine { plan_id: p1.id, quantity: 1 },
                ComboLine { plan_id: p2.id, quantity: 2 },
            ],
            true,
            None,
        )
        .await;

        let breakdown = h.engine.pricing.breakdown(combo.id).await.unwrap();
        assert_eq!(
            breakdown.price_total_cents,
            p1.price_cents + 2 * p2.price_cents
        );
        assert_eq!(breakdown.cost_total_cents, p1.cost_cents + 2 * p2.cost_cents);
        assert_eq!(breakdown.lines.len(), 2);
        assert_eq!(breakdown.lines[1].line_price_cents, 2 * p2.price_cents);
    }

    // =========================================================================
    // COMBO-02: explicit overrides win when auto-calculate is off
    // =========================================================================
    #[tokio::test]
    async fn test_override_totals() {
        let h = harness();
        let p1 = seed_plan(&h, "netflix").await;
        let combo = seed_combo(
            &h,
            vec![ComboLine { plan_id: p1.id, quantity: 3 }],
            false,
            Some((29_900, 20_000)),
        )
        .await;

        let breakdown = h.engine.pricing.breakdown(combo.id).await.unwrap();
        assert_eq!(breakdown.price_total_cents, 29_900);
        assert_eq!(breakdown.cost_total_cents, 20_000);
        assert!(!breakdown.auto_calculated);
    }

    // =========================================================================
    // COMBO-03: unknown combo => ComboNotFound
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_combo() {
        let h = harness();
        let result = h.engine.pricing.breakdown(ComboId::new()).await;
        assert!(matches!(result, Err(EngineError::ComboNotFound(_))));
    }
}

// =============================================================================
// INV: Invariant checker
// =============================================================================

mod invariant_tests {
    use super::*;

    // =========================================================================
    // INV-01: a system after normal activity is healthy
    // =========================================================================
    #[tokio::test]
    async fn test_healthy_after_normal_activity() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 3, 10).await;
        let sub = active_subscription(&h, &plan, true, 0).await;
        h.engine.scheduler.try_run(today()).await.unwrap().unwrap();
        h.engine.lifecycle.cancel(sub.id, "done").await.unwrap();

        let summary = h.engine.invariants.run_all_checks().await.unwrap();
        assert!(summary.healthy, "violations: {:?}", summary.violations);
        assert_eq!(summary.checks_run, 5);
        assert_eq!(summary.checks_failed, 0);
    }

    // =========================================================================
    // INV-02: a dangling slot binding is detected
    // =========================================================================
    #[tokio::test]
    async fn test_dangling_slot_binding_detected() {
        let h = harness();
        seed_plan(&h, "netflix").await;
        let account = seed_account(&h, "netflix", 2, 10).await;
        // A lease pointing at a subscription that was never written is exactly
        // the crash residue the checker exists to surface.
        h.store
            .reserve_slot(account.id, SubscriptionId::new())
            .await
            .unwrap();

        let summary = h.engine.invariants.run_all_checks().await.unwrap();
        assert!(!summary.healthy);
        assert!(summary
            .violations
            .iter()
            .any(|v| v.invariant == "slot_binding_consistent"));
    }
}

// =============================================================================
// CLEAN: Retention cleanup
// =============================================================================

mod cleanup_tests {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_purges_old_terminal_subscriptions() {
        let h = harness();
        let plan = seed_plan(&h, "netflix").await;
        seed_account(&h, "netflix", 2, 10).await;
        let sub = active_subscription(&h, &plan, false, 10).await;
        h.engine.lifecycle.cancel(sub.id, "refund").await.unwrap();

        // Not yet past retention
        let now = OffsetDateTime::now_utc();
        let summary = h.engine.run_cleanup(now).await.unwrap();
        assert_eq!(summary.subscriptions_purged, 0);

        // Far future: the cancelled subscription ages out
        let later = now + TimeDuration::days(365);
        let summary = h.engine.run_cleanup(later).await.unwrap();
        assert_eq!(summary.subscriptions_purged, 1);
        assert!(h.store.get_subscription(sub.id).await.unwrap().is_none());
    }
}
