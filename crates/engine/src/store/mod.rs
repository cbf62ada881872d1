//! Storage capability traits
//!
//! The engine depends on these contracts, not on a concrete database. The
//! in-memory implementation backs the test suite and local runs; the Postgres
//! implementation backs production. Mutual exclusion lives inside the
//! implementations: per-account around slot operations, per-subscription
//! around lifecycle commits.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use cuenty_shared::{
    Account, AccountCapacity, AccountId, Combo, ComboId, NotificationEvent, NotificationKind,
    Plan, PlanId, RenewalAttempt, Slot, SlotRef, Subscription, SubscriptionId, SubscriptionState,
};
use time::{Date, OffsetDateTime};

use crate::error::EngineResult;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Outcome of trying to claim a renewal cycle
#[derive(Debug, Clone)]
pub enum AttemptClaim {
    /// This caller owns the cycle; the `Scheduled` record was written
    Claimed(RenewalAttempt),
    /// The cycle was already claimed; the prior record is returned
    Existing(RenewalAttempt),
}

/// Accounts and their slots
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn insert_account(&self, account: Account) -> EngineResult<()>;

    async fn get_account(&self, id: AccountId) -> EngineResult<Option<Account>>;

    async fn list_accounts(&self) -> EngineResult<Vec<Account>>;

    /// Accounts offering a service, oldest first (allocation tie-break order)
    async fn list_accounts_by_service(&self, service: &str) -> EngineResult<Vec<Account>>;

    async fn set_account_active(&self, id: AccountId, active: bool) -> EngineResult<()>;

    /// Atomically claim the first free slot index on the account.
    ///
    /// Safe under concurrent callers for the same account: two reservations
    /// can never receive the same index. Returns `NoCapacity` when full —
    /// a normal outcome, not a fault.
    async fn reserve_slot(
        &self,
        account_id: AccountId,
        subscription_id: SubscriptionId,
    ) -> EngineResult<SlotRef>;

    /// Mark a slot free. Releasing an already-free slot is a no-op.
    async fn release_slot(&self, slot: &SlotRef) -> EngineResult<()>;

    /// Advisory free-slot count; may be stale under concurrent reservation
    async fn free_slot_count(&self, account_id: AccountId) -> EngineResult<u32>;

    async fn list_slots(&self, account_id: AccountId) -> EngineResult<Vec<Slot>>;

    /// Capacity snapshot across all accounts, for the admin surface
    async fn capacity_snapshot(&self) -> EngineResult<Vec<AccountCapacity>>;
}

/// Subscriptions plus their idempotency records
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert_subscription(&self, sub: Subscription) -> EngineResult<()>;

    async fn get_subscription(&self, id: SubscriptionId) -> EngineResult<Option<Subscription>>;

    async fn list_subscriptions(&self) -> EngineResult<Vec<Subscription>>;

    async fn list_by_states(
        &self,
        states: &[SubscriptionState],
    ) -> EngineResult<Vec<Subscription>>;

    /// Persist a state transition together with its attempt/event records.
    ///
    /// The three writes commit together or not at all; this is what makes the
    /// idempotency keys trustworthy across crashes and re-runs.
    async fn commit_transition(
        &self,
        sub: &Subscription,
        attempt: Option<&RenewalAttempt>,
        event: Option<&NotificationEvent>,
    ) -> EngineResult<()>;

    /// Insert-if-absent on the `(subscription, cycle_date)` key.
    async fn claim_renewal_attempt(
        &self,
        id: SubscriptionId,
        cycle_date: Date,
    ) -> EngineResult<AttemptClaim>;

    async fn get_renewal_attempt(
        &self,
        id: SubscriptionId,
        cycle_date: Date,
    ) -> EngineResult<Option<RenewalAttempt>>;

    async fn get_notification_event(
        &self,
        id: SubscriptionId,
        kind: NotificationKind,
        cycle_date: Date,
    ) -> EngineResult<Option<NotificationEvent>>;

    async fn upsert_notification_event(&self, event: &NotificationEvent) -> EngineResult<()>;

    /// Terminally failed deliveries, surfaced to the admin side as alerts
    async fn list_failed_notifications(&self) -> EngineResult<Vec<NotificationEvent>>;

    /// Remove terminal subscriptions (and their records) last touched before
    /// the cutoff. Returns the number of subscriptions removed.
    async fn purge_terminal_subscriptions(&self, cutoff: OffsetDateTime) -> EngineResult<u64>;

    /// Remove finished notification events last touched before the cutoff.
    async fn purge_notification_events(&self, cutoff: OffsetDateTime) -> EngineResult<u64>;
}

/// Plans and combos (read-mostly catalog)
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn insert_plan(&self, plan: Plan) -> EngineResult<()>;

    async fn get_plan(&self, id: PlanId) -> EngineResult<Option<Plan>>;

    async fn list_plans(&self) -> EngineResult<Vec<Plan>>;

    async fn insert_combo(&self, combo: Combo) -> EngineResult<()>;

    async fn get_combo(&self, id: ComboId) -> EngineResult<Option<Combo>>;

    async fn list_combos(&self) -> EngineResult<Vec<Combo>>;
}
