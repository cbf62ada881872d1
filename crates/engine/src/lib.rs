// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Cuenty Engine
//!
//! Account capacity and subscription renewal engine for time-boxed access to
//! shared streaming accounts.
//!
//! ## Features
//!
//! - **Account Pool**: fixed-capacity slot tracking with atomic reservation
//! - **Slot Allocator**: tightest-fit placement across accounts per service
//! - **Subscription Lifecycle**: creation, activation, renewal, grace,
//!   expiration, cancellation, pause
//! - **Renewal Scheduler**: daily scan with urgency buckets, auto-renewals,
//!   reminders, and grace expiry under feature-gate control
//! - **Notification Dispatcher**: messaging/email channels with bounded retry
//!   and at-most-once-per-event delivery
//! - **Combo Pricing**: aggregated price/cost breakdowns for plan bundles
//! - **Invariants**: runnable consistency checks over the stores

pub mod alerts;
pub mod allocator;
pub mod channels;
pub mod charge;
pub mod combos;
pub mod dispatcher;
pub mod error;
pub mod invariants;
pub mod lifecycle;
pub mod orders;
pub mod pool;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod edge_case_tests;

// Alerts
pub use alerts::OpsAlertNotifier;

// Allocator
pub use allocator::SlotAllocator;

// Channels
pub use channels::{
    ChatwootChannel, CredentialBundle, DeliveryReceipt, NotificationChannel, NotificationPayload,
    ResendEmailChannel,
};

// Charge
pub use charge::{AutoApproveCharger, ChargeReceipt, PaymentCharger};

// Combos
pub use combos::{ComboBreakdown, ComboLineBreakdown, ComboPricing};

// Dispatcher
pub use dispatcher::{DeliveryOutcome, NotificationDispatcher};

// Error
pub use error::{EngineError, EngineResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{NewSubscription, RenewalOutcome, SubscriptionLifecycle};

// Orders
pub use orders::{AssignmentOutcome, OrderIntake, PaidOrder};

// Pool
pub use pool::AccountPool;

// Scheduler
pub use scheduler::{RenewalScheduler, RunSummary, SubscriptionDigest, UrgencyCensus, UrgencyGroup};

// Store
pub use store::{AccountStore, AttemptClaim, CatalogStore, MemoryStore, PgStore, SubscriptionStore};

use std::sync::Arc;

use cuenty_shared::{AppConfig, NotificationEvent};
use serde::Serialize;
use time::OffsetDateTime;

/// What one cleanup pass removed
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CleanupSummary {
    pub subscriptions_purged: u64,
    pub events_purged: u64,
}

/// Main engine facade wiring every component from one configuration
pub struct Engine {
    pub pool: AccountPool,
    pub allocator: SlotAllocator,
    pub lifecycle: SubscriptionLifecycle,
    pub scheduler: RenewalScheduler,
    pub dispatcher: NotificationDispatcher,
    pub orders: OrderIntake,
    pub pricing: ComboPricing,
    pub invariants: InvariantChecker,
    subs: Arc<dyn SubscriptionStore>,
    retention_days: u32,
}

impl Engine {
    /// Wire the engine from a loaded configuration and a store implementing
    /// all three storage traits. Channels and the charger come from config.
    pub fn from_config<S>(config: AppConfig, store: Arc<S>) -> Self
    where
        S: AccountStore + SubscriptionStore + CatalogStore + 'static,
    {
        let accounts: Arc<dyn AccountStore> = store.clone();
        let subs: Arc<dyn SubscriptionStore> = store.clone();
        let catalog: Arc<dyn CatalogStore> = store;

        let primary: Option<Arc<dyn NotificationChannel>> = config
            .chatwoot
            .clone()
            .map(|c| Arc::new(ChatwootChannel::new(c)) as Arc<dyn NotificationChannel>);
        let email_copy: Option<Arc<dyn NotificationChannel>> =
            (config.features.email_copies && config.email.is_enabled())
                .then(|| Arc::new(ResendEmailChannel::new(config.email.clone()))
                    as Arc<dyn NotificationChannel>);

        Self::with_parts(
            config,
            accounts,
            subs,
            catalog,
            Arc::new(AutoApproveCharger),
            primary,
            email_copy,
        )
    }

    /// Full dependency injection; tests wire mock channels and chargers here.
    pub fn with_parts(
        config: AppConfig,
        accounts: Arc<dyn AccountStore>,
        subs: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn CatalogStore>,
        charger: Arc<dyn PaymentCharger>,
        primary_channel: Option<Arc<dyn NotificationChannel>>,
        email_copy_channel: Option<Arc<dyn NotificationChannel>>,
    ) -> Self {
        let pool = AccountPool::new(accounts.clone());
        let allocator = SlotAllocator::new(accounts.clone(), catalog.clone(), pool.clone());
        let lifecycle = SubscriptionLifecycle::new(
            subs.clone(),
            accounts.clone(),
            catalog.clone(),
            charger,
            allocator.clone(),
            pool.clone(),
            config.automation.clone(),
        );
        let dispatcher = NotificationDispatcher::new(
            subs.clone(),
            primary_channel,
            email_copy_channel,
            &config.automation,
        );
        let scheduler = RenewalScheduler::new(
            subs.clone(),
            catalog.clone(),
            lifecycle.clone(),
            dispatcher.clone(),
            config.features,
            config.automation.clone(),
        );
        let orders = OrderIntake::new(
            accounts.clone(),
            catalog.clone(),
            lifecycle.clone(),
            allocator.clone(),
            dispatcher.clone(),
            config.features,
        );
        let pricing = ComboPricing::new(catalog.clone());
        let invariants = InvariantChecker::new(accounts, subs.clone(), catalog);

        Self {
            pool,
            allocator,
            lifecycle,
            scheduler,
            dispatcher,
            orders,
            pricing,
            invariants,
            subs,
            retention_days: config.automation.retention_days,
        }
    }

    /// Terminally failed deliveries, for the admin alert surface
    pub async fn failed_notifications(&self) -> EngineResult<Vec<NotificationEvent>> {
        self.subs.list_failed_notifications().await
    }

    /// Purge terminal subscriptions and finished events past the retention
    /// window. Run from the daily cleanup schedule.
    pub async fn run_cleanup(&self, now: OffsetDateTime) -> EngineResult<CleanupSummary> {
        let cutoff = now - time::Duration::days(self.retention_days as i64);
        let subscriptions_purged = self.subs.purge_terminal_subscriptions(cutoff).await?;
        let events_purged = self.subs.purge_notification_events(cutoff).await?;
        tracing::info!(
            subscriptions_purged,
            events_purged,
            retention_days = self.retention_days,
            "Cleanup pass complete"
        );
        Ok(CleanupSummary {
            subscriptions_purged,
            events_purged,
        })
    }
}
