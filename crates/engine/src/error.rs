//! Engine error types

use cuenty_shared::{AccountId, ComboId, PlanId, SubscriptionId, SubscriptionState};
use thiserror::Error;

/// Engine-specific errors
///
/// Capacity exhaustion (`NoCapacity`, `Exhausted`) is an expected outcome the
/// caller recovers from, never a fault. `SlotConflict` is the opposite: a
/// programming-level invariant violation that is rejected outright.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Account {account_id} has no free slot")]
    NoCapacity { account_id: AccountId },

    #[error("All accounts for service {service:?} are at capacity")]
    Exhausted { service: String },

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Plan not found: {0}")]
    PlanNotFound(PlanId),

    #[error("Combo not found: {0}")]
    ComboNotFound(ComboId),

    #[error("Illegal transition from {from} to {to}")]
    InvalidTransition {
        from: SubscriptionState,
        to: SubscriptionState,
    },

    #[error("Slot {slot_index} on account {account_id} is already bound to {occupied_by}")]
    SlotConflict {
        account_id: AccountId,
        slot_index: u32,
        occupied_by: SubscriptionId,
    },

    #[error("Renewal charge declined: {0}")]
    ChargeDeclined(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Scheduler run already in flight")]
    SchedulerBusy,

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}

impl From<cuenty_shared::ConfigError> for EngineError {
    fn from(err: cuenty_shared::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl EngineError {
    /// Expected, recoverable outcomes (queue, pick another account, retry)
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::NoCapacity { .. } | Self::Exhausted { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
