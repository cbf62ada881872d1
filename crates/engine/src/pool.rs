//! Account pool
//!
//! Tracks every account's slot capacity and which slots are leased. All
//! mutation goes through the store's atomic slot operations; this service adds
//! validation, logging, and the admin-facing snapshot.

use std::sync::Arc;

use cuenty_shared::{AccountCapacity, AccountId, SlotRef, SubscriptionId};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::store::AccountStore;

/// Slot reservation and release over the account inventory
#[derive(Clone)]
pub struct AccountPool {
    accounts: Arc<dyn AccountStore>,
}

impl AccountPool {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self { accounts }
    }

    /// Atomically reserve the first free slot on an account.
    ///
    /// `NoCapacity` tells the caller to pick another account or queue the
    /// order; it is not a fault.
    pub async fn reserve_slot(
        &self,
        account_id: AccountId,
        subscription_id: SubscriptionId,
    ) -> EngineResult<SlotRef> {
        let account = self
            .accounts
            .get_account(account_id)
            .await?
            .ok_or(EngineError::AccountNotFound(account_id))?;

        if !account.active {
            warn!(
                account_id = %account_id,
                "Refusing to reserve slot on deactivated account"
            );
            return Err(EngineError::NoCapacity { account_id });
        }

        match self.accounts.reserve_slot(account_id, subscription_id).await {
            Ok(slot) => {
                info!(
                    account_id = %account_id,
                    slot_index = slot.slot_index,
                    subscription_id = %subscription_id,
                    "Slot reserved"
                );
                Ok(slot)
            }
            Err(EngineError::NoCapacity { .. }) => {
                debug!(account_id = %account_id, "Account at capacity");
                Err(EngineError::NoCapacity { account_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Mark a slot free. Idempotent: releasing an already-free slot is a no-op.
    pub async fn release_slot(&self, slot: &SlotRef) -> EngineResult<()> {
        self.accounts.release_slot(slot).await?;
        info!(
            account_id = %slot.account_id,
            slot_index = slot.slot_index,
            "Slot released"
        );
        Ok(())
    }

    /// Advisory free-slot count. Callers must treat `reserve_slot` as the
    /// authority under concurrency, not this snapshot.
    pub async fn capacity_remaining(&self, account_id: AccountId) -> EngineResult<u32> {
        self.accounts.free_slot_count(account_id).await
    }

    /// Capacity snapshot across all accounts for the admin surface
    pub async fn snapshot(&self) -> EngineResult<Vec<AccountCapacity>> {
        self.accounts.capacity_snapshot().await
    }
}
