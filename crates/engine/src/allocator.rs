//! Slot allocator
//!
//! Places an order's subscription on a suitable account. Tightest-fit packing:
//! among active accounts for the plan's service with at least one free slot,
//! pick the one with the fewest free slots, so partially-empty accounts are
//! filled before fresh ones are touched. Ties break by account creation order
//! (oldest first) for determinism.

use std::sync::Arc;

use cuenty_shared::{AccountId, PlanId, SlotRef, SubscriptionId};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::pool::AccountPool;
use crate::store::{AccountStore, CatalogStore};

#[derive(Clone)]
pub struct SlotAllocator {
    accounts: Arc<dyn AccountStore>,
    catalog: Arc<dyn CatalogStore>,
    pool: AccountPool,
}

impl SlotAllocator {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        catalog: Arc<dyn CatalogStore>,
        pool: AccountPool,
    ) -> Self {
        Self {
            accounts,
            catalog,
            pool,
        }
    }

    /// Find and reserve a slot for the subscription.
    ///
    /// `Exhausted` means every matching account is at capacity; the order
    /// service decides whether to wait, backorder, or fail the sale.
    pub async fn allocate(
        &self,
        plan_id: PlanId,
        subscription_id: SubscriptionId,
        preferred_account: Option<AccountId>,
    ) -> EngineResult<SlotRef> {
        let plan = self
            .catalog
            .get_plan(plan_id)
            .await?
            .ok_or(EngineError::PlanNotFound(plan_id))?;

        // A preferred account (renewal keeping its home) is tried first
        if let Some(account_id) = preferred_account {
            match self.pool.reserve_slot(account_id, subscription_id).await {
                Ok(slot) => return Ok(slot),
                Err(e) if e.is_capacity() => {
                    debug!(account_id = %account_id, "Preferred account full, falling back to search");
                }
                Err(e) => return Err(e),
            }
        }

        let candidates = self.ranked_candidates(&plan.service).await?;
        if candidates.is_empty() {
            info!(service = %plan.service, "No account has free capacity");
            return Err(EngineError::Exhausted {
                service: plan.service,
            });
        }

        // The snapshot may be stale under concurrent orders; reserve_slot is
        // the authority, so walk the ranking until one sticks.
        for account_id in candidates {
            match self.pool.reserve_slot(account_id, subscription_id).await {
                Ok(slot) => return Ok(slot),
                Err(e) if e.is_capacity() => continue,
                Err(e) => return Err(e),
            }
        }

        Err(EngineError::Exhausted {
            service: plan.service,
        })
    }

    /// Active accounts for the service with free capacity, tightest-fit first
    async fn ranked_candidates(&self, service: &str) -> EngineResult<Vec<AccountId>> {
        let accounts = self.accounts.list_accounts_by_service(service).await?;

        // (free_count, arrival_rank) — list order is already oldest-first
        let mut ranked: Vec<(u32, usize, AccountId)> = Vec::new();
        for (rank, account) in accounts.iter().enumerate() {
            if !account.active {
                continue;
            }
            let free = self.accounts.free_slot_count(account.id).await?;
            if free > 0 {
                ranked.push((free, rank, account.id));
            }
        }
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(ranked.into_iter().map(|(_, _, id)| id).collect())
    }
}
