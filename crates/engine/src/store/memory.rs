//! In-memory store
//!
//! Backs the test suite and local development runs. All state lives behind a
//! single async mutex, which serializes slot reservations and lifecycle
//! commits; the Postgres implementation achieves the same guarantees with
//! row-locking transactions.

use std::collections::HashMap;

use async_trait::async_trait;
use cuenty_shared::{
    Account, AccountCapacity, AccountId, Combo, ComboId, NotificationEvent, NotificationKind,
    NotificationStatus, Plan, PlanId, RenewalAttempt, Slot, SlotRef, Subscription, SubscriptionId,
    SubscriptionState,
};
use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;

use crate::error::{EngineError, EngineResult};

use super::{AccountStore, AttemptClaim, CatalogStore, SubscriptionStore};

#[derive(Debug, Clone)]
struct SlotCell {
    occupied_by: Option<SubscriptionId>,
    profile_label: String,
}

#[derive(Default)]
struct MemoryInner {
    accounts: HashMap<AccountId, Account>,
    slots: HashMap<AccountId, Vec<SlotCell>>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    attempts: HashMap<(SubscriptionId, Date), RenewalAttempt>,
    events: HashMap<(SubscriptionId, NotificationKind, Date), NotificationEvent>,
    plans: HashMap<PlanId, Plan>,
    combos: HashMap<ComboId, Combo>,
}

/// In-memory implementation of all storage traits
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn insert_account(&self, account: Account) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let cells = (0..account.capacity)
            .map(|i| SlotCell {
                occupied_by: None,
                profile_label: format!("Profile {}", i + 1),
            })
            .collect();
        inner.slots.insert(account.id, cells);
        inner.accounts.insert(account.id, account);
        Ok(())
    }

    async fn get_account(&self, id: AccountId) -> EngineResult<Option<Account>> {
        Ok(self.inner.lock().await.accounts.get(&id).cloned())
    }

    async fn list_accounts(&self) -> EngineResult<Vec<Account>> {
        let inner = self.inner.lock().await;
        let mut accounts: Vec<_> = inner.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(accounts)
    }

    async fn list_accounts_by_service(&self, service: &str) -> EngineResult<Vec<Account>> {
        let inner = self.inner.lock().await;
        let mut accounts: Vec<_> = inner
            .accounts
            .values()
            .filter(|a| a.service == service)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(accounts)
    }

    async fn set_account_active(&self, id: AccountId, active: bool) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let account = inner
            .accounts
            .get_mut(&id)
            .ok_or(EngineError::AccountNotFound(id))?;
        account.active = active;
        Ok(())
    }

    async fn reserve_slot(
        &self,
        account_id: AccountId,
        subscription_id: SubscriptionId,
    ) -> EngineResult<SlotRef> {
        let mut inner = self.inner.lock().await;
        if !inner.accounts.contains_key(&account_id) {
            return Err(EngineError::AccountNotFound(account_id));
        }
        let cells = inner
            .slots
            .get_mut(&account_id)
            .ok_or(EngineError::AccountNotFound(account_id))?;

        let Some(index) = cells.iter().position(|c| c.occupied_by.is_none()) else {
            return Err(EngineError::NoCapacity { account_id });
        };
        cells[index].occupied_by = Some(subscription_id);

        Ok(SlotRef {
            account_id,
            slot_index: index as u32,
        })
    }

    async fn release_slot(&self, slot: &SlotRef) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let cells = inner
            .slots
            .get_mut(&slot.account_id)
            .ok_or(EngineError::AccountNotFound(slot.account_id))?;
        if let Some(cell) = cells.get_mut(slot.slot_index as usize) {
            // Idempotent: releasing a free slot is a no-op
            cell.occupied_by = None;
        }
        Ok(())
    }

    async fn free_slot_count(&self, account_id: AccountId) -> EngineResult<u32> {
        let inner = self.inner.lock().await;
        let cells = inner
            .slots
            .get(&account_id)
            .ok_or(EngineError::AccountNotFound(account_id))?;
        Ok(cells.iter().filter(|c| c.occupied_by.is_none()).count() as u32)
    }

    async fn list_slots(&self, account_id: AccountId) -> EngineResult<Vec<Slot>> {
        let inner = self.inner.lock().await;
        let cells = inner
            .slots
            .get(&account_id)
            .ok_or(EngineError::AccountNotFound(account_id))?;
        Ok(cells
            .iter()
            .enumerate()
            .map(|(i, c)| Slot {
                account_id,
                slot_index: i as u32,
                occupied_by: c.occupied_by,
                profile_label: Some(c.profile_label.clone()),
            })
            .collect())
    }

    async fn capacity_snapshot(&self) -> EngineResult<Vec<AccountCapacity>> {
        let inner = self.inner.lock().await;
        let mut snapshot: Vec<_> = inner
            .accounts
            .values()
            .map(|account| {
                let occupied = inner
                    .slots
                    .get(&account.id)
                    .map(|cells| cells.iter().filter(|c| c.occupied_by.is_some()).count())
                    .unwrap_or(0);
                AccountCapacity {
                    account_id: account.id,
                    service: account.service.clone(),
                    capacity: account.capacity,
                    occupied: occupied as u32,
                    active: account.active,
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.service.cmp(&b.service).then(a.account_id.cmp(&b.account_id)));
        Ok(snapshot)
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn insert_subscription(&self, sub: Subscription) -> EngineResult<()> {
        self.inner.lock().await.subscriptions.insert(sub.id, sub);
        Ok(())
    }

    async fn get_subscription(&self, id: SubscriptionId) -> EngineResult<Option<Subscription>> {
        Ok(self.inner.lock().await.subscriptions.get(&id).cloned())
    }

    async fn list_subscriptions(&self) -> EngineResult<Vec<Subscription>> {
        let inner = self.inner.lock().await;
        let mut subs: Vec<_> = inner.subscriptions.values().cloned().collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(subs)
    }

    async fn list_by_states(
        &self,
        states: &[SubscriptionState],
    ) -> EngineResult<Vec<Subscription>> {
        let inner = self.inner.lock().await;
        let mut subs: Vec<_> = inner
            .subscriptions
            .values()
            .filter(|s| states.contains(&s.state))
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(subs)
    }

    async fn commit_transition(
        &self,
        sub: &Subscription,
        attempt: Option<&RenewalAttempt>,
        event: Option<&NotificationEvent>,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.subscriptions.contains_key(&sub.id) {
            return Err(EngineError::SubscriptionNotFound(sub.id));
        }
        inner.subscriptions.insert(sub.id, sub.clone());
        if let Some(attempt) = attempt {
            inner
                .attempts
                .insert((attempt.subscription_id, attempt.cycle_date), attempt.clone());
        }
        if let Some(event) = event {
            inner.events.insert(
                (event.subscription_id, event.kind, event.cycle_date),
                event.clone(),
            );
        }
        Ok(())
    }

    async fn claim_renewal_attempt(
        &self,
        id: SubscriptionId,
        cycle_date: Date,
    ) -> EngineResult<AttemptClaim> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.attempts.get(&(id, cycle_date)) {
            return Ok(AttemptClaim::Existing(existing.clone()));
        }
        let attempt = RenewalAttempt::scheduled(id, cycle_date);
        inner.attempts.insert((id, cycle_date), attempt.clone());
        Ok(AttemptClaim::Claimed(attempt))
    }

    async fn get_renewal_attempt(
        &self,
        id: SubscriptionId,
        cycle_date: Date,
    ) -> EngineResult<Option<RenewalAttempt>> {
        Ok(self.inner.lock().await.attempts.get(&(id, cycle_date)).cloned())
    }

    async fn get_notification_event(
        &self,
        id: SubscriptionId,
        kind: NotificationKind,
        cycle_date: Date,
    ) -> EngineResult<Option<NotificationEvent>> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .get(&(id, kind, cycle_date))
            .cloned())
    }

    async fn upsert_notification_event(&self, event: &NotificationEvent) -> EngineResult<()> {
        self.inner.lock().await.events.insert(
            (event.subscription_id, event.kind, event.cycle_date),
            event.clone(),
        );
        Ok(())
    }

    async fn list_failed_notifications(&self) -> EngineResult<Vec<NotificationEvent>> {
        let inner = self.inner.lock().await;
        let mut failed: Vec<_> = inner
            .events
            .values()
            .filter(|e| e.status == NotificationStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(failed)
    }

    async fn purge_terminal_subscriptions(&self, cutoff: OffsetDateTime) -> EngineResult<u64> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<SubscriptionId> = inner
            .subscriptions
            .values()
            .filter(|s| s.state.is_terminal() && s.updated_at < cutoff)
            .map(|s| s.id)
            .collect();
        for id in &doomed {
            inner.subscriptions.remove(id);
            inner.attempts.retain(|(sub_id, _), _| sub_id != id);
            inner.events.retain(|(sub_id, _, _), _| sub_id != id);
        }
        Ok(doomed.len() as u64)
    }

    async fn purge_notification_events(&self, cutoff: OffsetDateTime) -> EngineResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.events.len();
        inner
            .events
            .retain(|_, e| e.status == NotificationStatus::Pending || e.updated_at >= cutoff);
        Ok((before - inner.events.len()) as u64)
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn insert_plan(&self, plan: Plan) -> EngineResult<()> {
        self.inner.lock().await.plans.insert(plan.id, plan);
        Ok(())
    }

    async fn get_plan(&self, id: PlanId) -> EngineResult<Option<Plan>> {
        Ok(self.inner.lock().await.plans.get(&id).cloned())
    }

    async fn list_plans(&self) -> EngineResult<Vec<Plan>> {
        let inner = self.inner.lock().await;
        let mut plans: Vec<_> = inner.plans.values().cloned().collect();
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(plans)
    }

    async fn insert_combo(&self, combo: Combo) -> EngineResult<()> {
        self.inner.lock().await.combos.insert(combo.id, combo);
        Ok(())
    }

    async fn get_combo(&self, id: ComboId) -> EngineResult<Option<Combo>> {
        Ok(self.inner.lock().await.combos.get(&id).cloned())
    }

    async fn list_combos(&self) -> EngineResult<Vec<Combo>> {
        let inner = self.inner.lock().await;
        let mut combos: Vec<_> = inner.combos.values().cloned().collect();
        combos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(combos)
    }
}
