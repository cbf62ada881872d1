//! Postgres store
//!
//! Production implementation of the storage traits. Slot reservation uses a
//! row-locking transaction (`FOR UPDATE SKIP LOCKED`) so concurrent orders on
//! the same account can never claim the same index; lifecycle commits write
//! the subscription and its idempotency records in one transaction.

use async_trait::async_trait;
use cuenty_shared::{
    Account, AccountCapacity, AccountId, Combo, ComboId, ComboLine, NotificationEvent,
    NotificationKind, Plan, PlanId, RenewalAttempt, Slot, SlotRef, Subscription, SubscriptionId,
    SubscriptionState,
};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

use super::{AccountStore, AttemptClaim, CatalogStore, SubscriptionStore};

/// Postgres-backed implementation of all storage traits
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// =============================================================================
// Row Types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    service: String,
    email: String,
    password: String,
    capacity: i32,
    active: bool,
    created_at: OffsetDateTime,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: row.id.into(),
            service: row.service,
            email: row.email,
            password: row.password,
            capacity: row.capacity as u32,
            active: row.active,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SlotRow {
    account_id: Uuid,
    slot_index: i32,
    occupied_by: Option<Uuid>,
    profile_label: Option<String>,
}

impl From<SlotRow> for Slot {
    fn from(row: SlotRow) -> Self {
        Slot {
            account_id: row.account_id.into(),
            slot_index: row.slot_index as u32,
            occupied_by: row.occupied_by.map(Into::into),
            profile_label: row.profile_label,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    customer_id: Uuid,
    plan_id: Uuid,
    order_id: Option<Uuid>,
    slot_account_id: Option<Uuid>,
    slot_index: Option<i32>,
    state: String,
    auto_renew: bool,
    start_date: Option<Date>,
    next_renewal_date: Date,
    renewals_completed: i32,
    contact_phone: Option<String>,
    contact_email: Option<String>,
    cancel_reason: Option<String>,
    cancelled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl SubscriptionRow {
    fn into_subscription(self) -> EngineResult<Subscription> {
        let state: SubscriptionState = self.state.parse().map_err(EngineError::Store)?;
        let slot = match (self.slot_account_id, self.slot_index) {
            (Some(account_id), Some(index)) => Some(SlotRef {
                account_id: account_id.into(),
                slot_index: index as u32,
            }),
            _ => None,
        };
        Ok(Subscription {
            id: self.id.into(),
            customer_id: self.customer_id.into(),
            plan_id: self.plan_id.into(),
            order_id: self.order_id.map(Into::into),
            slot,
            state,
            auto_renew: self.auto_renew,
            start_date: self.start_date,
            next_renewal_date: self.next_renewal_date,
            renewals_completed: self.renewals_completed as u32,
            contact_phone: self.contact_phone,
            contact_email: self.contact_email,
            cancel_reason: self.cancel_reason,
            cancelled_at: self.cancelled_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    subscription_id: Uuid,
    cycle_date: Date,
    status: String,
    retry_count: i32,
    reference: Option<String>,
    error: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl AttemptRow {
    fn into_attempt(self) -> EngineResult<RenewalAttempt> {
        Ok(RenewalAttempt {
            subscription_id: self.subscription_id.into(),
            cycle_date: self.cycle_date,
            status: self.status.parse().map_err(EngineError::Store)?,
            retry_count: self.retry_count as u32,
            reference: self.reference,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    subscription_id: Uuid,
    kind: String,
    cycle_date: Date,
    status: String,
    retry_count: i32,
    last_error: Option<String>,
    message_ref: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl EventRow {
    fn into_event(self) -> EngineResult<NotificationEvent> {
        Ok(NotificationEvent {
            subscription_id: self.subscription_id.into(),
            kind: self.kind.parse().map_err(EngineError::Store)?,
            cycle_date: self.cycle_date,
            status: self.status.parse().map_err(EngineError::Store)?,
            retry_count: self.retry_count as u32,
            last_error: self.last_error,
            message_ref: self.message_ref,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    service: String,
    name: String,
    duration_days: i32,
    price_cents: i64,
    cost_cents: i64,
    active: bool,
    created_at: OffsetDateTime,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: row.id.into(),
            service: row.service,
            name: row.name,
            duration_days: row.duration_days as u32,
            price_cents: row.price_cents,
            cost_cents: row.cost_cents,
            active: row.active,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ComboRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    auto_calculate: bool,
    price_override_cents: Option<i64>,
    cost_override_cents: Option<i64>,
    active: bool,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct ComboItemRow {
    plan_id: Uuid,
    quantity: i32,
}

// =============================================================================
// Write Helpers
// =============================================================================

async fn upsert_attempt(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    attempt: &RenewalAttempt,
) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO renewal_attempts
            (subscription_id, cycle_date, status, retry_count, reference, error, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
        ON CONFLICT (subscription_id, cycle_date) DO UPDATE
        SET status = EXCLUDED.status,
            retry_count = EXCLUDED.retry_count,
            reference = EXCLUDED.reference,
            error = EXCLUDED.error,
            updated_at = NOW()
        "#,
    )
    .bind(attempt.subscription_id.0)
    .bind(attempt.cycle_date)
    .bind(attempt.status.to_string())
    .bind(attempt.retry_count as i32)
    .bind(&attempt.reference)
    .bind(&attempt.error)
    .bind(attempt.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &NotificationEvent,
) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO notification_events
            (subscription_id, kind, cycle_date, status, retry_count, last_error, message_ref, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
        ON CONFLICT (subscription_id, kind, cycle_date) DO UPDATE
        SET status = EXCLUDED.status,
            retry_count = EXCLUDED.retry_count,
            last_error = EXCLUDED.last_error,
            message_ref = EXCLUDED.message_ref,
            updated_at = NOW()
        "#,
    )
    .bind(event.subscription_id.0)
    .bind(event.kind.to_string())
    .bind(event.cycle_date)
    .bind(event.status.to_string())
    .bind(event.retry_count as i32)
    .bind(&event.last_error)
    .bind(&event.message_ref)
    .bind(event.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// =============================================================================
// AccountStore
// =============================================================================

#[async_trait]
impl AccountStore for PgStore {
    async fn insert_account(&self, account: Account) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO accounts (id, service, email, password, capacity, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(account.id.0)
        .bind(&account.service)
        .bind(&account.email)
        .bind(&account.password)
        .bind(account.capacity as i32)
        .bind(account.active)
        .bind(account.created_at)
        .execute(&mut *tx)
        .await?;

        // Slot rows are created together with the account
        for index in 0..account.capacity {
            sqlx::query(
                r#"
                INSERT INTO account_slots (account_id, slot_index, occupied_by, profile_label)
                VALUES ($1, $2, NULL, $3)
                "#,
            )
            .bind(account.id.0)
            .bind(index as i32)
            .bind(format!("Profile {}", index + 1))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_account(&self, id: AccountId) -> EngineResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT id, service, email, password, capacity, active, created_at FROM accounts WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_accounts(&self) -> EngineResult<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(
            "SELECT id, service, email, password, capacity, active, created_at FROM accounts ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_accounts_by_service(&self, service: &str) -> EngineResult<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, service, email, password, capacity, active, created_at
            FROM accounts
            WHERE service = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(service)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn set_account_active(&self, id: AccountId, active: bool) -> EngineResult<()> {
        let result = sqlx::query("UPDATE accounts SET active = $2 WHERE id = $1")
            .bind(id.0)
            .bind(active)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::AccountNotFound(id));
        }
        Ok(())
    }

    async fn reserve_slot(
        &self,
        account_id: AccountId,
        subscription_id: SubscriptionId,
    ) -> EngineResult<SlotRef> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM accounts WHERE id = $1")
            .bind(account_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(EngineError::AccountNotFound(account_id));
        }

        // SKIP LOCKED keeps concurrent reservations on the same account from
        // contending on the same row; each claims a distinct free index.
        let index: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT slot_index FROM account_slots
            WHERE account_id = $1 AND occupied_by IS NULL
            ORDER BY slot_index
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(account_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(index) = index else {
            return Err(EngineError::NoCapacity { account_id });
        };

        let updated = sqlx::query(
            r#"
            UPDATE account_slots SET occupied_by = $3
            WHERE account_id = $1 AND slot_index = $2 AND occupied_by IS NULL
            "#,
        )
        .bind(account_id.0)
        .bind(index)
        .bind(subscription_id.0)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // The guarded UPDATE found the slot taken after the locked SELECT
            // handed it to us: a double-reservation attempt. Fail closed.
            let occupied_by: Option<Uuid> = sqlx::query_scalar(
                "SELECT occupied_by FROM account_slots WHERE account_id = $1 AND slot_index = $2",
            )
            .bind(account_id.0)
            .bind(index)
            .fetch_one(&mut *tx)
            .await?;
            return Err(match occupied_by {
                Some(holder) => {
                    tracing::error!(
                        account_id = %account_id,
                        slot_index = index,
                        occupied_by = %holder,
                        "Rejected double-reservation of slot"
                    );
                    EngineError::SlotConflict {
                        account_id,
                        slot_index: index as u32,
                        occupied_by: holder.into(),
                    }
                }
                None => EngineError::NoCapacity { account_id },
            });
        }

        tx.commit().await?;
        Ok(SlotRef {
            account_id,
            slot_index: index as u32,
        })
    }

    async fn release_slot(&self, slot: &SlotRef) -> EngineResult<()> {
        sqlx::query(
            "UPDATE account_slots SET occupied_by = NULL WHERE account_id = $1 AND slot_index = $2",
        )
        .bind(slot.account_id.0)
        .bind(slot.slot_index as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn free_slot_count(&self, account_id: AccountId) -> EngineResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM account_slots WHERE account_id = $1 AND occupied_by IS NULL",
        )
        .bind(account_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn list_slots(&self, account_id: AccountId) -> EngineResult<Vec<Slot>> {
        let rows: Vec<SlotRow> = sqlx::query_as(
            r#"
            SELECT account_id, slot_index, occupied_by, profile_label
            FROM account_slots
            WHERE account_id = $1
            ORDER BY slot_index
            "#,
        )
        .bind(account_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn capacity_snapshot(&self) -> EngineResult<Vec<AccountCapacity>> {
        #[derive(sqlx::FromRow)]
        struct SnapshotRow {
            account_id: Uuid,
            service: String,
            capacity: i32,
            occupied: i64,
            active: bool,
        }

        let rows: Vec<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT a.id AS account_id, a.service, a.capacity, a.active,
                   COUNT(s.occupied_by) AS occupied
            FROM accounts a
            LEFT JOIN account_slots s ON s.account_id = a.id AND s.occupied_by IS NOT NULL
            GROUP BY a.id
            ORDER BY a.service, a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| AccountCapacity {
                account_id: r.account_id.into(),
                service: r.service,
                capacity: r.capacity as u32,
                occupied: r.occupied as u32,
                active: r.active,
            })
            .collect())
    }
}

// =============================================================================
// SubscriptionStore
// =============================================================================

const SUB_COLUMNS: &str = "id, customer_id, plan_id, order_id, slot_account_id, slot_index, \
     state, auto_renew, start_date, next_renewal_date, renewals_completed, \
     contact_phone, contact_email, cancel_reason, cancelled_at, created_at, updated_at";

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn insert_subscription(&self, sub: Subscription) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, customer_id, plan_id, order_id, slot_account_id, slot_index,
                 state, auto_renew, start_date, next_renewal_date, renewals_completed,
                 contact_phone, contact_email, cancel_reason, cancelled_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(sub.id.0)
        .bind(sub.customer_id.0)
        .bind(sub.plan_id.0)
        .bind(sub.order_id.map(|o| o.0))
        .bind(sub.slot.map(|s| s.account_id.0))
        .bind(sub.slot.map(|s| s.slot_index as i32))
        .bind(sub.state.to_string())
        .bind(sub.auto_renew)
        .bind(sub.start_date)
        .bind(sub.next_renewal_date)
        .bind(sub.renewals_completed as i32)
        .bind(&sub.contact_phone)
        .bind(&sub.contact_email)
        .bind(&sub.cancel_reason)
        .bind(sub.cancelled_at)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_subscription(&self, id: SubscriptionId) -> EngineResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUB_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn list_subscriptions(&self) -> EngineResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions ORDER BY created_at, id",
            SUB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SubscriptionRow::into_subscription).collect()
    }

    async fn list_by_states(
        &self,
        states: &[SubscriptionState],
    ) -> EngineResult<Vec<Subscription>> {
        let names: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE state = ANY($1) ORDER BY created_at, id",
            SUB_COLUMNS
        ))
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SubscriptionRow::into_subscription).collect()
    }

    async fn commit_transition(
        &self,
        sub: &Subscription,
        attempt: Option<&RenewalAttempt>,
        event: Option<&NotificationEvent>,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET slot_account_id = $2, slot_index = $3, state = $4, auto_renew = $5,
                start_date = $6, next_renewal_date = $7, renewals_completed = $8,
                cancel_reason = $9, cancelled_at = $10, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sub.id.0)
        .bind(sub.slot.map(|s| s.account_id.0))
        .bind(sub.slot.map(|s| s.slot_index as i32))
        .bind(sub.state.to_string())
        .bind(sub.auto_renew)
        .bind(sub.start_date)
        .bind(sub.next_renewal_date)
        .bind(sub.renewals_completed as i32)
        .bind(&sub.cancel_reason)
        .bind(sub.cancelled_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(EngineError::SubscriptionNotFound(sub.id));
        }

        if let Some(attempt) = attempt {
            upsert_attempt(&mut tx, attempt).await?;
        }
        if let Some(event) = event {
            upsert_event(&mut tx, event).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn claim_renewal_attempt(
        &self,
        id: SubscriptionId,
        cycle_date: Date,
    ) -> EngineResult<AttemptClaim> {
        let attempt = RenewalAttempt::scheduled(id, cycle_date);

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO renewal_attempts
                (subscription_id, cycle_date, status, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, 0, $4, $4)
            ON CONFLICT (subscription_id, cycle_date) DO NOTHING
            RETURNING subscription_id
            "#,
        )
        .bind(id.0)
        .bind(cycle_date)
        .bind(attempt.status.to_string())
        .bind(attempt.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(AttemptClaim::Claimed(attempt));
        }

        let existing = self
            .get_renewal_attempt(id, cycle_date)
            .await?
            .ok_or_else(|| EngineError::Store("attempt vanished after conflict".to_string()))?;
        Ok(AttemptClaim::Existing(existing))
    }

    async fn get_renewal_attempt(
        &self,
        id: SubscriptionId,
        cycle_date: Date,
    ) -> EngineResult<Option<RenewalAttempt>> {
        let row: Option<AttemptRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, cycle_date, status, retry_count, reference, error, created_at, updated_at
            FROM renewal_attempts
            WHERE subscription_id = $1 AND cycle_date = $2
            "#,
        )
        .bind(id.0)
        .bind(cycle_date)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AttemptRow::into_attempt).transpose()
    }

    async fn get_notification_event(
        &self,
        id: SubscriptionId,
        kind: NotificationKind,
        cycle_date: Date,
    ) -> EngineResult<Option<NotificationEvent>> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, kind, cycle_date, status, retry_count, last_error, message_ref, created_at, updated_at
            FROM notification_events
            WHERE subscription_id = $1 AND kind = $2 AND cycle_date = $3
            "#,
        )
        .bind(id.0)
        .bind(kind.to_string())
        .bind(cycle_date)
        .fetch_optional(&self.pool)
        .await?;
        row.map(EventRow::into_event).transpose()
    }

    async fn upsert_notification_event(&self, event: &NotificationEvent) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        upsert_event(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_failed_notifications(&self) -> EngineResult<Vec<NotificationEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, kind, cycle_date, status, retry_count, last_error, message_ref, created_at, updated_at
            FROM notification_events
            WHERE status = 'failed'
            ORDER BY updated_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn purge_terminal_subscriptions(&self, cutoff: OffsetDateTime) -> EngineResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM renewal_attempts ra
            USING subscriptions s
            WHERE ra.subscription_id = s.id
              AND s.state IN ('expired', 'cancelled')
              AND s.updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM notification_events ne
            USING subscriptions s
            WHERE ne.subscription_id = s.id
              AND s.state IN ('expired', 'cancelled')
              AND s.updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM subscriptions
            WHERE state IN ('expired', 'cancelled') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected())
    }

    async fn purge_notification_events(&self, cutoff: OffsetDateTime) -> EngineResult<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM notification_events
            WHERE status IN ('succeeded', 'failed') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(deleted.rows_affected())
    }
}

// =============================================================================
// CatalogStore
// =============================================================================

#[async_trait]
impl CatalogStore for PgStore {
    async fn insert_plan(&self, plan: Plan) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plans (id, service, name, duration_days, price_cents, cost_cents, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(plan.id.0)
        .bind(&plan.service)
        .bind(&plan.name)
        .bind(plan.duration_days as i32)
        .bind(plan.price_cents)
        .bind(plan.cost_cents)
        .bind(plan.active)
        .bind(plan.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_plan(&self, id: PlanId) -> EngineResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            "SELECT id, service, name, duration_days, price_cents, cost_cents, active, created_at FROM plans WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_plans(&self) -> EngineResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            "SELECT id, service, name, duration_days, price_cents, cost_cents, active, created_at FROM plans ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_combo(&self, combo: Combo) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO combos
                (id, name, description, auto_calculate, price_override_cents, cost_override_cents, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(combo.id.0)
        .bind(&combo.name)
        .bind(&combo.description)
        .bind(combo.auto_calculate)
        .bind(combo.price_override_cents)
        .bind(combo.cost_override_cents)
        .bind(combo.active)
        .bind(combo.created_at)
        .execute(&mut *tx)
        .await?;

        for line in &combo.lines {
            sqlx::query(
                "INSERT INTO combo_items (combo_id, plan_id, quantity) VALUES ($1, $2, $3)",
            )
            .bind(combo.id.0)
            .bind(line.plan_id.0)
            .bind(line.quantity as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_combo(&self, id: ComboId) -> EngineResult<Option<Combo>> {
        let row: Option<ComboRow> = sqlx::query_as(
            r#"
            SELECT id, name, description, auto_calculate, price_override_cents, cost_override_cents, active, created_at
            FROM combos WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let items: Vec<ComboItemRow> = sqlx::query_as(
            "SELECT plan_id, quantity FROM combo_items WHERE combo_id = $1 ORDER BY plan_id",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Combo {
            id: row.id.into(),
            name: row.name,
            description: row.description,
            lines: items
                .into_iter()
                .map(|i| ComboLine {
                    plan_id: i.plan_id.into(),
                    quantity: i.quantity as u32,
                })
                .collect(),
            auto_calculate: row.auto_calculate,
            price_override_cents: row.price_override_cents,
            cost_override_cents: row.cost_override_cents,
            active: row.active,
            created_at: row.created_at,
        }))
    }

    async fn list_combos(&self) -> EngineResult<Vec<Combo>> {
        let rows: Vec<ComboRow> = sqlx::query_as(
            r#"
            SELECT id, name, description, auto_calculate, price_override_cents, cost_override_cents, active, created_at
            FROM combos ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut combos = Vec::with_capacity(rows.len());
        for row in rows {
            let items: Vec<ComboItemRow> = sqlx::query_as(
                "SELECT plan_id, quantity FROM combo_items WHERE combo_id = $1 ORDER BY plan_id",
            )
            .bind(row.id)
            .fetch_all(&self.pool)
            .await?;
            combos.push(Combo {
                id: row.id.into(),
                name: row.name,
                description: row.description,
                lines: items
                    .into_iter()
                    .map(|i| ComboLine {
                        plan_id: i.plan_id.into(),
                        quantity: i.quantity as u32,
                    })
                    .collect(),
                auto_calculate: row.auto_calculate,
                price_override_cents: row.price_override_cents,
                cost_override_cents: row.cost_override_cents,
                active: row.active,
                created_at: row.created_at,
            });
        }
        Ok(combos)
    }
}
