//! Order intake
//!
//! Entry point for the external order/payment subsystem: a confirmed-paid
//! order creates a subscription, gets a slot through the tightest-fit search,
//! and receives its credentials over the messaging channel. When the
//! assignment gate is off (or capacity is exhausted) the subscription stays
//! Pending for manual handling; the sale itself is never lost here.

use std::sync::Arc;

use cuenty_shared::{
    CustomerId, FeatureGate, NotificationKind, OrderId, PlanId, SlotRef, SubscriptionId,
};
use serde::Serialize;
use time::Date;
use tracing::{info, warn};

use crate::allocator::SlotAllocator;
use crate::channels::{CredentialBundle, NotificationPayload};
use crate::dispatcher::{DeliveryOutcome, NotificationDispatcher};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{NewSubscription, SubscriptionLifecycle};
use crate::store::{AccountStore, CatalogStore};

/// A confirmed-paid order, as reported by the external order subsystem
#[derive(Debug, Clone)]
pub struct PaidOrder {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub plan_id: PlanId,
    pub auto_renew: bool,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
}

/// What happened to a confirmed order
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignmentOutcome {
    /// Slot reserved, subscription active, credentials dispatched
    Assigned {
        subscription_id: SubscriptionId,
        slot: SlotRef,
        credentials_delivered: bool,
    },
    /// Subscription created but waiting for manual assignment
    Queued {
        subscription_id: SubscriptionId,
        reason: String,
    },
}

#[derive(Clone)]
pub struct OrderIntake {
    accounts: Arc<dyn AccountStore>,
    catalog: Arc<dyn CatalogStore>,
    lifecycle: SubscriptionLifecycle,
    allocator: SlotAllocator,
    dispatcher: NotificationDispatcher,
    gate: FeatureGate,
}

impl OrderIntake {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        catalog: Arc<dyn CatalogStore>,
        lifecycle: SubscriptionLifecycle,
        allocator: SlotAllocator,
        dispatcher: NotificationDispatcher,
        gate: FeatureGate,
    ) -> Self {
        Self {
            accounts,
            catalog,
            lifecycle,
            allocator,
            dispatcher,
            gate,
        }
    }

    /// Handle a confirmed-paid order end to end.
    pub async fn confirm_order_paid(
        &self,
        order: PaidOrder,
        today: Date,
    ) -> EngineResult<AssignmentOutcome> {
        let sub = self
            .lifecycle
            .create_pending(
                NewSubscription {
                    customer_id: order.customer_id,
                    plan_id: order.plan_id,
                    order_id: Some(order.order_id),
                    auto_renew: order.auto_renew,
                    contact_phone: order.contact_phone,
                    contact_email: order.contact_email,
                },
                today,
            )
            .await?;

        if !self.gate.auto_assignment {
            info!(
                order_id = %order.order_id,
                subscription_id = %sub.id,
                "Auto-assignment disabled; order queued for manual assignment"
            );
            return Ok(AssignmentOutcome::Queued {
                subscription_id: sub.id,
                reason: "auto-assignment disabled".to_string(),
            });
        }

        let slot = match self.allocator.allocate(order.plan_id, sub.id, None).await {
            Ok(slot) => slot,
            Err(e) if e.is_capacity() => {
                warn!(
                    order_id = %order.order_id,
                    subscription_id = %sub.id,
                    "No capacity for paid order; queued for backorder"
                );
                return Ok(AssignmentOutcome::Queued {
                    subscription_id: sub.id,
                    reason: "all accounts at capacity".to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let sub = self.lifecycle.activate(sub.id, slot, today).await?;

        let credentials_delivered = if self.gate.auto_notifications {
            let payload = self.credential_payload(&sub, slot).await?;
            matches!(
                self.dispatcher
                    .send(sub.id, NotificationKind::CredentialDelivery, today, payload)
                    .await?,
                DeliveryOutcome::Delivered { .. } | DeliveryOutcome::AlreadyDelivered
            )
        } else {
            info!(
                subscription_id = %sub.id,
                "Auto-notifications disabled; credentials must be delivered manually"
            );
            false
        };

        Ok(AssignmentOutcome::Assigned {
            subscription_id: sub.id,
            slot,
            credentials_delivered,
        })
    }

    async fn credential_payload(
        &self,
        sub: &cuenty_shared::Subscription,
        slot: SlotRef,
    ) -> EngineResult<NotificationPayload> {
        let account = self
            .accounts
            .get_account(slot.account_id)
            .await?
            .ok_or(EngineError::AccountNotFound(slot.account_id))?;
        let plan = self
            .catalog
            .get_plan(sub.plan_id)
            .await?
            .ok_or(EngineError::PlanNotFound(sub.plan_id))?;
        let profile_label = self
            .accounts
            .list_slots(slot.account_id)
            .await?
            .into_iter()
            .find(|s| s.slot_index == slot.slot_index)
            .and_then(|s| s.profile_label);

        Ok(NotificationPayload {
            service: plan.service,
            plan: plan.name,
            recipient_phone: sub.contact_phone.clone(),
            recipient_email: sub.contact_email.clone(),
            expires_on: sub.next_renewal_date,
            days_remaining: None,
            credentials: Some(CredentialBundle {
                account_email: account.email,
                account_password: account.password,
                profile_label,
            }),
        })
    }
}
