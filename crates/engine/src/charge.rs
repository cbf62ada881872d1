//! Renewal charge delegation
//!
//! Charging is an external collaborator behind a capability trait so the
//! lifecycle depends on a contract, not a gateway. The storefront collects
//! payment out-of-band and confirms orders; the default charger therefore
//! approves every renewal and records a reference for the paid renewal order.

use async_trait::async_trait;
use cuenty_shared::{Plan, Subscription};
use time::Date;

use crate::error::EngineResult;

/// Receipt returned by a successful charge
#[derive(Debug, Clone)]
pub struct ChargeReceipt {
    /// Reference recorded on the renewal attempt
    pub reference: String,
    pub amount_cents: i64,
}

/// Capability contract for the renewal payment collaborator
#[async_trait]
pub trait PaymentCharger: Send + Sync {
    async fn charge(
        &self,
        subscription: &Subscription,
        plan: &Plan,
        cycle_date: Date,
    ) -> EngineResult<ChargeReceipt>;
}

/// Charger for deployments where payment is confirmed out-of-band.
///
/// Every renewal is approved and tagged with a deterministic reference so the
/// storefront can reconcile the paid renewal order later.
#[derive(Debug, Clone, Default)]
pub struct AutoApproveCharger;

#[async_trait]
impl PaymentCharger for AutoApproveCharger {
    async fn charge(
        &self,
        subscription: &Subscription,
        plan: &Plan,
        cycle_date: Date,
    ) -> EngineResult<ChargeReceipt> {
        tracing::info!(
            subscription_id = %subscription.id,
            plan = %plan.name,
            amount_cents = plan.price_cents,
            "Renewal charge approved (out-of-band payment)"
        );
        Ok(ChargeReceipt {
            reference: format!("renewal-{}-{}", subscription.id, cycle_date),
            amount_cents: plan.price_cents,
        })
    }
}
