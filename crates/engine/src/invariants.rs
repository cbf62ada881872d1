//! Engine Invariants Module
//!
//! Provides runnable consistency checks over the engine's stores. These can
//! be run after any mutation or scheduler pass to ensure the system is in a
//! valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real query over the stores
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers the capacity and binding rules the engine lives by

use std::collections::HashMap;
use std::sync::Arc;

use cuenty_shared::SubscriptionId;
use serde::Serialize;
use time::OffsetDateTime;

use crate::combos::computed_totals;
use crate::error::EngineResult;
use crate::store::{AccountStore, CatalogStore, SubscriptionStore};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// Critical - slots may be double-booked or capacity exceeded
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Service for running engine invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    accounts: Arc<dyn AccountStore>,
    subs: Arc<dyn SubscriptionStore>,
    catalog: Arc<dyn CatalogStore>,
}

impl InvariantChecker {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        subs: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            accounts,
            subs,
            catalog,
        }
    }

    /// Run all invariant checks and return a summary
    pub async fn run_all_checks(&self) -> EngineResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_capacity_respected().await?);
        violations.extend(self.check_slot_binding_consistent().await?);
        violations.extend(self.check_live_subscription_has_slot().await?);
        violations.extend(self.check_terminal_subscription_has_no_slot().await?);
        violations.extend(self.check_combo_totals_match().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: occupied slots never exceed capacity
    async fn check_capacity_respected(&self) -> EngineResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for account in self.accounts.list_accounts().await? {
            let slots = self.accounts.list_slots(account.id).await?;
            let occupied = slots.iter().filter(|s| s.occupied_by.is_some()).count();
            if occupied as u32 > account.capacity {
                violations.push(InvariantViolation {
                    invariant: "capacity_respected".to_string(),
                    description: format!(
                        "Account {} has {} occupied slots but capacity {}",
                        account.id, occupied, account.capacity
                    ),
                    context: serde_json::json!({
                        "account_id": account.id,
                        "occupied": occupied,
                        "capacity": account.capacity,
                    }),
                    severity: ViolationSeverity::Critical,
                });
            }
        }
        Ok(violations)
    }

    /// Invariant 2: slot bindings and subscription slot references agree both
    /// ways, and no subscription holds two slots
    async fn check_slot_binding_consistent(&self) -> EngineResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        let subs = self.subs.list_subscriptions().await?;
        let by_id: HashMap<SubscriptionId, _> = subs.iter().map(|s| (s.id, s)).collect();
        let mut slots_per_sub: HashMap<SubscriptionId, u32> = HashMap::new();

        for account in self.accounts.list_accounts().await? {
            for slot in self.accounts.list_slots(account.id).await? {
                let Some(holder) = slot.occupied_by else {
                    continue;
                };
                *slots_per_sub.entry(holder).or_default() += 1;

                let matches_back = by_id.get(&holder).and_then(|s| s.slot).is_some_and(|r| {
                    r.account_id == slot.account_id && r.slot_index == slot.slot_index
                });
                if !matches_back {
                    violations.push(InvariantViolation {
                        invariant: "slot_binding_consistent".to_string(),
                        description: format!(
                            "Slot {}/{} is bound to {} but that subscription does not reference it",
                            slot.account_id, slot.slot_index, holder
                        ),
                        context: serde_json::json!({
                            "account_id": slot.account_id,
                            "slot_index": slot.slot_index,
                            "occupied_by": holder,
                        }),
                        severity: ViolationSeverity::Critical,
                    });
                }
            }
        }

        for (sub_id, count) in slots_per_sub {
            if count > 1 {
                violations.push(InvariantViolation {
                    invariant: "slot_binding_consistent".to_string(),
                    description: format!("Subscription {} holds {} slots (expected 1)", sub_id, count),
                    context: serde_json::json!({
                        "subscription_id": sub_id,
                        "slot_count": count,
                    }),
                    severity: ViolationSeverity::Critical,
                });
            }
        }
        Ok(violations)
    }

    /// Invariant 3: Active/Grace/Paused subscriptions hold a slot
    async fn check_live_subscription_has_slot(&self) -> EngineResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for sub in self.subs.list_subscriptions().await? {
            if sub.state.holds_slot() && sub.slot.is_none() {
                violations.push(InvariantViolation {
                    invariant: "live_subscription_has_slot".to_string(),
                    description: format!(
                        "Subscription {} is {} but holds no slot",
                        sub.id, sub.state
                    ),
                    context: serde_json::json!({
                        "subscription_id": sub.id,
                        "state": sub.state.to_string(),
                    }),
                    severity: ViolationSeverity::High,
                });
            }
        }
        Ok(violations)
    }

    /// Invariant 4: terminal subscriptions hold no slot
    async fn check_terminal_subscription_has_no_slot(
        &self,
    ) -> EngineResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for sub in self.subs.list_subscriptions().await? {
            if sub.state.is_terminal() && sub.slot.is_some() {
                violations.push(InvariantViolation {
                    invariant: "terminal_subscription_has_no_slot".to_string(),
                    description: format!(
                        "Subscription {} is {} but still references a slot",
                        sub.id, sub.state
                    ),
                    context: serde_json::json!({
                        "subscription_id": sub.id,
                        "state": sub.state.to_string(),
                    }),
                    severity: ViolationSeverity::High,
                });
            }
        }
        Ok(violations)
    }

    /// Invariant 5: auto-calculated combo totals equal the sum of their lines
    async fn check_combo_totals_match(&self) -> EngineResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        let plans = self.catalog.list_plans().await?;
        for combo in self.catalog.list_combos().await? {
            if !combo.auto_calculate {
                continue;
            }
            // Overrides present on an auto-calculated combo that disagree with
            // the computed sums indicate a client-driven write went around the
            // pricing rule.
            let Ok((price, cost)) = computed_totals(&combo, &plans) else {
                violations.push(InvariantViolation {
                    invariant: "combo_totals_match".to_string(),
                    description: format!("Combo {} references a missing plan", combo.id),
                    context: serde_json::json!({ "combo_id": combo.id }),
                    severity: ViolationSeverity::High,
                });
                continue;
            };
            let price_ok = combo.price_override_cents.map(|p| p == price).unwrap_or(true);
            let cost_ok = combo.cost_override_cents.map(|c| c == cost).unwrap_or(true);
            if !price_ok || !cost_ok {
                violations.push(InvariantViolation {
                    invariant: "combo_totals_match".to_string(),
                    description: format!(
                        "Combo {} is auto-calculated but carries overrides that disagree with its lines",
                        combo.id
                    ),
                    context: serde_json::json!({
                        "combo_id": combo.id,
                        "computed_price_cents": price,
                        "computed_cost_cents": cost,
                        "price_override_cents": combo.price_override_cents,
                        "cost_override_cents": combo.cost_override_cents,
                    }),
                    severity: ViolationSeverity::Medium,
                });
            }
        }
        Ok(violations)
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "capacity_respected",
            "slot_binding_consistent",
            "live_subscription_has_slot",
            "terminal_subscription_has_no_slot",
            "combo_totals_match",
        ]
    }
}
