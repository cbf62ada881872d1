//! Combo pricing
//!
//! A combo aggregates `(plan, quantity)` lines. With auto-calculate on, its
//! totals are always the sum of the constituent lines; an explicit override
//! wins otherwise. The breakdown feeds the admin/reporting surface.

use std::sync::Arc;

use cuenty_shared::{Combo, ComboId, Plan, PlanId};
use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::store::CatalogStore;

/// One line of a combo price breakdown
#[derive(Debug, Clone, Serialize)]
pub struct ComboLineBreakdown {
    pub plan_id: PlanId,
    pub plan_name: String,
    pub service: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub unit_cost_cents: i64,
    pub line_price_cents: i64,
    pub line_cost_cents: i64,
}

/// Full price/cost breakdown for a combo
#[derive(Debug, Clone, Serialize)]
pub struct ComboBreakdown {
    pub combo_id: ComboId,
    pub name: String,
    pub auto_calculated: bool,
    pub lines: Vec<ComboLineBreakdown>,
    pub price_total_cents: i64,
    pub cost_total_cents: i64,
}

/// Sum of `(plan price|cost × quantity)` over the combo's lines.
///
/// Plans missing from `plans` are an error: a combo must never price with a
/// silently dropped line.
pub fn computed_totals(combo: &Combo, plans: &[Plan]) -> EngineResult<(i64, i64)> {
    let mut price_total = 0i64;
    let mut cost_total = 0i64;
    for line in &combo.lines {
        let plan = plans
            .iter()
            .find(|p| p.id == line.plan_id)
            .ok_or(EngineError::PlanNotFound(line.plan_id))?;
        price_total += plan.price_cents * line.quantity as i64;
        cost_total += plan.cost_cents * line.quantity as i64;
    }
    Ok((price_total, cost_total))
}

#[derive(Clone)]
pub struct ComboPricing {
    catalog: Arc<dyn CatalogStore>,
}

impl ComboPricing {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    /// Per-line and total price/cost for a combo
    pub async fn breakdown(&self, combo_id: ComboId) -> EngineResult<ComboBreakdown> {
        let combo = self
            .catalog
            .get_combo(combo_id)
            .await?
            .ok_or(EngineError::ComboNotFound(combo_id))?;

        let mut lines = Vec::with_capacity(combo.lines.len());
        let mut plans = Vec::with_capacity(combo.lines.len());
        for line in &combo.lines {
            let plan = self
                .catalog
                .get_plan(line.plan_id)
                .await?
                .ok_or(EngineError::PlanNotFound(line.plan_id))?;
            lines.push(ComboLineBreakdown {
                plan_id: plan.id,
                plan_name: plan.name.clone(),
                service: plan.service.clone(),
                quantity: line.quantity,
                unit_price_cents: plan.price_cents,
                unit_cost_cents: plan.cost_cents,
                line_price_cents: plan.price_cents * line.quantity as i64,
                line_cost_cents: plan.cost_cents * line.quantity as i64,
            });
            plans.push(plan);
        }

        let (computed_price, computed_cost) = computed_totals(&combo, &plans)?;
        let (price_total_cents, cost_total_cents) = if combo.auto_calculate {
            (computed_price, computed_cost)
        } else {
            (
                combo.price_override_cents.unwrap_or(computed_price),
                combo.cost_override_cents.unwrap_or(computed_cost),
            )
        };

        Ok(ComboBreakdown {
            combo_id: combo.id,
            name: combo.name,
            auto_calculated: combo.auto_calculate,
            lines,
            price_total_cents,
            cost_total_cents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuenty_shared::ComboLine;
    use time::OffsetDateTime;

    fn plan(price: i64, cost: i64) -> Plan {
        Plan {
            id: PlanId::new(),
            service: "netflix".to_string(),
            name: "Test Plan".to_string(),
            duration_days: 30,
            price_cents: price,
            cost_cents: cost,
            active: true,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_computed_totals() {
        let p1 = plan(12_900, 8_000);
        let p2 = plan(9_900, 6_000);
        let combo = Combo {
            id: ComboId::new(),
            name: "Duo".to_string(),
            description: None,
            lines: vec![
                ComboLine { plan_id: p1.id, quantity: 1 },
                ComboLine { plan_id: p2.id, quantity: 2 },
            ],
            auto_calculate: true,
            price_override_cents: None,
            cost_override_cents: None,
            active: true,
            created_at: OffsetDateTime::now_utc(),
        };

        let (price, cost) = computed_totals(&combo, &[p1, p2]).unwrap();
        assert_eq!(price, 12_900 + 2 * 9_900);
        assert_eq!(cost, 8_000 + 2 * 6_000);
    }

    #[test]
    fn test_computed_totals_missing_plan_is_error() {
        let p1 = plan(12_900, 8_000);
        let combo = Combo {
            id: ComboId::new(),
            name: "Broken".to_string(),
            description: None,
            lines: vec![ComboLine { plan_id: PlanId::new(), quantity: 1 }],
            auto_calculate: true,
            price_override_cents: None,
            cost_override_cents: None,
            active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        assert!(computed_totals(&combo, &[p1]).is_err());
    }
}
