//! Paid-order hook
//!
//! Called by the external order/payment subsystem once an order is confirmed
//! paid. The engine creates the subscription, finds a slot, and delivers
//! credentials; a capacity shortfall queues the order instead of failing it.

use axum::extract::State;
use axum::Json;
use cuenty_engine::{AssignmentOutcome, PaidOrder};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConfirmOrderRequest {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    #[serde(default)]
    pub auto_renew: bool,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
}

pub async fn confirm_order_paid(
    State(state): State<AppState>,
    Json(request): Json<ConfirmOrderRequest>,
) -> ApiResult<Json<AssignmentOutcome>> {
    let today = OffsetDateTime::now_utc().date();
    let outcome = state
        .engine
        .orders
        .confirm_order_paid(
            PaidOrder {
                order_id: request.order_id.into(),
                customer_id: request.customer_id.into(),
                plan_id: request.plan_id.into(),
                auto_renew: request.auto_renew,
                contact_phone: request.contact_phone,
                contact_email: request.contact_email,
            },
            today,
        )
        .await?;
    Ok(Json(outcome))
}
