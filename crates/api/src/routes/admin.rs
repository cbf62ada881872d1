//! Admin and reporting routes
//!
//! Read-only queries over the engine state plus the subscription write
//! operations exposed to the back office.

use axum::extract::{Path, State};
use axum::Json;
use cuenty_engine::{
    ComboBreakdown, InvariantCheckSummary, RenewalOutcome, UrgencyGroup,
};
use cuenty_shared::{AccountCapacity, NotificationEvent, Subscription};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

// =============================================================================
// Read-only queries
// =============================================================================

pub async fn subscriptions_by_urgency(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<UrgencyGroup>>> {
    let today = OffsetDateTime::now_utc().date();
    let report = state.engine.scheduler.urgency_report(today).await?;
    Ok(Json(report))
}

pub async fn account_capacity(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<AccountCapacity>>> {
    let snapshot = state.engine.pool.snapshot().await?;
    Ok(Json(snapshot))
}

pub async fn combo_pricing(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ComboBreakdown>> {
    let breakdown = state.engine.pricing.breakdown(id.into()).await?;
    Ok(Json(breakdown))
}

pub async fn failed_notifications(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<NotificationEvent>>> {
    let failed = state.engine.failed_notifications().await?;
    Ok(Json(failed))
}

pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.engine.invariants.run_all_checks().await?;
    Ok(Json(summary))
}

// =============================================================================
// Write operations
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Json<Subscription>> {
    let sub = state
        .engine
        .lifecycle
        .cancel(id.into(), &request.reason)
        .await?;
    Ok(Json(sub))
}

#[derive(Debug, Deserialize)]
pub struct AutoRenewRequest {
    pub enabled: bool,
}

pub async fn toggle_auto_renew(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<AutoRenewRequest>,
) -> ApiResult<Json<Subscription>> {
    let sub = state
        .engine
        .lifecycle
        .set_auto_renew(id.into(), request.enabled)
        .await?;
    Ok(Json(sub))
}

pub async fn force_renew_now(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RenewalOutcome>> {
    let today = OffsetDateTime::now_utc().date();
    let outcome = state.engine.lifecycle.renew(id.into(), today).await?;
    Ok(Json(outcome))
}
