//! Route definitions

pub mod admin;
pub mod health;
pub mod orders;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        // Read-only admin/reporting surface
        .route(
            "/admin/subscriptions/urgency",
            get(admin::subscriptions_by_urgency),
        )
        .route("/admin/accounts/capacity", get(admin::account_capacity))
        .route("/admin/combos/{id}/pricing", get(admin::combo_pricing))
        .route(
            "/admin/alerts/notifications",
            get(admin::failed_notifications),
        )
        .route("/admin/invariants", get(admin::run_invariants))
        // Subscription write operations
        .route(
            "/admin/subscriptions/{id}/cancel",
            post(admin::cancel_subscription),
        )
        .route(
            "/admin/subscriptions/{id}/auto-renew",
            post(admin::toggle_auto_renew),
        )
        .route(
            "/admin/subscriptions/{id}/renew-now",
            post(admin::force_renew_now),
        )
        // Hook for the external order/payment subsystem
        .route("/orders/confirm-paid", post(orders::confirm_order_paid))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
