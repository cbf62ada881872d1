//! Health check endpoint

use axum::Json;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "cuenty-api",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
