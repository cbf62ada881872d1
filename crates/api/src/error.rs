//! API error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cuenty_engine::EngineError;

/// HTTP-facing error wrapper around engine errors
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Engine(err) => {
                let status = match &err {
                    // Capacity exhaustion is an expected outcome, not a fault
                    EngineError::NoCapacity { .. } | EngineError::Exhausted { .. } => {
                        StatusCode::CONFLICT
                    }
                    EngineError::AccountNotFound(_)
                    | EngineError::SubscriptionNotFound(_)
                    | EngineError::PlanNotFound(_)
                    | EngineError::ComboNotFound(_) => StatusCode::NOT_FOUND,
                    EngineError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    EngineError::ChargeDeclined(_) => StatusCode::PAYMENT_REQUIRED,
                    EngineError::SchedulerBusy => StatusCode::CONFLICT,
                    EngineError::Transport(_) | EngineError::Timeout { .. } => {
                        StatusCode::BAD_GATEWAY
                    }
                    EngineError::SlotConflict { .. }
                    | EngineError::Store(_)
                    | EngineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    tracing::error!(error = %err, "Request failed");
                }
                (status, err.to_string())
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
