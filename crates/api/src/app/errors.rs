use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use herald_infra::{StoreError, SubmitError};

pub const IDEMPOTENCY_CONFLICT: &str = "IDEMPOTENCY_KEY_REUSED_WITH_DIFFERENT_PAYLOAD";

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        SubmitError::IdempotencyConflict { existing_id } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": IDEMPOTENCY_CONFLICT,
                "existingNotificationId": existing_id,
            })),
        )
            .into_response(),
        SubmitError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    tracing::error!(error = %err, "notification store failure");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "store_error",
        err.to_string(),
    )
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
