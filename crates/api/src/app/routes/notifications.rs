use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};

use herald_core::{NotificationId, Submission};

use crate::app::dto::{CreateNotificationRequest, NotificationView};
use crate::app::errors;
use crate::app::services::AppServices;

/// Accept a notification for asynchronous delivery.
///
/// Always `202`, including idempotent replays (`idempotencyReused: true`).
pub async fn create_notification(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<CreateNotificationRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                rejection.body_text(),
            );
        }
    };

    let submission = Submission::from(body);
    match services.ledger.submit(&submission).await {
        Ok(submitted) => (StatusCode::ACCEPTED, Json(submitted.receipt())).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

pub async fn get_notification(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: NotificationId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    match services.store().get(id).await {
        Ok(Some(record)) => Json(NotificationView::from(record)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "notification not found"),
        Err(e) => errors::store_error_to_response(e),
    }
}
