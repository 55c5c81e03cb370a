use axum::{
    Router,
    routing::{get, post},
};

pub mod notifications;
pub mod system;

/// Router for the notification endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/v1/notifications", post(notifications::create_notification))
        .route("/v1/notifications/:id", get(notifications::get_notification))
}
