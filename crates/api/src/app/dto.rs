use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herald_core::{
    NotificationId, NotificationRecord, NotificationStatus, Priority, Recipient, Submission,
};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateNotificationRequest {
    pub tenant_id: String,
    pub event_type: String,
    pub priority: Priority,
    pub to: RecipientRequest,
    pub template_id: String,
    pub variables: serde_json::Value,
    pub idempotency_key: String,
    #[serde(default)]
    pub ttl_seconds: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecipientRequest {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl From<CreateNotificationRequest> for Submission {
    fn from(req: CreateNotificationRequest) -> Self {
        Submission {
            tenant_id: req.tenant_id,
            event_type: req.event_type,
            priority: req.priority,
            to: Recipient {
                email: req.to.email,
                name: req.to.name,
            },
            template_id: req.template_id,
            variables: req.variables,
            idempotency_key: req.idempotency_key,
            ttl_seconds: req.ttl_seconds,
        }
    }
}

// -------------------------
// Response DTOs
// -------------------------

/// Externally visible state of one notification.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationView {
    pub id: NotificationId,
    pub tenant_id: String,
    pub event_type: String,
    pub priority: Priority,
    pub template_id: String,
    pub to_email: String,
    pub status: NotificationStatus,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
}

impl From<NotificationRecord> for NotificationView {
    fn from(r: NotificationRecord) -> Self {
        Self {
            id: r.id,
            tenant_id: r.tenant_id.to_string(),
            event_type: r.event_type,
            priority: r.priority,
            template_id: r.template_id,
            to_email: r.to_email,
            status: r.status,
            attempts: r.attempts,
            next_attempt_at: r.next_attempt_at,
            expires_at: r.expires_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
            sent_at: r.sent_at,
            last_error: r.last_error,
            provider: r.provider,
            provider_message_id: r.provider_message_id,
        }
    }
}
