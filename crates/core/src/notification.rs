//! Notification record, submission input, and lifecycle transitions.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{NotificationId, TenantId};

/// Longest accepted time-to-live: seven days.
pub const MAX_TTL_SECONDS: u32 = 60 * 60 * 24 * 7;

/// `lastError` written when a record is dropped because its deadline passed.
pub const EXPIRED_BEFORE_SEND: &str = "expired before send";

/// Delivery priority. Lower number is more urgent.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl Priority {
    /// Base scheduling score before the aging bonus is added.
    pub fn weight(self) -> f64 {
        match self {
            Priority::P0 => 100.0,
            Priority::P1 => 50.0,
            Priority::P2 => 10.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
        }
    }
}

impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P0" => Ok(Priority::P0),
            "P1" => Ok(Priority::P1),
            "P2" => Ok(Priority::P2),
            other => Err(DomainError::unknown_variant("priority", other)),
        }
    }
}

/// Lifecycle state of a notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    /// Waiting in the eligible pool.
    Accepted,
    /// Claimed by a worker; a delivery attempt is in flight.
    Sending,
    Sent,
    /// Exhausted every delivery attempt.
    Failed,
    /// Deadline passed before a send could happen.
    Dropped,
}

impl NotificationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent | NotificationStatus::Failed | NotificationStatus::Dropped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Accepted => "ACCEPTED",
            NotificationStatus::Sending => "SENDING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Failed => "FAILED",
            NotificationStatus::Dropped => "DROPPED",
        }
    }
}

impl FromStr for NotificationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPTED" => Ok(NotificationStatus::Accepted),
            "SENDING" => Ok(NotificationStatus::Sending),
            "SENT" => Ok(NotificationStatus::Sent),
            "FAILED" => Ok(NotificationStatus::Failed),
            "DROPPED" => Ok(NotificationStatus::Dropped),
            other => Err(DomainError::unknown_variant("status", other)),
        }
    }
}

impl core::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recipient of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A tenant's request to deliver one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub tenant_id: String,
    pub event_type: String,
    pub priority: Priority,
    pub to: Recipient,
    pub template_id: String,
    pub variables: serde_json::Value,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u32>,
}

impl Submission {
    /// Check field presence, lengths, and ranges.
    pub fn validate(&self) -> DomainResult<()> {
        require_text("tenantId", &self.tenant_id, 100)?;
        require_text("eventType", &self.event_type, 100)?;
        require_text("templateId", &self.template_id, 200)?;
        require_text("idempotencyKey", &self.idempotency_key, 200)?;
        require_text("to.email", &self.to.email, 254)?;

        if !looks_like_email(self.to.email.trim()) {
            return Err(DomainError::validation("to.email must be an email address"));
        }

        if let Some(name) = &self.to.name {
            if name.chars().count() > 200 {
                return Err(DomainError::validation(
                    "to.name must be at most 200 characters",
                ));
            }
        }

        if !self.variables.is_object() {
            return Err(DomainError::validation("variables must be an object"));
        }

        if let Some(ttl) = self.ttl_seconds {
            if !(1..=MAX_TTL_SECONDS).contains(&ttl) {
                return Err(DomainError::validation(format!(
                    "ttlSeconds must be between 1 and {MAX_TTL_SECONDS}"
                )));
            }
        }

        Ok(())
    }

    /// Recipient address as stored and fingerprinted.
    pub fn normalized_email(&self) -> String {
        self.to.email.trim().to_lowercase()
    }

    /// Absolute deadline derived from the ttl, if one was requested.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.ttl_seconds
            .map(|ttl| now + Duration::seconds(i64::from(ttl)))
    }
}

fn require_text(field: &str, value: &str, max_chars: usize) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > max_chars {
        return Err(DomainError::validation(format!(
            "{field} must be at most {max_chars} characters"
        )));
    }
    Ok(())
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.chars().any(char::is_whitespace)
}

/// The durable notification entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub tenant_id: TenantId,
    pub idempotency_key: String,
    pub request_hash: String,

    pub event_type: String,
    pub priority: Priority,
    pub template_id: String,
    pub to_email: String,
    pub to_name: Option<String>,
    pub variables: serde_json::Value,

    pub status: NotificationStatus,
    /// Incremented once per claim, never at completion.
    pub attempts: u32,
    pub locked_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub provider: Option<String>,
}

impl NotificationRecord {
    /// Build a fresh ACCEPTED record for a validated submission.
    pub fn accepted(submission: &Submission, request_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            id: NotificationId::new(),
            tenant_id: TenantId::new(submission.tenant_id.clone()),
            idempotency_key: submission.idempotency_key.clone(),
            request_hash,
            event_type: submission.event_type.clone(),
            priority: submission.priority,
            template_id: submission.template_id.clone(),
            to_email: submission.normalized_email(),
            to_name: submission.to.name.clone(),
            variables: submission.variables.clone(),
            status: NotificationStatus::Accepted,
            attempts: 0,
            locked_at: None,
            next_attempt_at: None,
            expires_at: submission.expires_at(now),
            created_at: now,
            updated_at: now,
            sent_at: None,
            last_error: None,
            provider_message_id: None,
            provider: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the scheduler may claim this record at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == NotificationStatus::Accepted
            && self.next_attempt_at.is_none_or(|at| at <= now)
            && !self.is_expired(now)
    }

    /// Minutes spent waiting since creation (fractional, never negative).
    pub fn minutes_waiting(&self, now: DateTime<Utc>) -> f64 {
        let millis = (now - self.created_at).num_milliseconds().max(0);
        millis as f64 / 60_000.0
    }

    /// ACCEPTED -> SENDING.
    pub fn mark_sending(&mut self, now: DateTime<Utc>) {
        self.status = NotificationStatus::Sending;
        self.attempts += 1;
        self.locked_at = Some(now);
        self.updated_at = now;
    }

    /// Apply a completion transition to a SENDING record.
    pub fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) {
        self.status = transition.target_status();
        self.locked_at = None;
        self.updated_at = now;

        match transition {
            Transition::Sent {
                provider,
                provider_message_id,
            } => {
                self.provider = Some(provider.clone());
                self.provider_message_id = provider_message_id.clone();
                self.sent_at = Some(now);
                self.last_error = None;
                self.next_attempt_at = None;
            }
            Transition::Retry {
                error,
                next_attempt_at,
            } => {
                self.last_error = Some(error.clone());
                self.next_attempt_at = Some(*next_attempt_at);
            }
            Transition::Failed { error } | Transition::Dropped { reason: error } => {
                self.last_error = Some(error.clone());
                self.next_attempt_at = None;
            }
        }
    }

    /// SENDING -> ACCEPTED after the claim's lease went stale.
    pub fn requeue(&mut self, next_attempt_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = NotificationStatus::Accepted;
        self.locked_at = None;
        self.next_attempt_at = Some(next_attempt_at);
        self.updated_at = now;
    }
}

/// A write that moves a claimed record out of SENDING.
///
/// Every variant clears `lockedAt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Sent {
        provider: String,
        provider_message_id: Option<String>,
    },
    /// Back into the eligible pool after a retryable failure.
    Retry {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
    Dropped {
        reason: String,
    },
}

impl Transition {
    pub fn target_status(&self) -> NotificationStatus {
        match self {
            Transition::Sent { .. } => NotificationStatus::Sent,
            Transition::Retry { .. } => NotificationStatus::Accepted,
            Transition::Failed { .. } => NotificationStatus::Failed,
            Transition::Dropped { .. } => NotificationStatus::Dropped,
        }
    }

    pub fn expired() -> Self {
        Transition::Dropped {
            reason: EXPIRED_BEFORE_SEND.to_string(),
        }
    }
}

/// What a submitter gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub notification_id: NotificationId,
    pub status: NotificationStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub idempotency_reused: bool,
}

impl SubmissionReceipt {
    pub fn from_record(record: &NotificationRecord, idempotency_reused: bool) -> Self {
        Self {
            notification_id: record.id,
            status: record.status,
            expires_at: record.expires_at,
            created_at: record.created_at,
            idempotency_reused,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission() -> Submission {
        Submission {
            tenant_id: "acme".to_string(),
            event_type: "otp.requested".to_string(),
            priority: Priority::P1,
            to: Recipient {
                email: "  Alice@Example.COM ".to_string(),
                name: Some("Alice".to_string()),
            },
            template_id: "tpl-otp".to_string(),
            variables: json!({"code": "123456"}),
            idempotency_key: "req-1".to_string(),
            ttl_seconds: None,
        }
    }

    #[test]
    fn valid_submission_passes() {
        assert!(submission().validate().is_ok());
    }

    #[test]
    fn ttl_bounds_are_enforced() {
        let mut s = submission();
        s.ttl_seconds = Some(0);
        assert!(s.validate().is_err());

        s.ttl_seconds = Some(MAX_TTL_SECONDS + 1);
        assert!(s.validate().is_err());

        s.ttl_seconds = Some(MAX_TTL_SECONDS);
        assert!(s.validate().is_ok());

        s.ttl_seconds = Some(1);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn rejects_blank_and_oversized_fields() {
        let mut s = submission();
        s.tenant_id = "   ".to_string();
        assert!(s.validate().is_err());

        let mut s = submission();
        s.idempotency_key = "k".repeat(201);
        assert!(s.validate().is_err());

        let mut s = submission();
        s.to.name = Some("n".repeat(201));
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_non_object_variables() {
        let mut s = submission();
        s.variables = json!(["a", "b"]);
        assert_eq!(
            s.validate(),
            Err(DomainError::validation("variables must be an object"))
        );
    }

    #[test]
    fn rejects_malformed_email() {
        for bad in ["no-at-sign", "@example.com", "a@", "a@localhost", "a b@example.com", "a@@b.com"] {
            let mut s = submission();
            s.to.email = bad.to_string();
            assert!(s.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn accepted_record_normalizes_email_and_sets_deadline() {
        let mut s = submission();
        s.ttl_seconds = Some(60);
        let now = Utc::now();
        let record = NotificationRecord::accepted(&s, "hash".to_string(), now);

        assert_eq!(record.to_email, "alice@example.com");
        assert_eq!(record.to_name.as_deref(), Some("Alice"));
        assert_eq!(record.status, NotificationStatus::Accepted);
        assert_eq!(record.attempts, 0);
        assert!(record.locked_at.is_none());
        assert_eq!(record.expires_at, Some(now + Duration::seconds(60)));
    }

    #[test]
    fn claim_and_retry_cycle_keeps_lock_invariants() {
        let now = Utc::now();
        let mut record = NotificationRecord::accepted(&submission(), "h".to_string(), now);

        record.mark_sending(now);
        assert_eq!(record.status, NotificationStatus::Sending);
        assert_eq!(record.attempts, 1);
        assert!(record.locked_at.is_some());

        let retry_at = now + Duration::seconds(10);
        record.apply(
            &Transition::Retry {
                error: "boom".to_string(),
                next_attempt_at: retry_at,
            },
            now,
        );
        assert_eq!(record.status, NotificationStatus::Accepted);
        assert!(record.locked_at.is_none());
        assert_eq!(record.next_attempt_at, Some(retry_at));
        assert!(!record.is_claimable(now));
        assert!(record.is_claimable(retry_at));
        assert_eq!(record.attempts, 1);
    }

    #[test]
    fn sent_clears_error_and_records_provider() {
        let now = Utc::now();
        let mut record = NotificationRecord::accepted(&submission(), "h".to_string(), now);
        record.mark_sending(now);
        record.last_error = Some("old".to_string());

        record.apply(
            &Transition::Sent {
                provider: "mailersend".to_string(),
                provider_message_id: Some("msg-1".to_string()),
            },
            now,
        );

        assert_eq!(record.status, NotificationStatus::Sent);
        assert!(record.status.is_terminal());
        assert_eq!(record.sent_at, Some(now));
        assert!(record.last_error.is_none());
        assert_eq!(record.provider_message_id.as_deref(), Some("msg-1"));
    }

    #[test]
    fn expired_records_are_not_claimable() {
        let now = Utc::now();
        let mut s = submission();
        s.ttl_seconds = Some(1);
        let record = NotificationRecord::accepted(&s, "h".to_string(), now);

        assert!(record.is_claimable(now));
        assert!(!record.is_claimable(now + Duration::seconds(1)));
    }

    #[test]
    fn status_and_priority_parse_from_storage_strings() {
        for status in [
            NotificationStatus::Accepted,
            NotificationStatus::Sending,
            NotificationStatus::Sent,
            NotificationStatus::Failed,
            NotificationStatus::Dropped,
        ] {
            assert_eq!(status.as_str().parse::<NotificationStatus>().unwrap(), status);
        }
        assert_eq!("P0".parse::<Priority>().unwrap(), Priority::P0);
        assert!("P9".parse::<Priority>().is_err());
    }

    #[test]
    fn submission_deserializes_from_camel_case_json() {
        let s: Submission = serde_json::from_value(json!({
            "tenantId": "acme",
            "eventType": "otp.requested",
            "priority": "P0",
            "to": {"email": "a@b.co"},
            "templateId": "tpl",
            "variables": {},
            "idempotencyKey": "k",
            "ttlSeconds": 30
        }))
        .unwrap();

        assert_eq!(s.priority, Priority::P0);
        assert_eq!(s.ttl_seconds, Some(30));
        assert!(s.to.name.is_none());
    }
}
