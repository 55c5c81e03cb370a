//! Idempotent submission.
//!
//! `submit` inserts first and resolves afterwards: the store's uniqueness
//! constraint on `(tenant_id, idempotency_key)` decides which of several
//! concurrent submitters created the record. Losers read the winner back and
//! compare fingerprints.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use herald_core::{
    DomainError, NotificationId, NotificationRecord, Submission, SubmissionReceipt, TenantId,
    fingerprint,
};

use crate::store::{NotificationStore, StoreError};

/// Submission failure.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    /// Same `(tenant, idempotency key)` reused for a materially different request.
    #[error("idempotency key reused with a different payload (existing notification {existing_id})")]
    IdempotencyConflict { existing_id: NotificationId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submitted {
    pub record: NotificationRecord,
    /// `true` when an earlier identical submission was returned instead of a new record.
    pub reused: bool,
}

impl Submitted {
    pub fn receipt(&self) -> SubmissionReceipt {
        SubmissionReceipt::from_record(&self.record, self.reused)
    }
}

/// Create-or-detect-duplicate front door of the queue.
#[derive(Debug, Clone)]
pub struct SubmissionLedger<S> {
    store: S,
}

impl<S: NotificationStore> SubmissionLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn submit(&self, submission: &Submission) -> Result<Submitted, SubmitError> {
        self.submit_at(submission, Utc::now()).await
    }

    pub async fn submit_at(
        &self,
        submission: &Submission,
        now: DateTime<Utc>,
    ) -> Result<Submitted, SubmitError> {
        submission.validate()?;

        let request_hash = fingerprint(submission);
        let candidate = NotificationRecord::accepted(submission, request_hash.clone(), now);

        match self.store.insert(candidate).await {
            Ok(record) => {
                info!(
                    notification_id = %record.id,
                    tenant_id = %record.tenant_id,
                    priority = record.priority.as_str(),
                    "notification accepted"
                );
                Ok(Submitted {
                    record,
                    reused: false,
                })
            }
            Err(err) if err.is_conflict() => {
                self.resolve_duplicate(submission, &request_hash, err).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn resolve_duplicate(
        &self,
        submission: &Submission,
        request_hash: &str,
        conflict: StoreError,
    ) -> Result<Submitted, SubmitError> {
        let tenant_id = TenantId::new(submission.tenant_id.clone());
        let existing = self
            .store
            .find_by_key(&tenant_id, &submission.idempotency_key)
            .await?
            // The constraint fired, so the row should be there.
            .ok_or(conflict)?;

        if existing.request_hash != request_hash {
            warn!(
                notification_id = %existing.id,
                tenant_id = %tenant_id,
                "idempotency key reused with a different payload"
            );
            return Err(SubmitError::IdempotencyConflict {
                existing_id: existing.id,
            });
        }

        debug!(notification_id = %existing.id, tenant_id = %tenant_id, "idempotent replay");
        Ok(Submitted {
            record: existing,
            reused: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryNotificationStore;
    use herald_core::{NotificationStatus, Priority, Recipient};
    use serde_json::json;
    use std::sync::Arc;

    fn submission() -> Submission {
        Submission {
            tenant_id: "acme".to_string(),
            event_type: "otp.requested".to_string(),
            priority: Priority::P0,
            to: Recipient {
                email: "carol@example.com".to_string(),
                name: Some("Carol".to_string()),
            },
            template_id: "tpl-otp".to_string(),
            variables: json!({"code": "424242", "meta": {"b": 2, "a": 1}}),
            idempotency_key: "otp-1".to_string(),
            ttl_seconds: Some(300),
        }
    }

    #[tokio::test]
    async fn first_submission_creates_accepted_record() {
        let ledger = SubmissionLedger::new(InMemoryNotificationStore::arc());
        let submitted = ledger.submit(&submission()).await.unwrap();

        assert!(!submitted.reused);
        assert_eq!(submitted.record.status, NotificationStatus::Accepted);
        assert_eq!(submitted.record.attempts, 0);
        assert!(submitted.record.expires_at.is_some());
        assert_eq!(submitted.record.request_hash, fingerprint(&submission()));

        let receipt = submitted.receipt();
        assert_eq!(receipt.notification_id, submitted.record.id);
        assert!(!receipt.idempotency_reused);
    }

    #[tokio::test]
    async fn identical_replay_returns_original() {
        let store = InMemoryNotificationStore::arc();
        let ledger = SubmissionLedger::new(store.clone());

        let first = ledger.submit(&submission()).await.unwrap();

        let mut replay = submission();
        replay.to.name = Some("Someone Else".to_string());
        replay.variables = json!({"meta": {"a": 1, "b": 2}, "code": "424242"});
        let second = ledger.submit(&replay).await.unwrap();

        assert!(second.reused);
        assert_eq!(second.record.id, first.record.id);
        assert!(second.receipt().idempotency_reused);
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn different_payload_is_a_conflict() {
        let ledger = SubmissionLedger::new(InMemoryNotificationStore::arc());
        let first = ledger.submit(&submission()).await.unwrap();

        let mut other = submission();
        other.variables = json!({"code": "000000"});
        let err = ledger.submit(&other).await.unwrap_err();

        match err {
            SubmitError::IdempotencyConflict { existing_id } => {
                assert_eq!(existing_id, first.record.id)
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_submission_writes_nothing() {
        let store = InMemoryNotificationStore::arc();
        let ledger = SubmissionLedger::new(store.clone());

        let mut bad = submission();
        bad.ttl_seconds = Some(0);
        assert!(matches!(
            ledger.submit(&bad).await,
            Err(SubmitError::Validation(_))
        ));
        assert!(store.all().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_submissions_create_one_record() {
        let store = InMemoryNotificationStore::arc();
        let ledger = Arc::new(SubmissionLedger::new(store.clone()));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move { ledger.submit(&submission()).await }));
        }

        let mut ids = Vec::new();
        let mut created = 0;
        for task in tasks {
            let submitted = task.await.unwrap().unwrap();
            if !submitted.reused {
                created += 1;
            }
            ids.push(submitted.record.id);
        }

        assert_eq!(created, 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.all().unwrap().len(), 1);
    }
}
