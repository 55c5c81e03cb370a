//! Dispatch executor: claim one notification, attempt delivery, write the outcome back.

use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use herald_core::{NotificationId, NotificationRecord, NotificationStatus, TenantId, Transition};

use super::provider::{EmailProvider, TemplateEmail};
use super::retry::RetryPolicy;
use crate::store::{NotificationStore, StoreError};

/// Failure to run the scheduling query. Aborts the current worker tick.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to claim next notification: {0}")]
    Claim(#[from] StoreError),
}

/// What happened to one claimed notification.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Sent {
        provider_message_id: Option<String>,
    },
    /// Delivery failed; the record is back in the pool.
    Retrying {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    /// Delivery failed on the last allowed attempt.
    Failed { error: String },
    /// Expired before a send could happen. The provider was not called.
    Dropped { reason: String },
    /// The claim was taken away before the write-back: the recovery sweep
    /// requeued the record, and possibly another worker claimed it again.
    /// Nothing was written.
    Superseded,
    /// The write-back itself failed. The record stays SENDING until the
    /// recovery sweep reclaims it.
    Unrecorded { error: String },
}

impl DispatchOutcome {
    /// Status the record was moved to, if the write-back landed.
    pub fn status(&self) -> Option<NotificationStatus> {
        match self {
            DispatchOutcome::Sent { .. } => Some(NotificationStatus::Sent),
            DispatchOutcome::Retrying { .. } => Some(NotificationStatus::Accepted),
            DispatchOutcome::Failed { .. } => Some(NotificationStatus::Failed),
            DispatchOutcome::Dropped { .. } => Some(NotificationStatus::Dropped),
            DispatchOutcome::Superseded | DispatchOutcome::Unrecorded { .. } => None,
        }
    }

    fn from_transition(transition: Transition) -> Self {
        match transition {
            Transition::Sent {
                provider_message_id,
                ..
            } => DispatchOutcome::Sent {
                provider_message_id,
            },
            Transition::Retry {
                error,
                next_attempt_at,
            } => DispatchOutcome::Retrying {
                error,
                next_attempt_at,
            },
            Transition::Failed { error } => DispatchOutcome::Failed { error },
            Transition::Dropped { reason } => DispatchOutcome::Dropped { reason },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub notification_id: NotificationId,
    pub tenant_id: TenantId,
    /// Claim number this attempt ran under (1-based).
    pub attempt: u32,
    pub outcome: DispatchOutcome,
}

/// Runs one delivery attempt per call.
///
/// Errors local to a record (provider failure, expiry, a lost write-back) are
/// folded into the returned [`DispatchOutcome`]. Only a failed claim surfaces as
/// an `Err`.
#[derive(Debug, Clone)]
pub struct DispatchExecutor<S, P> {
    store: S,
    provider: P,
    retry: RetryPolicy,
}

impl<S, P> DispatchExecutor<S, P>
where
    S: NotificationStore,
    P: EmailProvider,
{
    pub fn new(store: S, provider: P) -> Self {
        Self {
            store,
            provider,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Claim and dispatch the next eligible notification.
    ///
    /// `Ok(None)` means nothing is eligible right now.
    pub async fn send_next(&self) -> Result<Option<DispatchReport>, DispatchError> {
        self.send_next_at(Utc::now()).await
    }

    pub async fn send_next_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchReport>, DispatchError> {
        let Some(record) = self.store.claim_next(now).await? else {
            return Ok(None);
        };

        debug!(
            notification_id = %record.id,
            tenant_id = %record.tenant_id,
            attempt = record.attempts,
            "claimed notification"
        );

        Ok(Some(self.dispatch(record, now).await))
    }

    /// Dispatch a record this worker already claimed.
    pub async fn dispatch(&self, record: NotificationRecord, now: DateTime<Utc>) -> DispatchReport {
        let (transition, finished_at) = if record.is_expired(now) {
            (Transition::expired(), now)
        } else {
            self.attempt_delivery(&record, now).await
        };

        let outcome = self.write_back(&record, transition, finished_at).await;
        DispatchReport {
            notification_id: record.id,
            tenant_id: record.tenant_id,
            attempt: record.attempts,
            outcome,
        }
    }

    async fn attempt_delivery(
        &self,
        record: &NotificationRecord,
        now: DateTime<Utc>,
    ) -> (Transition, DateTime<Utc>) {
        let started = Instant::now();
        let result = self
            .provider
            .send_template_email(&TemplateEmail::for_record(record))
            .await;
        let finished_at = now + chrono::Duration::from_std(started.elapsed()).unwrap_or_default();

        let transition = match result {
            Ok(receipt) => Transition::Sent {
                provider: self.provider.name().to_string(),
                provider_message_id: receipt.provider_message_id,
            },
            Err(err) => self
                .retry
                .on_failure(record.attempts, err.to_string(), finished_at),
        };
        (transition, finished_at)
    }

    async fn write_back(
        &self,
        record: &NotificationRecord,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        match self
            .store
            .complete(record.id, record.attempts, &transition, now)
            .await
        {
            Ok(Some(updated)) => {
                log_transition(&updated, &transition);
                DispatchOutcome::from_transition(transition)
            }
            Ok(None) => {
                warn!(
                    notification_id = %record.id,
                    tenant_id = %record.tenant_id,
                    attempt = record.attempts,
                    "claim superseded before write-back; outcome discarded"
                );
                DispatchOutcome::Superseded
            }
            Err(err) => {
                error!(
                    notification_id = %record.id,
                    tenant_id = %record.tenant_id,
                    attempt = record.attempts,
                    error = %err,
                    "failed to record dispatch outcome"
                );
                DispatchOutcome::Unrecorded {
                    error: err.to_string(),
                }
            }
        }
    }
}

fn log_transition(record: &NotificationRecord, transition: &Transition) {
    match transition {
        Transition::Sent {
            provider_message_id,
            ..
        } => info!(
            notification_id = %record.id,
            tenant_id = %record.tenant_id,
            attempt = record.attempts,
            provider_message_id = provider_message_id.as_deref().unwrap_or("-"),
            "notification sent"
        ),
        Transition::Retry {
            error,
            next_attempt_at,
        } => warn!(
            notification_id = %record.id,
            tenant_id = %record.tenant_id,
            attempt = record.attempts,
            error = %error,
            next_attempt_at = %next_attempt_at,
            "delivery failed; retry scheduled"
        ),
        Transition::Failed { error } => error!(
            notification_id = %record.id,
            tenant_id = %record.tenant_id,
            attempt = record.attempts,
            error = %error,
            "delivery failed permanently"
        ),
        Transition::Dropped { reason } => info!(
            notification_id = %record.id,
            tenant_id = %record.tenant_id,
            attempt = record.attempts,
            reason = %reason,
            "notification dropped"
        ),
    }
}
