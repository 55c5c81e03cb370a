use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use herald_core::{NotificationId, NotificationRecord, TenantId, Transition};

/// Notification store operation error.
///
/// These are **infrastructure errors** (storage, constraint, decoding) as opposed
/// to domain errors (validation).
///
/// ## Error Categories
///
/// - **Conflict**: The `(tenant_id, idempotency_key)` uniqueness constraint rejected an insert
/// - **Unavailable**: The backing store could not execute the operation (network, pool, lock)
/// - **Corrupt**: A stored row could not be mapped back onto a `NotificationRecord`
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("uniqueness conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Durable table of notification records.
///
/// The ledger, scheduler, executor and sweeper are built purely on these
/// primitives. Every mutation is a single-row or predicate-scoped bulk update;
/// none of them needs an application-level lock.
///
/// ## Implementation Requirements
///
/// - `insert` must fail with [`StoreError::Conflict`] (and write nothing) when
///   `(tenant_id, idempotency_key)` already exists. The constraint is the only
///   arbiter between concurrent submitters.
/// - `claim_next` must select and mark in one indivisible step: no two callers,
///   in any number of processes, may receive the same record.
/// - `complete` only touches a record that is still `SENDING` under the claim
///   identified by `attempt`. If the sweeper already reclaimed it, or another
///   worker has claimed it since, the write is a no-op and `Ok(None)` is returned.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a new record.
    async fn insert(&self, record: NotificationRecord) -> Result<NotificationRecord, StoreError>;

    /// Look a record up by its idempotency key.
    async fn find_by_key(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &str,
    ) -> Result<Option<NotificationRecord>, StoreError>;

    async fn get(&self, id: NotificationId) -> Result<Option<NotificationRecord>, StoreError>;

    /// Atomically pick the next eligible record and move it ACCEPTED -> SENDING.
    ///
    /// Selection follows [`crate::scheduler`]: oldest-waiting tenant first, then
    /// the highest priority + aging score within that tenant, then FIFO.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<NotificationRecord>, StoreError>;

    /// Move a SENDING record to the transition's target state.
    ///
    /// `attempt` is the `attempts` value returned by the claim being finished.
    async fn complete(
        &self,
        id: NotificationId,
        attempt: u32,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, StoreError>;

    /// SENDING -> ACCEPTED for every unexpired record locked before `stale_before`.
    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// SENDING -> DROPPED for every expired record locked before `stale_before`.
    async fn drop_expired_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> NotificationStore for Arc<S>
where
    S: NotificationStore + ?Sized,
{
    async fn insert(&self, record: NotificationRecord) -> Result<NotificationRecord, StoreError> {
        (**self).insert(record).await
    }

    async fn find_by_key(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &str,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        (**self).find_by_key(tenant_id, idempotency_key).await
    }

    async fn get(&self, id: NotificationId) -> Result<Option<NotificationRecord>, StoreError> {
        (**self).get(id).await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<NotificationRecord>, StoreError> {
        (**self).claim_next(now).await
    }

    async fn complete(
        &self,
        id: NotificationId,
        attempt: u32,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        (**self).complete(id, attempt, transition, now).await
    }

    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self).requeue_stale(stale_before, next_attempt_at, now).await
    }

    async fn drop_expired_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self).drop_expired_stale(stale_before, now).await
    }
}
