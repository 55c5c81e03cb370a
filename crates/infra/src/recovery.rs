//! Recovery sweep for claims whose worker never wrote an outcome back.
//!
//! A claim is a lease: once `locked_at` is older than [`STALE_LOCK_THRESHOLD`]
//! the record is handed back to the pool (or dropped, if its deadline passed
//! while it sat in SENDING).

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::store::{NotificationStore, StoreError};

/// How long a SENDING record may stay locked before it is considered abandoned.
pub const STALE_LOCK_THRESHOLD: Duration = Duration::from_secs(2 * 60);

/// Delay before a requeued record becomes eligible again.
pub const REQUEUE_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale claims moved back to ACCEPTED.
    pub requeued: u64,
    /// Stale claims past their deadline, moved to DROPPED.
    pub dropped: u64,
}

impl RecoveryReport {
    pub fn total(&self) -> u64 {
        self.requeued + self.dropped
    }
}

#[derive(Debug, Clone)]
pub struct RecoverySweeper<S> {
    store: S,
}

impl<S: NotificationStore> RecoverySweeper<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Requeue live stale claims. Returns how many were requeued.
    pub async fn recover_stuck(&self) -> Result<u64, StoreError> {
        self.recover_stuck_at(Utc::now()).await
    }

    pub async fn recover_stuck_at(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let requeued = self
            .store
            .requeue_stale(stale_before(now), now + chrono_delay(REQUEUE_DELAY), now)
            .await?;
        if requeued > 0 {
            warn!(requeued, "requeued stale notification claims");
        }
        Ok(requeued)
    }

    /// Requeue live stale claims and drop expired ones.
    pub async fn sweep(&self) -> Result<RecoveryReport, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<RecoveryReport, StoreError> {
        let requeued = self.recover_stuck_at(now).await?;
        let dropped = self.store.drop_expired_stale(stale_before(now), now).await?;
        if dropped > 0 {
            info!(dropped, "dropped stale notification claims past their deadline");
        }
        Ok(RecoveryReport { requeued, dropped })
    }
}

fn stale_before(now: DateTime<Utc>) -> DateTime<Utc> {
    now - chrono_delay(STALE_LOCK_THRESHOLD)
}

fn chrono_delay(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_default()
}
