use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use herald_core::{
    NotificationId, NotificationRecord, NotificationStatus, TenantId, Transition,
};

use super::r#trait::{NotificationStore, StoreError};
use crate::scheduler;

#[derive(Debug, Default)]
struct State {
    records: HashMap<NotificationId, NotificationRecord>,
    by_key: HashMap<(TenantId, String), NotificationId>,
    /// Ids currently ACCEPTED; the only records a claim looks at.
    accepted: HashSet<NotificationId>,
    /// Ids currently SENDING; the only records a sweep looks at.
    sending: HashSet<NotificationId>,
}

impl State {
    fn store(&mut self, record: NotificationRecord) {
        self.index(record.id, record.status);
        self.records.insert(record.id, record);
    }

    fn index(&mut self, id: NotificationId, status: NotificationStatus) {
        self.accepted.remove(&id);
        self.sending.remove(&id);
        match status {
            NotificationStatus::Accepted => {
                self.accepted.insert(id);
            }
            NotificationStatus::Sending => {
                self.sending.insert(id);
            }
            _ => {}
        }
    }

    fn stale_ids(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
        expired: bool,
    ) -> Vec<NotificationId> {
        self.sending
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| is_stale(r, stale_before) && r.is_expired(now) == expired)
            .map(|r| r.id)
            .collect()
    }

    /// Apply `change` to a record and re-index it. Returns the updated copy.
    fn update(
        &mut self,
        id: NotificationId,
        change: impl FnOnce(&mut NotificationRecord),
    ) -> Option<NotificationRecord> {
        let record = self.records.get_mut(&id)?;
        change(record);
        let updated = record.clone();
        self.index(id, updated.status);
        Some(updated)
    }
}

/// In-memory notification store for tests/dev.
///
/// A single mutex guards the whole table, so every operation (including the
/// two-stage claim) is trivially atomic. The lock is never held across an
/// `.await`. Claims and sweeps only visit ACCEPTED and SENDING records, so
/// terminal history does not slow them down.
#[derive(Debug, Default)]
pub struct InMemoryNotificationStore {
    inner: Mutex<State>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every record, oldest first.
    pub fn all(&self) -> Result<Vec<NotificationRecord>, StoreError> {
        let state = self.lock()?;
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }

    /// Overwrite a record as-is. Test helper for forcing timestamps.
    pub fn put(&self, record: NotificationRecord) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state
            .by_key
            .insert((record.tenant_id.clone(), record.idempotency_key.clone()), record.id);
        state.store(record);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert(&self, record: NotificationRecord) -> Result<NotificationRecord, StoreError> {
        let mut state = self.lock()?;
        let key = (record.tenant_id.clone(), record.idempotency_key.clone());
        if state.by_key.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "(tenant_id, idempotency_key) = ({}, {}) already exists",
                key.0, key.1
            )));
        }
        state.by_key.insert(key, record.id);
        state.store(record.clone());
        Ok(record)
    }

    async fn find_by_key(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &str,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        let state = self.lock()?;
        let id = state
            .by_key
            .get(&(tenant_id.clone(), idempotency_key.to_string()))
            .copied();
        Ok(id.and_then(|id| state.records.get(&id).cloned()))
    }

    async fn get(&self, id: NotificationId) -> Result<Option<NotificationRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state.records.get(&id).cloned())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<NotificationRecord>, StoreError> {
        let mut state = self.lock()?;
        let candidates = state.accepted.iter().filter_map(|id| state.records.get(id));
        let Some(id) = scheduler::select_next(candidates, now).map(|r| r.id) else {
            return Ok(None);
        };

        state
            .update(id, |record| record.mark_sending(now))
            .map(Some)
            .ok_or_else(|| StoreError::Corrupt(format!("selected record {id} vanished")))
    }

    async fn complete(
        &self,
        id: NotificationId,
        attempt: u32,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        let mut state = self.lock()?;
        let current_claim = state
            .records
            .get(&id)
            .is_some_and(|r| r.status == NotificationStatus::Sending && r.attempts == attempt);
        if !current_claim {
            return Ok(None);
        }
        Ok(state.update(id, |record| record.apply(transition, now)))
    }

    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let stale = state.stale_ids(stale_before, now, false);
        for id in &stale {
            state.update(*id, |record| record.requeue(next_attempt_at, now));
        }
        Ok(stale.len() as u64)
    }

    async fn drop_expired_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let stale = state.stale_ids(stale_before, now, true);
        for id in &stale {
            state.update(*id, |record| record.apply(&Transition::expired(), now));
        }
        Ok(stale.len() as u64)
    }
}

fn is_stale(record: &NotificationRecord, stale_before: DateTime<Utc>) -> bool {
    record.status == NotificationStatus::Sending
        && record.locked_at.is_some_and(|at| at < stale_before)
}
