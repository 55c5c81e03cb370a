//! Fair priority-aging selection.
//!
//! Two stages, evaluated against one snapshot:
//!
//! 1. **Tenant fairness**: among tenants with at least one claimable record, take the
//!    tenant whose oldest claimable record has the smallest `created_at`.
//! 2. **Priority + aging**: within that tenant, take the record with the highest
//!    `priority.weight() + minutes_waiting * AGING_POINTS_PER_MINUTE`; equal scores
//!    fall back to the smallest `created_at`.
//!
//! The in-memory store runs [`select_next`] under its lock. The Postgres store
//! expresses the same ordering in SQL (see `store::postgres`).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use herald_core::{NotificationRecord, TenantId};

/// Score added per minute a record has been waiting.
pub const AGING_POINTS_PER_MINUTE: f64 = 0.5;

/// Scheduling score of a record at `now`.
pub fn score(record: &NotificationRecord, now: DateTime<Utc>) -> f64 {
    record.priority.weight() + record.minutes_waiting(now) * AGING_POINTS_PER_MINUTE
}

/// Pick the record a claimant should take next, if any.
///
/// Records that are not claimable at `now` (wrong status, backing off, expired)
/// are ignored entirely.
pub fn select_next<'a, I>(records: I, now: DateTime<Utc>) -> Option<&'a NotificationRecord>
where
    I: IntoIterator<Item = &'a NotificationRecord>,
{
    let eligible: Vec<&NotificationRecord> = records
        .into_iter()
        .filter(|r| r.is_claimable(now))
        .collect();

    let tenant = oldest_waiting_tenant(&eligible)?;

    eligible
        .into_iter()
        .filter(|r| &r.tenant_id == tenant)
        .max_by(|a, b| {
            score(a, now)
                .total_cmp(&score(b, now))
                // max_by keeps the last maximum, so invert the FIFO tie-breaks
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.id.cmp(&a.id))
        })
}

fn oldest_waiting_tenant<'a>(eligible: &[&'a NotificationRecord]) -> Option<&'a TenantId> {
    let mut heads: HashMap<&'a TenantId, DateTime<Utc>> = HashMap::new();
    for record in eligible {
        heads
            .entry(&record.tenant_id)
            .and_modify(|oldest| {
                if record.created_at < *oldest {
                    *oldest = record.created_at;
                }
            })
            .or_insert(record.created_at);
    }

    heads
        .into_iter()
        .min_by(|(ta, ca), (tb, cb)| ca.cmp(cb).then_with(|| ta.cmp(tb)))
        .map(|(tenant, _)| tenant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use herald_core::{NotificationStatus, Priority, Recipient, Submission};
    use serde_json::json;

    fn record(tenant: &str, priority: Priority, created_at: DateTime<Utc>) -> NotificationRecord {
        let submission = Submission {
            tenant_id: tenant.to_string(),
            event_type: "evt".to_string(),
            priority,
            to: Recipient {
                email: "x@example.com".to_string(),
                name: None,
            },
            template_id: "tpl".to_string(),
            variables: json!({}),
            idempotency_key: format!("{tenant}-{created_at}"),
            ttl_seconds: None,
        };
        NotificationRecord::accepted(&submission, "h".to_string(), created_at)
    }

    #[test]
    fn older_tenant_wins_over_higher_priority() {
        let t0 = Utc::now();
        let a = record("tenant-a", Priority::P2, t0);
        let b = record("tenant-b", Priority::P0, t0 + Duration::seconds(1));
        let now = t0 + Duration::seconds(2);

        let records = [b.clone(), a.clone()];
        let picked = select_next(records.iter(), now).unwrap();
        assert_eq!(picked.id, a.id);
    }

    #[test]
    fn priority_wins_within_a_tenant() {
        let t0 = Utc::now();
        let low = record("t", Priority::P2, t0);
        let high = record("t", Priority::P0, t0 + Duration::seconds(5));
        let now = t0 + Duration::seconds(10);

        let records = [low, high.clone()];
        assert_eq!(select_next(records.iter(), now).unwrap().id, high.id);
    }

    #[test]
    fn aging_eventually_beats_priority() {
        let t0 = Utc::now();
        // P2 needs 90 points of aging (180 minutes) more than the P0 to overtake it.
        let old_low = record("t", Priority::P2, t0);
        let new_high = record("t", Priority::P0, t0 + Duration::minutes(181));
        let now = t0 + Duration::minutes(181);

        assert!(score(&old_low, now) > score(&new_high, now));
        let records = [new_high, old_low.clone()];
        assert_eq!(select_next(records.iter(), now).unwrap().id, old_low.id);
    }

    #[test]
    fn equal_scores_fall_back_to_fifo() {
        let t0 = Utc::now();
        let first = record("t", Priority::P1, t0);
        let second = record("t", Priority::P1, t0);
        let now = t0;

        let records = [second.clone(), first.clone()];
        let picked = select_next(records.iter(), now).unwrap();
        // Same created_at and score: the smaller (earlier v7) id wins.
        assert_eq!(picked.id, first.id.min(second.id));
    }

    #[test]
    fn ineligible_records_are_ignored() {
        let t0 = Utc::now();
        let now = t0 + Duration::seconds(30);

        let mut backing_off = record("a", Priority::P0, t0);
        backing_off.next_attempt_at = Some(now + Duration::seconds(5));

        let mut expired = record("b", Priority::P0, t0);
        expired.expires_at = Some(now);

        let mut sending = record("c", Priority::P0, t0);
        sending.mark_sending(t0);

        let fallback = record("d", Priority::P2, t0 + Duration::seconds(20));

        let records = [backing_off, expired, sending, fallback.clone()];
        let picked = select_next(records.iter(), now).unwrap();
        assert_eq!(picked.id, fallback.id);
        assert_eq!(picked.status, NotificationStatus::Accepted);
    }

    #[test]
    fn due_retries_are_eligible() {
        let t0 = Utc::now();
        let mut retried = record("a", Priority::P1, t0);
        retried.next_attempt_at = Some(t0 + Duration::seconds(10));

        let records = [retried.clone()];
        assert!(select_next(records.iter(), t0 + Duration::seconds(9)).is_none());
        assert_eq!(
            select_next(records.iter(), t0 + Duration::seconds(10)).unwrap().id,
            retried.id
        );
    }

    #[test]
    fn nothing_eligible_yields_none() {
        let records: Vec<NotificationRecord> = Vec::new();
        assert!(select_next(records.iter(), Utc::now()).is_none());
    }
}
