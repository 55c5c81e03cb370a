//! Postgres-backed notification store.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | `(tenant_id, idempotency_key)` already taken |
//! | Database (check constraint violation) | `23514` | `Corrupt` | Unknown status/priority written |
//! | Database (other) | Any other | `Unavailable` | Other database errors |
//! | PoolClosed | N/A | `Unavailable` | Connection pool was closed |
//! | Other | N/A | `Unavailable` | Network errors, timeouts, etc. |
//!
//! ## Claiming
//!
//! `claim_next` is a single statement: a CTE computes each tenant's oldest
//! claimable `created_at`, a second CTE orders candidates by
//! `(tenant head, score DESC, created_at)` and locks exactly one with
//! `FOR UPDATE OF n SKIP LOCKED`, and the outer `UPDATE ... RETURNING` marks it
//! SENDING. Rows locked by a concurrent claimant are skipped rather than waited
//! on, so parallel workers fall through to the next candidate in the same order.
//!
//! ## Thread Safety
//!
//! `PostgresNotificationStore` is `Send + Sync` and cheap to clone.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use herald_core::{
    EXPIRED_BEFORE_SEND, NotificationId, NotificationRecord, NotificationStatus, Priority,
    TenantId, Transition,
};

use super::r#trait::{NotificationStore, StoreError};

/// Schema applied by [`PostgresNotificationStore::apply_schema`].
const SCHEMA_SQL: &str = include_str!("../../../../migrations/0001_create_notifications.sql");

const COLUMNS: &str = r#"
    id, tenant_id, idempotency_key, request_hash,
    event_type, priority, template_id, to_email, to_name, variables,
    status, attempts, locked_at, next_attempt_at, expires_at,
    created_at, updated_at, sent_at,
    last_error, provider_message_id, provider
"#;

// Priority weights and the aging rate mirror `Priority::weight` and
// `scheduler::AGING_POINTS_PER_MINUTE`.
const CLAIM_NEXT_SQL: &str = r#"
WITH tenant_heads AS (
    SELECT tenant_id, MIN(created_at) AS oldest_created_at
    FROM notifications
    WHERE status = 'ACCEPTED'
      AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
      AND (expires_at IS NULL OR expires_at > $1)
    GROUP BY tenant_id
),
picked AS (
    SELECT n.id
    FROM notifications n
    JOIN tenant_heads h ON h.tenant_id = n.tenant_id
    WHERE n.status = 'ACCEPTED'
      AND (n.next_attempt_at IS NULL OR n.next_attempt_at <= $1)
      AND (n.expires_at IS NULL OR n.expires_at > $1)
    ORDER BY
        h.oldest_created_at ASC,
        h.tenant_id ASC,
        (CASE n.priority WHEN 'P0' THEN 100 WHEN 'P1' THEN 50 ELSE 10 END)
            + GREATEST(EXTRACT(EPOCH FROM ($1 - n.created_at)), 0) / 60.0 * 0.5 DESC,
        n.created_at ASC,
        n.id ASC
    LIMIT 1
    FOR UPDATE OF n SKIP LOCKED
)
UPDATE notifications AS n
SET status = 'SENDING',
    attempts = n.attempts + 1,
    locked_at = $1,
    updated_at = $1
FROM picked
WHERE n.id = picked.id
  AND n.status = 'ACCEPTED'
RETURNING
    n.id, n.tenant_id, n.idempotency_key, n.request_hash,
    n.event_type, n.priority, n.template_id, n.to_email, n.to_name, n.variables,
    n.status, n.attempts, n.locked_at, n.next_attempt_at, n.expires_at,
    n.created_at, n.updated_at, n.sent_at,
    n.last_error, n.provider_message_id, n.provider
"#;

/// Postgres-backed notification table.
#[derive(Debug, Clone)]
pub struct PostgresNotificationStore {
    pool: Arc<PgPool>,
}

impl PostgresNotificationStore {
    /// Create a new store with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `notifications` table and its indexes if they are missing.
    #[instrument(skip(self), err)]
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("apply_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for PostgresNotificationStore {
    #[instrument(
        skip(self, record),
        fields(notification_id = %record.id, tenant_id = %record.tenant_id),
        err
    )]
    async fn insert(&self, record: NotificationRecord) -> Result<NotificationRecord, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO notifications (
                id, tenant_id, idempotency_key, request_hash,
                event_type, priority, template_id, to_email, to_name, variables,
                status, attempts, locked_at, next_attempt_at, expires_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(record.id.as_uuid())
            .bind(record.tenant_id.as_str())
            .bind(&record.idempotency_key)
            .bind(&record.request_hash)
            .bind(&record.event_type)
            .bind(record.priority.as_str())
            .bind(&record.template_id)
            .bind(&record.to_email)
            .bind(record.to_name.as_deref())
            .bind(&record.variables)
            .bind(record.status.as_str())
            .bind(record.attempts as i32)
            .bind(record.locked_at)
            .bind(record.next_attempt_at)
            .bind(record.expires_at)
            .bind(record.created_at)
            .bind(record.updated_at)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!(
                        "(tenant_id, idempotency_key) = ({}, {}) already exists",
                        record.tenant_id, record.idempotency_key
                    ))
                } else {
                    map_sqlx_error("insert", e)
                }
            })?;

        decode_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn find_by_key(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &str,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM notifications WHERE tenant_id = $1 AND idempotency_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_str())
            .bind(idempotency_key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_key", e))?;
        row.map(|r| decode_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: NotificationId) -> Result<Option<NotificationRecord>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM notifications WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| decode_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<NotificationRecord>, StoreError> {
        let row = sqlx::query(CLAIM_NEXT_SQL)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;
        row.map(|r| decode_row(&r)).transpose()
    }

    #[instrument(skip(self, transition), fields(status = %transition.target_status()), err)]
    async fn complete(
        &self,
        id: NotificationId,
        attempt: u32,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        let writes = CompletionWrites::from(transition);
        let sql = format!(
            r#"
            UPDATE notifications
            SET status = $2,
                locked_at = NULL,
                updated_at = $3,
                last_error = $4,
                next_attempt_at = $5,
                sent_at = CASE WHEN $6 THEN $3 ELSE sent_at END,
                provider = CASE WHEN $6 THEN $7 ELSE provider END,
                provider_message_id = CASE WHEN $6 THEN $8 ELSE provider_message_id END
            WHERE id = $1 AND status = 'SENDING' AND attempts = $9
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(transition.target_status().as_str())
            .bind(now)
            .bind(writes.last_error)
            .bind(writes.next_attempt_at)
            .bind(writes.sent)
            .bind(writes.provider)
            .bind(writes.provider_message_id)
            .bind(attempt as i32)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;
        row.map(|r| decode_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'ACCEPTED',
                locked_at = NULL,
                next_attempt_at = $2,
                updated_at = $3
            WHERE status = 'SENDING'
              AND locked_at < $1
              AND (expires_at IS NULL OR expires_at > $3)
            "#,
        )
        .bind(stale_before)
        .bind(next_attempt_at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn drop_expired_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'DROPPED',
                locked_at = NULL,
                next_attempt_at = NULL,
                last_error = $3,
                updated_at = $2
            WHERE status = 'SENDING'
              AND locked_at < $1
              AND expires_at IS NOT NULL
              AND expires_at <= $2
            "#,
        )
        .bind(stale_before)
        .bind(now)
        .bind(EXPIRED_BEFORE_SEND)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("drop_expired_stale", e))?;

        Ok(result.rows_affected())
    }
}

/// Column values a completion writes, flattened out of a `Transition`.
struct CompletionWrites {
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    sent: bool,
    provider: Option<String>,
    provider_message_id: Option<String>,
}

impl From<&Transition> for CompletionWrites {
    fn from(transition: &Transition) -> Self {
        match transition {
            Transition::Sent {
                provider,
                provider_message_id,
            } => Self {
                last_error: None,
                next_attempt_at: None,
                sent: true,
                provider: Some(provider.clone()),
                provider_message_id: provider_message_id.clone(),
            },
            Transition::Retry {
                error,
                next_attempt_at,
            } => Self {
                last_error: Some(error.clone()),
                next_attempt_at: Some(*next_attempt_at),
                sent: false,
                provider: None,
                provider_message_id: None,
            },
            Transition::Failed { error } | Transition::Dropped { reason: error } => Self {
                last_error: Some(error.clone()),
                next_attempt_at: None,
                sent: false,
                provider: None,
                provider_message_id: None,
            },
        }
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<NotificationRecord, StoreError> {
    NotificationRow::from_row(row)
        .map_err(|e| StoreError::Corrupt(format!("failed to deserialize notification row: {e}")))?
        .try_into()
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23514") => StoreError::Corrupt(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct NotificationRow {
    id: uuid::Uuid,
    tenant_id: String,
    idempotency_key: String,
    request_hash: String,
    event_type: String,
    priority: String,
    template_id: String,
    to_email: String,
    to_name: Option<String>,
    variables: serde_json::Value,
    status: String,
    attempts: i32,
    locked_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    provider_message_id: Option<String>,
    provider: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for NotificationRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(NotificationRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            request_hash: row.try_get("request_hash")?,
            event_type: row.try_get("event_type")?,
            priority: row.try_get("priority")?,
            template_id: row.try_get("template_id")?,
            to_email: row.try_get("to_email")?,
            to_name: row.try_get("to_name")?,
            variables: row.try_get("variables")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            locked_at: row.try_get("locked_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            sent_at: row.try_get("sent_at")?,
            last_error: row.try_get("last_error")?,
            provider_message_id: row.try_get("provider_message_id")?,
            provider: row.try_get("provider")?,
        })
    }
}

impl TryFrom<NotificationRow> for NotificationRecord {
    type Error = StoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let priority: Priority = row
            .priority
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("notification {}: {e}", row.id)))?;
        let status: NotificationStatus = row
            .status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("notification {}: {e}", row.id)))?;
        let attempts = u32::try_from(row.attempts).map_err(|_| {
            StoreError::Corrupt(format!("notification {}: negative attempts", row.id))
        })?;

        Ok(NotificationRecord {
            id: NotificationId::from_uuid(row.id),
            tenant_id: TenantId::new(row.tenant_id),
            idempotency_key: row.idempotency_key,
            request_hash: row.request_hash,
            event_type: row.event_type,
            priority,
            template_id: row.template_id,
            to_email: row.to_email,
            to_name: row.to_name,
            variables: row.variables,
            status,
            attempts,
            locked_at: row.locked_at,
            next_attempt_at: row.next_attempt_at,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sent_at: row.sent_at,
            last_error: row.last_error,
            provider_message_id: row.provider_message_id,
            provider: row.provider,
        })
    }
}
