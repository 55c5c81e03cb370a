use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use herald_infra::{
    AppConfig, InMemoryNotificationStore, NotificationStore, PostgresNotificationStore,
    SubmissionLedger,
};

/// Store handle shared by the HTTP handlers and the worker.
pub type DynStore = Arc<dyn NotificationStore>;

/// Services shared by every handler.
pub struct AppServices {
    pub ledger: SubmissionLedger<DynStore>,
}

impl AppServices {
    pub fn new(store: DynStore) -> Self {
        Self {
            ledger: SubmissionLedger::new(store),
        }
    }

    pub fn store(&self) -> &DynStore {
        self.ledger.store()
    }

    /// In-memory services for tests and local runs.
    pub fn in_memory() -> Self {
        Self::new(InMemoryNotificationStore::arc())
    }
}

/// Open the configured store: Postgres when `DATABASE_URL` is set, otherwise
/// an in-memory table that lives as long as the process.
pub async fn connect_store(config: &AppConfig) -> anyhow::Result<DynStore> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set; notifications are kept in memory only");
        return Ok(InMemoryNotificationStore::arc());
    };

    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(url)
        .await
        .context("failed to connect to DATABASE_URL")?;
    let store = PostgresNotificationStore::new(pool);
    store
        .apply_schema()
        .await
        .context("failed to apply notifications schema")?;

    tracing::info!("using Postgres notification store");
    Ok(Arc::new(store))
}
