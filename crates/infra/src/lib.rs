//! Infrastructure layer: storage, claim scheduling, delivery, workers, config.

pub mod config;
pub mod dispatch;
pub mod ledger;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod workers;

pub use config::{AppConfig, ConfigError, MailerSendConfig, WorkerConfig};
pub use ledger::{SubmissionLedger, SubmitError, Submitted};
pub use recovery::{RecoveryReport, RecoverySweeper};
pub use store::{InMemoryNotificationStore, NotificationStore, PostgresNotificationStore, StoreError};
