//! Background workers.

pub mod notification_worker;

pub use notification_worker::{
    BatchSummary, NotificationWorker, TickReport, WorkerHandle, WorkerStats,
};
