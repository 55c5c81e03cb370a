//! Notification persistence boundary.
//!
//! This module defines the store primitives the queue is built on and two
//! implementations: an in-memory table for tests/dev and a Postgres table for
//! production.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryNotificationStore;
pub use postgres::PostgresNotificationStore;
pub use r#trait::{NotificationStore, StoreError};
