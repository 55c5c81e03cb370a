//! `herald-core` — notification domain building blocks.
//!
//! This crate contains **pure domain** types and functions (no infrastructure concerns).

pub mod error;
pub mod fingerprint;
pub mod id;
pub mod notification;

pub use error::{DomainError, DomainResult};
pub use fingerprint::fingerprint;
pub use id::{NotificationId, TenantId};
pub use notification::{
    EXPIRED_BEFORE_SEND, MAX_TTL_SECONDS, NotificationRecord, NotificationStatus, Priority,
    Recipient, Submission, SubmissionReceipt, Transition,
};
