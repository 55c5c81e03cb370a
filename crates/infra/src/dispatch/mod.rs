//! Delivery attempts: provider client, retry policy and the executor tying them to the store.

pub mod executor;
pub mod provider;
pub mod retry;

pub use executor::{DispatchError, DispatchExecutor, DispatchOutcome, DispatchReport};
pub use provider::{
    EmailProvider, MAILERSEND, MailerSendProvider, ProviderError, ProviderReceipt, TemplateEmail,
};
pub use retry::{BACKOFF_SCHEDULE, MAX_ATTEMPTS, RetryPolicy};
