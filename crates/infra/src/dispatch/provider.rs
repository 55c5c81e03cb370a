//! Outbound email provider.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use herald_core::NotificationRecord;

use crate::config::MailerSendConfig;

/// Provider name recorded on SENT records delivered through MailerSend.
pub const MAILERSEND: &str = "mailersend";

/// A delivery failure. Its display text is what lands in `lastError`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} is not configured: {missing} is not set")]
    NotConfigured {
        provider: &'static str,
        missing: &'static str,
    },

    #[error("{provider} error: {status} {body}")]
    Rejected {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} request failed: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },
}

/// What the provider needs to render and deliver one templated email.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateEmail {
    pub to_email: String,
    pub template_id: String,
    pub variables: Value,
}

impl TemplateEmail {
    pub fn for_record(record: &NotificationRecord) -> Self {
        Self {
            to_email: record.to_email.clone(),
            template_id: record.template_id.clone(),
            variables: record.variables.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderReceipt {
    pub provider_message_id: Option<String>,
}

/// Sends templated email on behalf of the dispatch executor.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Name stored in the record's `provider` field on success.
    fn name(&self) -> &str;

    async fn send_template_email(
        &self,
        email: &TemplateEmail,
    ) -> Result<ProviderReceipt, ProviderError>;
}

#[async_trait]
impl<P> EmailProvider for Arc<P>
where
    P: EmailProvider + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn send_template_email(
        &self,
        email: &TemplateEmail,
    ) -> Result<ProviderReceipt, ProviderError> {
        (**self).send_template_email(email).await
    }
}

/// MailerSend HTTP API client.
///
/// Missing credentials are not a construction error: every send fails with
/// [`ProviderError::NotConfigured`] instead, which the executor retries like
/// any other delivery failure.
#[derive(Debug, Clone)]
pub struct MailerSendProvider {
    client: reqwest::Client,
    config: MailerSendConfig,
}

impl MailerSendProvider {
    const DISPLAY_NAME: &'static str = "MailerSend";

    pub fn new(config: MailerSendConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transport {
                provider: Self::DISPLAY_NAME,
                message: e.to_string(),
            })?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/email", self.config.base_url.trim_end_matches('/'))
    }

    fn credentials(&self) -> Result<Credentials<'_>, ProviderError> {
        let missing = |name: &'static str| ProviderError::NotConfigured {
            provider: Self::DISPLAY_NAME,
            missing: name,
        };
        Ok(Credentials {
            api_key: self
                .config
                .api_key
                .as_deref()
                .ok_or_else(|| missing("MAILERSEND_API_KEY"))?,
            from_email: self
                .config
                .from_email
                .as_deref()
                .ok_or_else(|| missing("MAILERSEND_FROM_EMAIL"))?,
            from_name: self
                .config
                .from_name
                .as_deref()
                .ok_or_else(|| missing("MAILERSEND_FROM_NAME"))?,
        })
    }
}

struct Credentials<'a> {
    api_key: &'a str,
    from_email: &'a str,
    from_name: &'a str,
}

fn request_body(email: &TemplateEmail, from_email: &str, from_name: &str, subject: &str) -> Value {
    json!({
        "from": { "email": from_email, "name": from_name },
        "to": [{ "email": email.to_email }],
        "template_id": email.template_id,
        "subject": subject,
        "personalization": [{
            "email": email.to_email,
            "data": email.variables,
        }],
    })
}

#[async_trait]
impl EmailProvider for MailerSendProvider {
    fn name(&self) -> &str {
        MAILERSEND
    }

    async fn send_template_email(
        &self,
        email: &TemplateEmail,
    ) -> Result<ProviderReceipt, ProviderError> {
        let creds = self.credentials()?;
        let body = request_body(email, creds.from_email, creds.from_name, &self.config.subject);

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(creds.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport {
                provider: Self::DISPLAY_NAME,
                message: e.to_string(),
            })?;

        let status = response.status();
        let provider_message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<unreadable body: {e}>"));
            return Err(ProviderError::Rejected {
                provider: Self::DISPLAY_NAME,
                status: status.as_u16(),
                body,
            });
        }

        debug!(
            template_id = %email.template_id,
            provider_message_id = provider_message_id.as_deref().unwrap_or("-"),
            "mailersend accepted email"
        );
        Ok(ProviderReceipt {
            provider_message_id,
        })
    }
}
