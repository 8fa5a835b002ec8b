//! External sending providers.
//!
//! Processors talk to providers only through [`MessageSender`] and
//! [`EmailSender`]; the HTTP implementations here speak a plain JSON API with
//! bearer authentication.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::queue::{EmailRecipient, TenantId};

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Credentials rejected; every further call would fail the same way
    #[error("Provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Provider rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider server error ({status}): {body}")]
    Server { status: u16, body: String },

    /// The provider refused this one request (bad number, bad address)
    #[error("Provider rejected request: {0}")]
    Rejected(String),

    #[error("Provider unreachable: {0}")]
    Transport(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Aborts the whole batch instead of failing one item.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, ProviderError::Unauthorized(_))
    }

    /// Likely to succeed if tried again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Server { .. } | ProviderError::Transport(_)
        )
    }

    /// Metric label
    pub fn outcome(&self) -> &'static str {
        match self {
            ProviderError::Unauthorized(_) => "unauthorized",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Server { .. } => "server_error",
            ProviderError::Rejected(_) => "rejected",
            ProviderError::Transport(_) => "transport",
            ProviderError::InvalidResponse(_) => "invalid_response",
        }
    }

    fn from_status(status: StatusCode, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized(body),
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
            s if s.is_server_error() => ProviderError::Server {
                status: s.as_u16(),
                body,
            },
            s => ProviderError::Rejected(format!("status {}: {}", s.as_u16(), body)),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub tenant_id: TenantId,
    pub to: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageReceipt {
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundEmail {
    pub tenant_id: TenantId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    pub to: Vec<EmailRecipient>,
}

/// Per-recipient acknowledgement of one batch send.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailReceipt {
    #[serde(default)]
    pub accepted: Vec<AcceptedEmail>,
    #[serde(default)]
    pub rejected: Vec<RejectedEmail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceptedEmail {
    pub email: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RejectedEmail {
    pub email: String,
    pub reason: String,
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Label used in logs and metrics
    fn name(&self) -> &str;

    async fn send(&self, message: &OutboundMessage) -> Result<MessageReceipt, ProviderError>;
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    fn name(&self) -> &str;

    /// Send one message to every recipient of the batch.
    async fn send_batch(&self, email: &OutboundEmail) -> Result<EmailReceipt, ProviderError>;
}

/// JSON-over-HTTP client shared by both provider kinds.
struct HttpProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpProvider {
    fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }

    async fn post<B, R>(&self, body: &B) -> Result<R, ProviderError>
    where
        B: Serialize + Sync,
        R: for<'de> Deserialize<'de> + Default,
    {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body, retry_after));
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(R::default());
        }
        Ok(response.json().await?)
    }
}

pub struct HttpMessageSender {
    http: HttpProvider,
}

impl HttpMessageSender {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            http: HttpProvider::new(config)?,
        })
    }
}

#[async_trait]
impl MessageSender for HttpMessageSender {
    fn name(&self) -> &str {
        "messaging"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<MessageReceipt, ProviderError> {
        self.http.post(message).await
    }
}

pub struct HttpEmailSender {
    http: HttpProvider,
}

impl HttpEmailSender {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            http: HttpProvider::new(config)?,
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    fn name(&self) -> &str {
        "email"
    }

    async fn send_batch(&self, email: &OutboundEmail) -> Result<EmailReceipt, ProviderError> {
        self.http.post(email).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = ProviderError::from_status(StatusCode::UNAUTHORIZED, "bad key".into(), None);
        assert!(err.is_batch_fatal());
        assert!(!err.is_transient());

        let err = ProviderError::from_status(
            StatusCode::TOO_MANY_REQUESTS,
            String::new(),
            Some(Duration::from_secs(2)),
        );
        assert!(err.is_transient());
        assert_eq!(err.outcome(), "rate_limited");

        let err = ProviderError::from_status(StatusCode::BAD_GATEWAY, "upstream".into(), None);
        assert!(matches!(err, ProviderError::Server { status: 502, .. }));

        let err = ProviderError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "bad number".into(), None);
        assert!(!err.is_transient());
        assert!(!err.is_batch_fatal());
    }

    #[test]
    fn test_email_receipt_defaults() {
        let receipt: EmailReceipt = serde_json::from_str(
            r#"{"accepted":[{"email":"a@example.com","message_id":"m-1"}]}"#,
        )
        .unwrap();
        assert_eq!(receipt.accepted.len(), 1);
        assert!(receipt.rejected.is_empty());
    }

    #[test]
    fn test_http_sender_builds_from_config() {
        let config = crate::config::ProvidersConfig::default();
        let sender = HttpMessageSender::new(&config.messaging).unwrap();
        assert_eq!(sender.name(), "messaging");
    }
}
