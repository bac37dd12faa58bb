//! Delivery capabilities shared by every email and push provider.

use async_trait::async_trait;
use serde::Serialize;

/// What a backend reports back after a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryResponse {
    /// Provider-side identifier (message id, FCM message name), when one is returned.
    pub message_id: Option<String>,
    /// Short human-readable summary of the provider response.
    pub detail: String,
}

impl DeliveryResponse {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            message_id: None,
            detail: detail.into(),
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// Provider-side failure, carried as an opaque description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DeliveryError(pub String);

impl DeliveryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        DeliveryError(format!("request failed: {}", e))
    }
}

#[async_trait]
pub trait EmailBackend: Send + Sync + 'static {
    /// Provider name used in logs and the stored provider response.
    fn name(&self) -> &'static str;

    async fn send_email(
        &self,
        subject: &str,
        body: &str,
        recipients: &[String],
    ) -> Result<DeliveryResponse, DeliveryError>;
}

#[async_trait]
pub trait PushBackend: Send + Sync + 'static {
    async fn send_push(
        &self,
        title: &str,
        body: &str,
        token: &str,
    ) -> Result<DeliveryResponse, DeliveryError>;
}

/// Read a non-2xx provider response into a `DeliveryError` with status and body.
pub(crate) async fn error_from_response(provider: &str, response: reqwest::Response) -> DeliveryError {
    let status = response.status();
    let error_text = response.text().await.unwrap_or_default();
    DeliveryError(format!("{} API error ({}): {}", provider, status, error_text))
}
