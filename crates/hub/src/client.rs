//! HTTP client for the Membase hub.
//!
//! Endpoints (all `POST`):
//! - `/api/upload`: JSON `{owner, bucket, id, message}`
//! - `/api/conversation`: form `{owner}` lists conversation ids,
//!   form `{owner, id}` lists the serialized messages of one conversation
//! - `/api/download`: form `{owner, id}` returns the raw object

use async_trait::async_trait;
use membase_core::error::HubError;
use membase_core::hub::{HubTransport, UploadRequest};
use std::time::Duration;
use tracing::{debug, warn};

/// A hub transport over HTTP.
pub struct HttpHubClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpHubClient {
    /// Create a client for the hub at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, HubError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HubError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<reqwest::Response, HubError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|e| HubError::Network(e.to_string()))?;
        check_status(response).await
    }
}

/// Map non-2xx responses to [`HubError::Status`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, HubError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), body = %body, "Hub returned error");
    Err(HubError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Messages come back either as JSON text or as inline objects.
fn into_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl HubTransport for HttpHubClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn upload(&self, request: &UploadRequest) -> Result<(), HubError> {
        let url = format!("{}/api/upload", self.base_url);
        debug!(
            owner = %request.owner,
            bucket = %request.bucket,
            id = %request.id,
            "Uploading to hub"
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| HubError::Network(e.to_string()))?;
        check_status(response).await?;
        Ok(())
    }

    async fn list_conversations(&self, owner: &str) -> Result<Vec<String>, HubError> {
        let response = self
            .post_form("/api/conversation", &[("owner", owner)])
            .await?;
        let ids: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| HubError::Decode(format!("conversation list: {e}")))?;
        Ok(ids.into_iter().map(into_text).collect())
    }

    async fn get_conversation(
        &self,
        owner: &str,
        conversation_id: &str,
    ) -> Result<Vec<String>, HubError> {
        let response = self
            .post_form("/api/conversation", &[("owner", owner), ("id", conversation_id)])
            .await?;
        let messages: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| HubError::Decode(format!("conversation {conversation_id}: {e}")))?;
        Ok(messages.into_iter().map(into_text).collect())
    }

    async fn download(&self, owner: &str, id: &str) -> Result<Vec<u8>, HubError> {
        let response = self
            .post_form("/api/download", &[("owner", owner), ("id", id)])
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| HubError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
