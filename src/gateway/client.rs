//! HTTP client for the v1 messaging send endpoint.
//!
//! One call, one device endpoint, one message. Failures come back
//! classified so the dispatch layer can decide what to do with the
//! endpoint (keep, retry later, or drop the registration).

// Rust guideline compliant 2025-01

use anyhow::Context;
use serde::Deserialize;
use serde_json::json;

use crate::constants::GATEWAY_SEND_TIMEOUT;
use crate::gateway::credentials::BearerToken;
use crate::types::{DispatchErrorKind, EndpointToken};

/// A failed send, classified for the dispatch layer.
#[derive(Debug)]
pub struct SendError {
    /// What the failure means for the endpoint that was targeted.
    pub kind: DispatchErrorKind,
    /// Human-readable detail from the gateway or transport.
    pub message: String,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Send failed ({}): {}", self.kind, self.message)
    }
}

impl std::error::Error for SendError {}

#[derive(Deserialize)]
struct SendResponse {
    name: String,
}

/// Client for the messaging gateway's send endpoint.
pub struct PushGateway {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
}

impl PushGateway {
    /// Builds a gateway with the standard send timeout applied.
    pub fn new(
        base_url: impl Into<String>,
        project_id: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(GATEWAY_SEND_TIMEOUT)
            .build()
            .context("Failed to build gateway HTTP client")?;
        Ok(Self::with_client(client, base_url, project_id))
    }

    /// Builds a gateway around an existing HTTP client (used by tests).
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.into(),
        }
    }

    fn send_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/messages:send",
            self.base_url, self.project_id
        )
    }

    /// Pushes one message to one device endpoint.
    ///
    /// Returns the gateway's message name on success.
    pub async fn send(
        &self,
        bearer: &BearerToken,
        endpoint: &EndpointToken,
        title: &str,
        body: &str,
        data: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, SendError> {
        let payload = json!({
            "message": {
                "token": endpoint,
                "notification": { "title": title, "body": body },
                "data": data,
            }
        });

        let response = self
            .client
            .post(self.send_url())
            .bearer_auth(bearer.value())
            .json(&payload)
            .send()
            .await
            .map_err(|e| SendError {
                kind: transport_kind(&e),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            let parsed: SendResponse = response.json().await.map_err(|e| SendError {
                kind: DispatchErrorKind::Unknown,
                message: format!("Unreadable send response: {e}"),
            })?;
            return Ok(parsed.name);
        }

        let text = response.text().await.unwrap_or_default();
        Err(SendError {
            kind: classify(status.as_u16(), &text),
            message: format!("{status}: {text}"),
        })
    }
}

/// Maps a gateway rejection onto an error class.
///
/// Endpoint-token problems surface as 404, or as 400 carrying one of
/// the gateway's token error codes in the body.
fn classify(status: u16, body: &str) -> DispatchErrorKind {
    match status {
        404 => DispatchErrorKind::InvalidEndpoint,
        400 if body.contains("INVALID_ARGUMENT") || body.contains("UNREGISTERED") => {
            DispatchErrorKind::InvalidEndpoint
        }
        401 | 403 => DispatchErrorKind::Unauthorized,
        408 | 429 => DispatchErrorKind::Transient,
        s if s >= 500 => DispatchErrorKind::Transient,
        _ => DispatchErrorKind::Unknown,
    }
}

fn transport_kind(error: &reqwest::Error) -> DispatchErrorKind {
    if error.is_timeout() || error.is_connect() {
        DispatchErrorKind::Transient
    } else {
        DispatchErrorKind::Unknown
    }
}
