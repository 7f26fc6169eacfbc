//! HTTP implementation of [`ErasureApi`].
//!
//! Posts `{"user_ids": [...], "requester": "...", "request_id": "..."}` with
//! Basic credentials and classifies the response:
//!
//! - 2xx: success
//! - 5xx, configured transient codes (408 and 429 by default), transport
//!   errors: transient
//! - anything else: permanent

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;

use super::external::{BatchRequest, DeliveryOutcome, ErasureApi};
use crate::config::ExternalEraserConfig;

/// Longest response body excerpt kept as failure detail.
const MAX_DETAIL_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum HttpApiError {
    #[error("external.endpoint is not configured")]
    MissingEndpoint,

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Serialize)]
struct DeletionPayload<'a> {
    user_ids: &'a [String],
    requester: &'a str,
    request_id: &'a str,
}

/// Analytics deletion endpoint reached over HTTP.
pub struct HttpErasureApi {
    client: Client,
    endpoint: String,
    username: String,
    secret: String,
    transient_status_codes: Vec<u16>,
}

impl HttpErasureApi {
    pub fn new(config: &ExternalEraserConfig) -> Result<Self, HttpApiError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or(HttpApiError::MissingEndpoint)?;
        let client = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self {
            client,
            endpoint,
            username: config.username.clone(),
            secret: config.secret.clone(),
            transient_status_codes: config.transient_status_codes.clone(),
        })
    }

    fn classify(&self, status: StatusCode, body: &str) -> DeliveryOutcome {
        if status.is_success() {
            return DeliveryOutcome::Success;
        }

        let detail = format!("HTTP {}: {}", status.as_u16(), excerpt(body));
        if status.is_server_error() || self.transient_status_codes.contains(&status.as_u16()) {
            DeliveryOutcome::TransientFailure { detail }
        } else {
            DeliveryOutcome::PermanentFailure { detail }
        }
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".into();
    }
    trimmed.chars().take(MAX_DETAIL_CHARS).collect()
}

#[async_trait]
impl ErasureApi for HttpErasureApi {
    async fn delete_batch(&self, batch: &BatchRequest<'_>) -> DeliveryOutcome {
        let payload = DeletionPayload {
            user_ids: batch.user_ids,
            requester: batch.requester,
            request_id: batch.request_id,
        };

        let response = match self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.secret))
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                return DeliveryOutcome::TransientFailure {
                    detail: format!("transport error: {error}"),
                };
            }
        };

        let status = response.status();
        // A body we cannot read still leaves the status to classify on
        let body = response.text().await.unwrap_or_default();
        self.classify(status, &body)
    }
}
