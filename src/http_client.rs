//! HTTP Client (spec §4.H): performs one unary request. Builds auth headers
//! via the Multi-Auth Coordinator, serializes the body, emits start/stop
//! telemetry the way the reference implementation's provider clients do,
//! and on non-2xx preserves the entire decoded body in `details` so the
//! Retry Manager can pull a `RetryInfo` out of it.

use crate::auth::coordinator::{coordinate, PerCallAuthOpts};
use crate::config::AuthConfig;
use crate::error::GeminiError;
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tracing::{info, warn};

/// A decoded non-2xx response body, kept intact for the Retry Manager.
pub struct HttpErrorEnvelope {
    pub http_status: u16,
    pub message: String,
    pub details: Option<Value>,
}

pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Performs one request and returns either the parsed JSON body or a
    /// structured error envelope that still carries the decoded details.
    pub async fn post_json<B: Serialize>(
        &self,
        auth_config: &AuthConfig,
        auth_opts: &PerCallAuthOpts,
        token_cache: &crate::auth::TokenCache,
        model: &str,
        endpoint: &str,
        body: &B,
    ) -> Result<Value, HttpErrorEnvelope> {
        let coordinated = coordinate(auth_config, auth_opts, token_cache)
            .await
            .map_err(|e| envelope_from_error(&e))?;

        let url = format!(
            "{}/{}",
            coordinated.strategy.base_url(&coordinated.credentials),
            coordinated
                .strategy
                .path(model, endpoint, &coordinated.credentials)
                .map_err(|e| envelope_from_error(&e))?
        );

        let mut request = self.client.post(&url).json(body);
        for (name, value) in &coordinated.headers {
            request = request.header(*name, value.as_str());
        }

        let start = Instant::now();
        info!(model, endpoint, "dispatching unary request");

        let response = request.send().await.map_err(|e| HttpErrorEnvelope {
            http_status: 0,
            message: e.to_string(),
            details: None,
        })?;

        let status = response.status();
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if status.is_success() {
            let body: Value = response.json().await.map_err(|e| HttpErrorEnvelope {
                http_status: status.as_u16(),
                message: format!("invalid_json_response: {e}"),
                details: None,
            })?;
            info!(model, endpoint, status = status.as_u16(), elapsed_ms, "request completed");
            return Ok(body);
        }

        let raw = response.text().await.unwrap_or_default();
        let details: Option<Value> = serde_json::from_str(&raw).ok();
        warn!(model, endpoint, status = status.as_u16(), elapsed_ms, "request failed");
        Err(HttpErrorEnvelope {
            http_status: status.as_u16(),
            message: format!("http_error: {status}"),
            details,
        })
    }
}

fn envelope_from_error(error: &GeminiError) -> HttpErrorEnvelope {
    HttpErrorEnvelope {
        http_status: error.http_status().unwrap_or(0),
        message: error.to_string(),
        details: error.details().cloned(),
    }
}

impl From<HttpErrorEnvelope> for GeminiError {
    fn from(envelope: HttpErrorEnvelope) -> Self {
        match envelope.http_status {
            0 => GeminiError::InvalidState {
                message: envelope.message,
            },
            429 => GeminiError::RateLimited {
                message: envelope.message,
                http_status: Some(envelope.http_status),
                details: envelope.details,
            },
            400..=499 => GeminiError::InvalidRequest {
                message: envelope.message,
                http_status: Some(envelope.http_status),
                details: envelope.details,
            },
            _ => GeminiError::ServerError {
                message: envelope.message,
                http_status: Some(envelope.http_status),
                details: envelope.details,
            },
        }
    }
}
