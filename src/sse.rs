//! SSE Stream Runner (spec §4.I): opens a streaming POST with `?alt=sse`
//! appended, consumes the chunked body through `eventsource_stream`, decodes
//! each frame, and emits a plain async stream of decoded JSON events to
//! whatever the caller (the Streaming Manager, §4.J) wires it to.

use crate::auth::coordinator::{coordinate, PerCallAuthOpts};
use crate::auth::TokenCache;
use crate::config::AuthConfig;
use crate::error::GeminiError;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::Value;
use std::io;

const DONE_SENTINEL: &str = "[DONE]";

/// One decoded item from the upstream SSE body.
pub enum SseEvent {
    Event(Value),
    Complete,
}

/// Opens the stream and returns an async `Stream` of decoded events.
/// Terminal conditions per spec §4.I: a `[DONE]` sentinel yields
/// [`SseEvent::Complete`] and ends the stream; a malformed frame or network
/// failure surfaces as an `Err(GeminiError)` item and ends the stream;
/// dropping the returned stream silently stops consumption (cancellation).
pub async fn open_stream<B: Serialize>(
    client: &reqwest::Client,
    auth_config: &AuthConfig,
    auth_opts: &PerCallAuthOpts,
    token_cache: &TokenCache,
    model: &str,
    body: &B,
) -> Result<impl Stream<Item = Result<SseEvent, GeminiError>>, GeminiError> {
    let coordinated = coordinate(auth_config, auth_opts, token_cache).await?;
    let path = coordinated
        .strategy
        .path(model, "streamGenerateContent", &coordinated.credentials)?;
    let url = format!(
        "{}/{}?alt=sse",
        coordinated.strategy.base_url(&coordinated.credentials),
        path
    );

    let mut request = client.post(&url).json(body);
    for (name, value) in &coordinated.headers {
        request = request.header(*name, value.as_str());
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let raw = response.text().await.unwrap_or_default();
        let details: Option<Value> = serde_json::from_str(&raw).ok();
        return Err(if status.as_u16() == 401 || status.as_u16() == 403 {
            GeminiError::MissingCredentials {
                reason: format!("upstream rejected stream auth: {status}"),
            }
        } else {
            GeminiError::ServerError {
                message: format!("stream open failed: {status}"),
                http_status: Some(status.as_u16()),
                details,
            }
        });
    }

    let events = response
        .bytes_stream()
        .map_err(io::Error::other)
        .eventsource()
        .map(|frame| match frame {
            Ok(event) => {
                let data = event.data.trim();
                if data == DONE_SENTINEL {
                    return Ok(SseEvent::Complete);
                }
                serde_json::from_str::<Value>(data)
                    .map(SseEvent::Event)
                    .map_err(|e| GeminiError::MalformedResponse {
                        message: format!("invalid SSE JSON frame: {e}"),
                        raw: Some(data.to_string()),
                    })
            }
            // A broken read mid-stream (connection reset, chunk framing
            // error) is treated as a server-side condition for retry
            // purposes; the caller (Streaming Manager) decides whether to
            // reconnect.
            Err(e) => Err(GeminiError::ServerError {
                message: format!("sse transport error: {e}"),
                http_status: None,
                details: None,
            }),
        })
        // Yield the terminal item (Complete or Err) then stop; unlike
        // `take_while`, this keeps that last item instead of dropping it.
        .scan(false, |stopped, item| {
            if *stopped {
                return futures::future::ready(None);
            }
            if matches!(item, Ok(SseEvent::Complete) | Err(_)) {
                *stopped = true;
            }
            futures::future::ready(Some(item))
        });

    Ok(events)
}
