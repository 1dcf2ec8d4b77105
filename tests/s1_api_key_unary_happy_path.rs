//! Scenario S1 (spec §8): API-key unary happy path.
//!
//! `AuthStrategy::base_url` intentionally pins production hostnames (spec
//! §4.A is explicit that a selector, once resolved, is never silently
//! redirected), so this test drives the real auth-coordinator and
//! `ApiKeyStrategy::path`/`headers` for everything except the hostname,
//! substituting a `wiremock` server there the way `HttpClient::post_json`
//! would dispatch against it.

use gemini_client::auth::coordinator::{coordinate, PerCallAuthOpts};
use gemini_client::auth::TokenCache;
use gemini_client::config::{AuthConfig, RateLimitProfile};
use gemini_client::http_client::HttpErrorEnvelope;
use gemini_client::rate_limit::{ExecuteOpts, RateLimiter, Usage};
use gemini_client::state_store::StateStoreHandle;
use serde_json::Value;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn fetch_json(client: &reqwest::Client, url: &str, headers: &[(&'static str, String)], body: &Value) -> Result<(Value, Usage), HttpErrorEnvelope> {
    let mut request = client.post(url).json(body);
    for (name, value) in headers {
        request = request.header(*name, value.as_str());
    }
    let response = request.send().await.map_err(|e| HttpErrorEnvelope {
        http_status: 0,
        message: e.to_string(),
        details: None,
    })?;
    let status = response.status();
    if status.is_success() {
        let body: Value = response.json().await.map_err(|e| HttpErrorEnvelope {
            http_status: status.as_u16(),
            message: format!("invalid_json_response: {e}"),
            details: None,
        })?;
        return Ok((body, Usage::default()));
    }
    let raw = response.text().await.unwrap_or_default();
    let details: Option<Value> = serde_json::from_str(&raw).ok();
    Err(HttpErrorEnvelope {
        http_status: status.as_u16(),
        message: format!("http_error: {status}"),
        details,
    })
}

#[tokio::test]
async fn s1_api_key_unary_happy_path() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
        .and(header("x-goog-api-key", "AIza-test-key"))
        .and(body_json(serde_json::json!({
            "contents": [{"parts": [{"text": "Say 'ok'"}]}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "ok"}]}}]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = AuthConfig::ApiKey {
        api_key: "AIza-test-key".to_string(),
    };
    let opts = PerCallAuthOpts::default();
    let token_cache = TokenCache::new(reqwest::Client::new());
    let coordinated = coordinate(&config, &opts, &token_cache).await.unwrap();
    let request_path = coordinated
        .strategy
        .path("gemini-2.5-flash", "generateContent", &coordinated.credentials)
        .unwrap();
    let url = format!("{}/{}", mock_server.uri(), request_path);

    let state_store = StateStoreHandle::spawn().await.unwrap();
    let limiter = RateLimiter::new(state_store.clone());
    let profile = RateLimitProfile::free_tier();
    let client = reqwest::Client::new();
    let body = serde_json::json!({"contents": [{"parts": [{"text": "Say 'ok'"}]}]});

    let response = limiter
        .execute("gemini-2.5-flash", &profile, &ExecuteOpts::default(), || 5, || {
            let client = client.clone();
            let url = url.clone();
            let headers = coordinated.headers.clone();
            let body = body.clone();
            async move { fetch_json(&client, &url, &headers, &body).await }
        })
        .await
        .unwrap();

    assert_eq!(response["candidates"][0]["content"]["parts"][0]["text"], "ok");

    let snapshot = state_store.snapshot("gemini-2.5-flash").await.unwrap();
    assert_eq!(snapshot.active_permits, 0, "the one permit acquired must be released");
    assert_eq!(snapshot.recent_429_count, 0);
}
