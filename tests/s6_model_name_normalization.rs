//! Scenario S6 (spec §8): passing a model name that already carries an
//! `:generateContent` suffix must not be doubled up, and must not fall back
//! to any configured default model -- the bug class `auth::model_name`
//! exists to close off.

use gemini_client::auth::coordinator::{coordinate, PerCallAuthOpts};
use gemini_client::auth::TokenCache;
use gemini_client::config::AuthConfig;

#[tokio::test]
async fn s6_explicit_model_suffix_is_not_doubled_or_defaulted() {
    let config = AuthConfig::ApiKey {
        api_key: "AIza-test-key".to_string(),
    };
    let opts = PerCallAuthOpts::default();
    let token_cache = TokenCache::new(reqwest::Client::new());
    let coordinated = coordinate(&config, &opts, &token_cache).await.unwrap();

    let path = coordinated
        .strategy
        .path("gemini-3-pro-preview:generateContent", "generateContent", &coordinated.credentials)
        .unwrap();

    assert_eq!(path, "v1beta/models/gemini-3-pro-preview:generateContent");
    assert_eq!(path.matches(":generateContent").count(), 1, "the endpoint suffix must appear exactly once");
    assert!(!path.contains("gemini-flash-lite-latest"), "the default model must never be substituted for an explicit one");
}
