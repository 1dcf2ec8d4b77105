//! Scenario S4 (spec §8): a pre-flight token-budget rejection must return
//! `over_budget` in non-blocking mode without ever invoking the wrapped
//! operation (no HTTP request issued, no permit acquired).

use gemini_client::config::RateLimitProfile;
use gemini_client::error::GeminiError;
use gemini_client::http_client::HttpErrorEnvelope;
use gemini_client::rate_limit::{ExecuteOpts, RateLimiter, Usage};
use gemini_client::state_store::StateStoreHandle;
use std::sync::atomic::{AtomicUsize, Ordering};

#[tokio::test]
async fn s4_over_budget_rejects_before_any_request() {
    let state_store = StateStoreHandle::spawn().await.unwrap();
    let limiter = RateLimiter::new(state_store.clone());

    let mut profile = RateLimitProfile::free_tier();
    profile.token_budget_per_window = 1000;
    profile.window_duration_ms = 60_000;
    profile.non_blocking = true;

    let opts = ExecuteOpts {
        estimated_input_tokens: Some(1500),
        ..Default::default()
    };

    let op_calls = AtomicUsize::new(0);
    let err = limiter
        .execute("gemini-2.5-flash", &profile, &opts, || 1500, || {
            op_calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HttpErrorEnvelope>((serde_json::json!({}), Usage::default())) }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, GeminiError::OverBudget { ref model } if model == "gemini-2.5-flash"));
    assert_eq!(op_calls.load(Ordering::SeqCst), 0, "no request may be issued once the pre-flight budget check rejects");

    let snapshot = state_store.snapshot("gemini-2.5-flash").await.unwrap();
    assert_eq!(snapshot.active_permits, 0, "no permit may be acquired once the pre-flight budget check rejects");
}
