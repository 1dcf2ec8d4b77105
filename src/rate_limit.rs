//! Rate-Limit Manager (spec §4.G): composes the State Store, Concurrency
//! Gate, Retry Manager and Token Estimator behind a single `execute` entry
//! point, the five-step pipeline described in spec §4.G.

use crate::concurrency::{ConcurrencyGate, Permit};
use crate::config::RateLimitProfile;
use crate::error::GeminiError;
use crate::http_client::HttpErrorEnvelope;
use crate::retry::{self, Classification};
use crate::state_store::StateStoreHandle;
use crate::token_estimator;
use chrono::Utc;
use gemini_client_schema::Part;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

/// Per-call knobs layered on top of a resolved [`RateLimitProfile`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOpts {
    pub estimated_input_tokens: Option<u64>,
    pub token_budget_per_window: Option<u64>,
    pub non_blocking: Option<bool>,
    pub acquire_timeout: Option<Duration>,
}

impl ExecuteOpts {
    pub fn estimate_from_parts(parts: &[Part]) -> u64 {
        token_estimator::estimate_parts(parts)
    }
}

/// Usage actually consumed by a completed operation, if the server reported
/// it; falls back to the pre-flight estimate when absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub total_tokens: Option<u64>,
}

pub struct RateLimiter {
    state_store: StateStoreHandle,
    concurrency: ConcurrencyGate,
}

impl RateLimiter {
    pub fn new(state_store: StateStoreHandle) -> Self {
        let concurrency = ConcurrencyGate::new(state_store.clone());
        Self {
            state_store,
            concurrency,
        }
    }

    /// Runs `op` under the full pipeline: retry-embargo check, budget
    /// pre-check, permit acquire, run-with-retry, usage record and release.
    ///
    /// `op` returns `Ok((value, usage))` on a 2xx, or `Err(HttpErrorEnvelope)`
    /// for the Retry Manager to classify.
    pub async fn execute<T, F, Fut>(
        &self,
        model: &str,
        profile: &RateLimitProfile,
        opts: &ExecuteOpts,
        estimate_input: impl FnOnce() -> u64,
        mut op: F,
    ) -> Result<T, GeminiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(T, Usage), HttpErrorEnvelope>>,
    {
        let non_blocking = opts.non_blocking.unwrap_or(profile.non_blocking);

        // Step 1: retry-embargo check.
        self.state_store.clear_retry_if_elapsed(model).await;
        if let Some(retry_until) = self.state_store.retry_until(model).await.unwrap_or(None) {
            let now = Utc::now();
            if retry_until > now {
                if non_blocking {
                    return Err(GeminiError::OverEmbargo {
                        model: model.to_string(),
                    });
                }
                let wait = (retry_until - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
            }
        }

        // Step 2: budget pre-check.
        if !profile.disable_rate_limiter {
            let estimated = opts.estimated_input_tokens.unwrap_or_else(estimate_input);
            let budget = opts
                .token_budget_per_window
                .unwrap_or(profile.token_budget_per_window);
            let would_exceed = self
                .state_store
                .would_exceed_budget(model, estimated, budget, profile.window_duration_ms)
                .await
                .unwrap_or(false);
            if would_exceed {
                if non_blocking {
                    return Err(GeminiError::OverBudget {
                        model: model.to_string(),
                    });
                }
                tokio::time::sleep(Duration::from_millis(profile.window_duration_ms)).await;
            }
        }

        // Step 3: permit acquire.
        let (_liveness_tx, liveness_rx) = oneshot::channel();
        let permit = if non_blocking {
            self.concurrency
                .try_acquire(model, profile.max_concurrency_per_model, liveness_rx)
                .await?
        } else {
            self.concurrency
                .acquire(
                    model,
                    profile.max_concurrency_per_model,
                    liveness_rx,
                    opts.acquire_timeout,
                )
                .await?
        };

        // Step 4: run with retry.
        let mut attempt: u32 = 0;
        let outcome = loop {
            match op().await {
                Ok((value, usage)) => break Ok((value, usage)),
                Err(envelope) => {
                    let classification = retry::classify(
                        envelope.http_status,
                        envelope.details.as_ref(),
                        attempt,
                        profile.base_backoff_ms,
                        profile.jitter_factor,
                    );
                    match classification {
                        Classification::Ok => unreachable!("classify never returns Ok for an error envelope"),
                        Classification::Retry { after_ms, .. } => {
                            attempt += 1;
                            if attempt >= profile.max_attempts {
                                break Err(envelope);
                            }
                            if envelope.http_status == 429 {
                                let until = Utc::now() + chrono::Duration::milliseconds(after_ms as i64);
                                self.state_store.set_retry(model, until, envelope.details.clone()).await;
                            }
                            warn!(model, attempt, after_ms, "retrying after classified error");
                            tokio::time::sleep(Duration::from_millis(after_ms)).await;
                        }
                        Classification::Fatal => break Err(envelope),
                    }
                }
            }
        };

        // Step 5: usage record & release, exactly once regardless of outcome.
        let estimate_fallback = opts.estimated_input_tokens.unwrap_or_else(estimate_input);
        let tokens_consumed = match &outcome {
            Ok((_, usage)) => usage.total_tokens.unwrap_or(estimate_fallback),
            Err(_) => estimate_fallback,
        };
        self.state_store
            .record_usage(model, tokens_consumed, profile.window_duration_ms)
            .await;
        permit.release().await;

        outcome.map(|(value, _)| value).map_err(GeminiError::from)
    }

    /// Runs steps 1-3 of the pipeline (retry-embargo check, budget
    /// pre-check, permit acquire) for a streaming call and hands back a
    /// [`StreamLease`] (spec §4.G `execute_streaming`, SPEC_FULL §3 4.G).
    /// A streaming call's body can fail mid-flight in ways a unary
    /// non-2xx response never does, so retry and usage recording for the
    /// run itself stay with the SSE Stream Runner and Streaming Manager;
    /// this only reserves the slot and hands back the means to release it.
    pub async fn execute_streaming(
        &self,
        model: &str,
        profile: &RateLimitProfile,
        opts: &ExecuteOpts,
        estimate_input: impl FnOnce() -> u64,
    ) -> Result<StreamLease, GeminiError> {
        let non_blocking = opts.non_blocking.unwrap_or(profile.non_blocking);

        self.state_store.clear_retry_if_elapsed(model).await;
        if let Some(retry_until) = self.state_store.retry_until(model).await.unwrap_or(None) {
            let now = Utc::now();
            if retry_until > now {
                if non_blocking {
                    return Err(GeminiError::OverEmbargo {
                        model: model.to_string(),
                    });
                }
                let wait = (retry_until - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
            }
        }

        let estimated = opts.estimated_input_tokens.unwrap_or_else(estimate_input);
        if !profile.disable_rate_limiter {
            let budget = opts
                .token_budget_per_window
                .unwrap_or(profile.token_budget_per_window);
            let would_exceed = self
                .state_store
                .would_exceed_budget(model, estimated, budget, profile.window_duration_ms)
                .await
                .unwrap_or(false);
            if would_exceed {
                if non_blocking {
                    return Err(GeminiError::OverBudget {
                        model: model.to_string(),
                    });
                }
                tokio::time::sleep(Duration::from_millis(profile.window_duration_ms)).await;
            }
        }

        // Kept alive for the lease's whole lifetime rather than dropped
        // immediately, so the permit's holder watcher only fires if the
        // lease itself is dropped without an explicit `release` -- the
        // streaming analogue of `execute`'s function-scoped `_liveness_tx`.
        let (liveness_tx, liveness_rx) = oneshot::channel();
        let permit = if non_blocking {
            self.concurrency
                .try_acquire(model, profile.max_concurrency_per_model, liveness_rx)
                .await?
        } else {
            self.concurrency
                .acquire(
                    model,
                    profile.max_concurrency_per_model,
                    liveness_rx,
                    opts.acquire_timeout,
                )
                .await?
        };

        Ok(StreamLease {
            permit,
            state_store: self.state_store.clone(),
            model: model.to_string(),
            estimated_tokens: estimated,
            window_duration_ms: profile.window_duration_ms,
            released: Arc::new(AtomicBool::new(false)),
            _liveness_tx: liveness_tx,
        })
    }
}

/// A concurrency permit and pre-flight budget reservation held open for one
/// streaming call. The Streaming Manager calls [`StreamLease::release`]
/// exactly once, on `Complete`/`Error`/abort -- the streaming equivalent of
/// `execute`'s step 5 (usage record and permit release).
pub struct StreamLease {
    permit: Permit,
    state_store: StateStoreHandle,
    model: String,
    estimated_tokens: u64,
    window_duration_ms: u64,
    released: Arc<AtomicBool>,
    _liveness_tx: oneshot::Sender<()>,
}

impl StreamLease {
    /// Records actual usage if known (falling back to the pre-flight
    /// estimate) and releases the held permit. Safe to call more than once;
    /// only the first call has an effect.
    pub async fn release(&self, usage: Usage) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let tokens = usage.total_tokens.unwrap_or(self.estimated_tokens);
        self.state_store
            .record_usage(&self.model, tokens, self.window_duration_ms)
            .await;
        self.permit.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn free_tier() -> RateLimitProfile {
        RateLimitProfile::free_tier()
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_and_records_usage() {
        let state_store = StateStoreHandle::spawn().await.unwrap();
        let limiter = RateLimiter::new(state_store.clone());
        let profile = free_tier();

        let result = limiter
            .execute(
                "gemini-2.5-flash",
                &profile,
                &ExecuteOpts::default(),
                || 10,
                || async { Ok::<_, HttpErrorEnvelope>((42, Usage { total_tokens: Some(5) })) },
            )
            .await
            .unwrap();

        assert_eq!(result, 42);
        let snapshot = state_store.snapshot("gemini-2.5-flash").await.unwrap();
        assert_eq!(snapshot.tokens_consumed, 5);
        assert_eq!(snapshot.active_permits, 0);
    }

    #[tokio::test]
    async fn retries_429_then_succeeds_and_updates_retry_until() {
        let state_store = StateStoreHandle::spawn().await.unwrap();
        let limiter = RateLimiter::new(state_store.clone());
        let mut profile = free_tier();
        profile.base_backoff_ms = 1;

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = limiter
            .execute(
                "gemini-2.5-flash",
                &profile,
                &ExecuteOpts::default(),
                || 10,
                move || {
                    let attempts = attempts_clone.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                            let details = serde_json::json!({
                                "error": {
                                    "details": [{
                                        "@type": "type.googleapis.com/google.rpc.RetryInfo",
                                        "retryDelay": "0s",
                                    }]
                                }
                            });
                            Err(HttpErrorEnvelope {
                                http_status: 429,
                                message: "rate limited".to_string(),
                                details: Some(details),
                            })
                        } else {
                            Ok((1, Usage::default()))
                        }
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(result, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_error_releases_permit_and_does_not_retry() {
        let state_store = StateStoreHandle::spawn().await.unwrap();
        let limiter = RateLimiter::new(state_store.clone());
        let profile = free_tier();

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let err = limiter
            .execute(
                "gemini-2.5-flash",
                &profile,
                &ExecuteOpts::default(),
                || 10,
                move || {
                    attempts_clone.fetch_add(1, Ordering::SeqCst);
                    async move {
                        Err::<(i32, Usage), _>(HttpErrorEnvelope {
                            http_status: 400,
                            message: "bad request".to_string(),
                            details: None,
                        })
                    }
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GeminiError::InvalidRequest { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let snapshot = state_store.snapshot("gemini-2.5-flash").await.unwrap();
        assert_eq!(snapshot.active_permits, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_on_429_surface_as_rate_limited_not_invalid_request() {
        let state_store = StateStoreHandle::spawn().await.unwrap();
        let limiter = RateLimiter::new(state_store.clone());
        let mut profile = free_tier();
        profile.base_backoff_ms = 1;
        profile.max_attempts = 3;

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let err = limiter
            .execute(
                "gemini-2.5-flash",
                &profile,
                &ExecuteOpts::default(),
                || 10,
                move || {
                    attempts_clone.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let details = serde_json::json!({
                            "error": {
                                "details": [{
                                    "@type": "type.googleapis.com/google.rpc.RetryInfo",
                                    "retryDelay": "0s",
                                }]
                            }
                        });
                        Err::<(i32, Usage), _>(HttpErrorEnvelope {
                            http_status: 429,
                            message: "rate limited".to_string(),
                            details: Some(details),
                        })
                    }
                },
            )
            .await
            .unwrap_err();

        assert!(
            matches!(err, GeminiError::RateLimited { .. }),
            "an exhausted-retry 429 must surface as RateLimited, not a generic 4xx: got {err:?}"
        );
        assert_eq!(attempts.load(Ordering::SeqCst), profile.max_attempts);
        let snapshot = state_store.snapshot("gemini-2.5-flash").await.unwrap();
        assert_eq!(snapshot.active_permits, 0);
    }
}
