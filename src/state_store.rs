//! State Store (spec §4.D): a shared map-of-maps keyed by model, with every
//! update atomic with respect to concurrent accessors. Implemented as a
//! ractor actor — the mailbox serializes every mutation, exactly mirroring
//! the shape of the reference implementation's `CredentialsActor`: a private
//! state struct with helper methods, a public `Handle` wrapping `ActorRef`,
//! and `ractor::call!`/`ractor::cast!` for RPC vs fire-and-forget.

use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Per-model rate-limit bookkeeping (spec §3 `RateLimitState`).
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub active_permits: u32,
    pub retry_until: Option<DateTime<Utc>>,
    pub window_start: DateTime<Utc>,
    pub tokens_consumed: u64,
    pub recent_429_count: u32,
}

impl RateLimitState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            active_permits: 0,
            retry_until: None,
            window_start: now,
            tokens_consumed: 0,
            recent_429_count: 0,
        }
    }

    fn roll_window(&mut self, now: DateTime<Utc>, window_ms: u64) {
        if (now - self.window_start).num_milliseconds() >= window_ms as i64 {
            self.window_start = now;
            self.tokens_consumed = 0;
        }
    }
}

#[derive(Debug)]
pub enum AcquireOutcome {
    Ok,
    Full,
}

pub enum StateStoreMessage {
    Acquire {
        model: String,
        max: u32,
        reply: RpcReplyPort<AcquireOutcome>,
    },
    Release {
        model: String,
    },
    SetRetry {
        model: String,
        until: DateTime<Utc>,
        metadata: Option<Value>,
    },
    ClearRetryIfElapsed {
        model: String,
    },
    RecordUsage {
        model: String,
        tokens: u64,
        window_ms: u64,
    },
    WouldExceedBudget {
        model: String,
        tokens: u64,
        budget: u64,
        window_ms: u64,
        reply: RpcReplyPort<bool>,
    },
    RetryUntil {
        model: String,
        reply: RpcReplyPort<Option<DateTime<Utc>>>,
    },
    Snapshot {
        model: String,
        reply: RpcReplyPort<RateLimitState>,
    },
}

/// Handle for interacting with the state-store actor.
#[derive(Clone)]
pub struct StateStoreHandle {
    actor: ActorRef<StateStoreMessage>,
}

impl StateStoreHandle {
    pub async fn spawn() -> Result<Self, ActorProcessingErr> {
        let (actor, _join) = Actor::spawn(None, StateStoreActor, ()).await?;
        Ok(Self { actor })
    }

    pub async fn acquire(&self, model: impl Into<String>, max: u32) -> Result<AcquireOutcome, ractor::RactorErr<StateStoreMessage>> {
        ractor::call!(
            self.actor,
            StateStoreMessage::Acquire,
            model.into(),
            max
        )
    }

    pub async fn release(&self, model: impl Into<String>) {
        let _ = ractor::cast!(self.actor, StateStoreMessage::Release { model: model.into() });
    }

    pub async fn set_retry(&self, model: impl Into<String>, until: DateTime<Utc>, metadata: Option<Value>) {
        let _ = ractor::cast!(
            self.actor,
            StateStoreMessage::SetRetry {
                model: model.into(),
                until,
                metadata
            }
        );
    }

    pub async fn clear_retry_if_elapsed(&self, model: impl Into<String>) {
        let _ = ractor::cast!(
            self.actor,
            StateStoreMessage::ClearRetryIfElapsed { model: model.into() }
        );
    }

    pub async fn record_usage(&self, model: impl Into<String>, tokens: u64, window_ms: u64) {
        let _ = ractor::cast!(
            self.actor,
            StateStoreMessage::RecordUsage {
                model: model.into(),
                tokens,
                window_ms
            }
        );
    }

    pub async fn would_exceed_budget(
        &self,
        model: impl Into<String>,
        tokens: u64,
        budget: u64,
        window_ms: u64,
    ) -> Result<bool, ractor::RactorErr<StateStoreMessage>> {
        ractor::call!(
            self.actor,
            StateStoreMessage::WouldExceedBudget,
            model.into(),
            tokens,
            budget,
            window_ms
        )
    }

    pub async fn retry_until(
        &self,
        model: impl Into<String>,
    ) -> Result<Option<DateTime<Utc>>, ractor::RactorErr<StateStoreMessage>> {
        ractor::call!(self.actor, StateStoreMessage::RetryUntil, model.into())
    }

    pub async fn snapshot(&self, model: impl Into<String>) -> Result<RateLimitState, ractor::RactorErr<StateStoreMessage>> {
        ractor::call!(self.actor, StateStoreMessage::Snapshot, model.into())
    }
}

struct StateStoreState {
    models: HashMap<String, RateLimitState>,
}

impl StateStoreState {
    fn entry(&mut self, model: &str) -> &mut RateLimitState {
        self.models
            .entry(model.to_string())
            .or_insert_with(|| RateLimitState::new(Utc::now()))
    }
}

struct StateStoreActor;

#[ractor::async_trait]
impl Actor for StateStoreActor {
    type Msg = StateStoreMessage;
    type State = StateStoreState;
    type Arguments = ();

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        _arguments: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(StateStoreState {
            models: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            StateStoreMessage::Acquire { model, max, reply } => {
                let entry = state.entry(&model);
                let outcome = if entry.active_permits < max {
                    entry.active_permits += 1;
                    AcquireOutcome::Ok
                } else {
                    AcquireOutcome::Full
                };
                let _ = reply.send(outcome);
            }
            StateStoreMessage::Release { model } => {
                let entry = state.entry(&model);
                entry.active_permits = entry.active_permits.saturating_sub(1);
            }
            StateStoreMessage::SetRetry { model, until, metadata } => {
                debug!(model = %model, ?until, ?metadata, "retry embargo set");
                let entry = state.entry(&model);
                entry.retry_until = Some(until);
                entry.recent_429_count += 1;
            }
            StateStoreMessage::ClearRetryIfElapsed { model } => {
                let now = Utc::now();
                let entry = state.entry(&model);
                if entry.retry_until.is_some_and(|until| now >= until) {
                    entry.retry_until = None;
                }
            }
            StateStoreMessage::RecordUsage { model, tokens, window_ms } => {
                let now = Utc::now();
                let entry = state.entry(&model);
                entry.roll_window(now, window_ms);
                entry.tokens_consumed += tokens;
            }
            StateStoreMessage::WouldExceedBudget {
                model,
                tokens,
                budget,
                window_ms,
                reply,
            } => {
                let now = Utc::now();
                let entry = state.entry(&model);
                entry.roll_window(now, window_ms);
                let _ = reply.send(entry.tokens_consumed + tokens > budget);
            }
            StateStoreMessage::RetryUntil { model, reply } => {
                let entry = state.entry(&model);
                let _ = reply.send(entry.retry_until);
            }
            StateStoreMessage::Snapshot { model, reply } => {
                let entry = state.entry(&model).clone();
                let _ = reply.send(entry);
            }
        }
        Ok(())
    }
}
