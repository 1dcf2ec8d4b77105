//! Tool Orchestrator (spec §4.K): one instance per auto-tool streaming
//! call, built per-call rather than as a long-lived actor -- its whole
//! lifetime is bounded by a single logical request. Three phases:
//! `awaiting_model_call` -> `executing_tools` -> `awaiting_final_response`.
//!
//! Events are forwarded through the Streaming Manager's own `RunnerEvent`
//! path (`StreamingManagerHandle::forward_runner_event`) rather than a
//! private channel, so a tool-calling stream looks to subscribers exactly
//! like any other stream registered with the manager.

use crate::chat::{Chat, ToolResult as ChatToolResult};
use crate::config::RateLimitProfile;
use crate::error::GeminiError;
use crate::rate_limit::{ExecuteOpts, RateLimiter, Usage};
use crate::sse::SseEvent;
use crate::streaming::{StreamId, StreamingManagerHandle};
use crate::tool_registry::{ToolCall, ToolCallResult, ToolExecutionError, ToolRegistry};
use futures::Stream;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingModelCall,
    ExecutingTools,
    AwaitingFinalResponse,
    Done,
}

/// Runs the full tool-calling loop for one request, driving `open_next_stream`
/// (a caller-supplied closure that opens stream #1/#2/... against the
/// extended Chat) and a [`ToolRegistry`] to execute model-requested calls.
///
/// Every event is forwarded to `streaming` under `stream_id`, so whoever
/// registered that stream (and subscribed to it) sees the whole tool-calling
/// exchange as a single continuous stream.
///
/// Every stream this orchestrator opens -- stream #1 and every re-open after
/// a tool turn -- passes through `RateLimiter::execute_streaming` first (spec
/// §4.G's data-flow invariant that every public call passes through the
/// Rate-Limit Manager before reaching the runner); the held
/// [`crate::rate_limit::StreamLease`] is released exactly once, when that
/// stream reaches `Complete`/`Error`.
pub struct ToolOrchestrator<'a, F> {
    chat: &'a mut Chat,
    registry: Arc<dyn ToolRegistry>,
    streaming: StreamingManagerHandle,
    stream_id: StreamId,
    open_next_stream: F,
    turns_remaining: u32,
    pending_calls: Option<Vec<ToolCall>>,
    rate_limiter: Arc<RateLimiter>,
    profile: RateLimitProfile,
    execute_opts: ExecuteOpts,
    model: String,
}

impl<'a, F, S> ToolOrchestrator<'a, F>
where
    F: FnMut(&Chat) -> S,
    S: Stream<Item = Result<SseEvent, GeminiError>> + Unpin,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat: &'a mut Chat,
        registry: Arc<dyn ToolRegistry>,
        streaming: StreamingManagerHandle,
        stream_id: StreamId,
        open_next_stream: F,
        max_turns: u32,
        rate_limiter: Arc<RateLimiter>,
        profile: RateLimitProfile,
        execute_opts: ExecuteOpts,
        model: String,
    ) -> Self {
        Self {
            chat,
            registry,
            streaming,
            stream_id,
            open_next_stream,
            turns_remaining: max_turns,
            pending_calls: None,
            rate_limiter,
            profile,
            execute_opts,
            model,
        }
    }

    /// Reserves a streaming slot for one call to `open_next_stream`,
    /// forwarding an error event and signalling the caller to stop if the
    /// Rate-Limit Manager rejects it.
    async fn acquire_stream_lease(&self) -> Result<crate::rate_limit::StreamLease, ()> {
        let parts: Vec<gemini_client_schema::Part> =
            self.chat.turns.iter().flat_map(|t| t.parts.clone()).collect();
        match self
            .rate_limiter
            .execute_streaming(&self.model, &self.profile, &self.execute_opts, || {
                ExecuteOpts::estimate_from_parts(&parts)
            })
            .await
        {
            Ok(lease) => Ok(lease),
            Err(e) => {
                self.forward_event(Err(e)).await;
                Err(())
            }
        }
    }

    /// Drives the whole state machine to completion, forwarding events to
    /// the Streaming Manager as each phase dictates.
    pub async fn run(mut self) {
        let mut phase = Phase::AwaitingModelCall;
        while phase != Phase::Done {
            phase = match phase {
                Phase::AwaitingModelCall => self.run_awaiting_model_call().await,
                Phase::ExecutingTools => self.run_executing_tools().await,
                Phase::AwaitingFinalResponse => self.run_awaiting_final_response().await,
                Phase::Done => unreachable!(),
            };
        }
    }

    async fn forward_event(&self, event: Result<SseEvent, GeminiError>) {
        self.streaming.forward_runner_event(self.stream_id, event).await;
    }

    async fn run_awaiting_model_call(&mut self) -> Phase {
        let lease = match self.acquire_stream_lease().await {
            Ok(lease) => lease,
            Err(()) => return Phase::Done,
        };
        let mut stream = (self.open_next_stream)(self.chat);
        let mut buffered: Vec<Value> = Vec::new();
        let mut detected_calls: Vec<ToolCall> = Vec::new();
        let mut model_parts: Vec<gemini_client_schema::Part> = Vec::new();
        let mut usage = Usage::default();

        use futures::StreamExt;
        while let Some(item) = stream.next().await {
            match item {
                Ok(SseEvent::Event(value)) => {
                    usage.total_tokens = extract_usage_tokens(&value).or(usage.total_tokens);
                    let calls = extract_function_calls(&value);
                    if !calls.is_empty() {
                        detected_calls = calls;
                        model_parts = extract_model_parts(&value);
                        break;
                    }
                    buffered.push(value);
                }
                Ok(SseEvent::Complete) => {
                    lease.release(usage).await;
                    for value in buffered.drain(..) {
                        self.forward_event(Ok(SseEvent::Event(value))).await;
                    }
                    self.forward_event(Ok(SseEvent::Complete)).await;
                    return Phase::Done;
                }
                Err(e) => {
                    lease.release(usage).await;
                    self.forward_event(Err(e)).await;
                    return Phase::Done;
                }
            }
        }

        lease.release(usage).await;

        if detected_calls.is_empty() {
            for value in buffered.drain(..) {
                self.forward_event(Ok(SseEvent::Event(value))).await;
            }
            self.forward_event(Ok(SseEvent::Complete)).await;
            return Phase::Done;
        }

        info!(count = detected_calls.len(), "detected function calls; pausing stream #1");
        self.chat.add_model_response(model_parts);
        self.pending_calls = Some(detected_calls);
        Phase::ExecutingTools
    }

    async fn run_executing_tools(&mut self) -> Phase {
        self.turns_remaining = self.turns_remaining.saturating_sub(1);
        if self.turns_remaining == 0 {
            self.forward_event(Err(GeminiError::TurnLimitExceeded)).await;
            return Phase::Done;
        }

        let Some(calls) = self.pending_calls.take() else {
            self.forward_event(Err(GeminiError::InvalidState {
                message: "tool orchestrator entered executing_tools with no pending calls".to_string(),
            }))
            .await;
            return Phase::Done;
        };

        let results = match run_supervised(self.registry.clone(), calls).await {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "tool execution failed");
                self.forward_event(Err(e)).await;
                return Phase::Done;
            }
        };

        self.chat.add_tool_turn(
            results
                .into_iter()
                .map(|r| ChatToolResult {
                    call_id: r.call_id,
                    content: r.content,
                })
                .collect(),
        );

        Phase::AwaitingFinalResponse
    }

    async fn run_awaiting_final_response(&mut self) -> Phase {
        let lease = match self.acquire_stream_lease().await {
            Ok(lease) => lease,
            Err(()) => return Phase::Done,
        };
        let mut stream = (self.open_next_stream)(self.chat);
        let mut usage = Usage::default();
        use futures::StreamExt;
        while let Some(item) = stream.next().await {
            match item {
                Ok(SseEvent::Event(value)) => {
                    usage.total_tokens = extract_usage_tokens(&value).or(usage.total_tokens);
                    let further_calls = extract_function_calls(&value);
                    if !further_calls.is_empty() {
                        lease.release(usage).await;
                        self.chat.add_model_response(extract_model_parts(&value));
                        self.pending_calls = Some(further_calls);
                        return Phase::ExecutingTools;
                    }
                    self.forward_event(Ok(SseEvent::Event(value))).await;
                }
                Ok(SseEvent::Complete) => {
                    lease.release(usage).await;
                    self.forward_event(Ok(SseEvent::Complete)).await;
                    return Phase::Done;
                }
                Err(e) => {
                    lease.release(usage).await;
                    self.forward_event(Err(e)).await;
                    return Phase::Done;
                }
            }
        }
        lease.release(usage).await;
        Phase::Done
    }
}

/// Arguments for the one-shot actor that performs tool execution under
/// supervision, mirroring `concurrency.rs`'s `HolderWatcher`: the work runs
/// inside the actor's own lifecycle rather than a bare `tokio::spawn`, so a
/// stuck or panicking execution is visible to ractor's supervision.
struct ToolExecutionWorkerArgs {
    registry: Arc<dyn ToolRegistry>,
    calls: Vec<ToolCall>,
    reply: oneshot::Sender<Result<Vec<ToolCallResult>, ToolExecutionError>>,
}

struct ToolExecutionWorker;

#[ractor::async_trait]
impl Actor for ToolExecutionWorker {
    type Msg = ();
    type State = ();
    type Arguments = ToolExecutionWorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let ToolExecutionWorkerArgs { registry, calls, reply } = args;
        let result = registry.execute(calls).await;
        let _ = reply.send(result);
        myself.stop(None);
        Ok(())
    }
}

/// Runs `registry.execute(calls)` under a supervised actor (spec §4.K:
/// "Tool execution runs under a supervisor, never as an unsupervised
/// task"). A failure to even start that actor is reported as an
/// `InvalidState` error, which the caller turns into a clean
/// stream-terminating error event rather than propagating a panic or
/// leaving the orchestrator hanging.
async fn run_supervised(
    registry: Arc<dyn ToolRegistry>,
    calls: Vec<ToolCall>,
) -> Result<Vec<ToolCallResult>, GeminiError> {
    let (reply, receiver) = oneshot::channel();

    if let Err(e) = Actor::spawn(
        None,
        ToolExecutionWorker,
        ToolExecutionWorkerArgs { registry, calls, reply },
    )
    .await
    {
        return Err(GeminiError::InvalidState {
            message: format!("failed to start supervised tool execution: {e}"),
        });
    }

    match receiver.await {
        Ok(Ok(results)) => Ok(results),
        Ok(Err(e)) => Err(GeminiError::InvalidState { message: e.to_string() }),
        Err(_) => Err(GeminiError::InvalidState {
            message: "supervised tool execution worker dropped its reply".to_string(),
        }),
    }
}

fn extract_model_parts(value: &Value) -> Vec<gemini_client_schema::Part> {
    value
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|c| c.get("content"))
        .and_then(|content| serde_json::from_value::<gemini_client_schema::Content>(content.clone()).ok())
        .map(|content| content.parts)
        .unwrap_or_default()
}

fn extract_usage_tokens(value: &Value) -> Option<u64> {
    value.get("usageMetadata")?.get("totalTokenCount")?.as_u64()
}

fn extract_function_calls(value: &Value) -> Vec<ToolCall> {
    extract_model_parts(value)
        .into_iter()
        .filter_map(|part| {
            let function_call = part.function_call?;
            let name = function_call.get("name")?.as_str()?.to_string();
            let args = function_call.get("args").cloned().unwrap_or(Value::Null);
            let call_id = function_call
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| name.clone());
            Some(ToolCall { call_id, name, args })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_registry::FunctionDeclaration;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoRegistry {
        calls_seen: AtomicUsize,
    }

    #[async_trait]
    impl ToolRegistry for EchoRegistry {
        fn register(&mut self, _declaration: FunctionDeclaration, _callback: crate::tool_registry::ToolCallback) {}

        async fn execute(&self, calls: Vec<ToolCall>) -> Result<Vec<ToolCallResult>, ToolExecutionError> {
            self.calls_seen.fetch_add(calls.len(), Ordering::SeqCst);
            Ok(calls
                .into_iter()
                .map(|c| ToolCallResult {
                    call_id: c.call_id,
                    content: serde_json::json!({"ok": true}),
                    is_error: false,
                })
                .collect())
        }

        fn declarations(&self) -> Vec<FunctionDeclaration> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn supervised_execution_returns_results() {
        let registry: Arc<dyn ToolRegistry> = Arc::new(EchoRegistry {
            calls_seen: AtomicUsize::new(0),
        });
        let calls = vec![ToolCall {
            call_id: "call-1".to_string(),
            name: "get_weather".to_string(),
            args: Value::Null,
        }];
        let results = run_supervised(registry, calls).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].call_id, "call-1");
    }

    #[test]
    fn extracts_function_calls_with_fallback_call_id() {
        let value = serde_json::json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{"functionCall": {"name": "get_weather", "args": {"city": "nyc"}}}]
                }
            }]
        });
        let calls = extract_function_calls(&value);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].call_id, "get_weather");
    }
}
