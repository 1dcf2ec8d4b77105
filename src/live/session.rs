//! Live Session (spec §4.L): one long-lived WebSocket connection per
//! session, modeled the same way the reference implementation models its
//! other stateful services -- a private actor state, a public `Handle`
//! wrapping `ActorRef`. The frame-reading loop runs as its own supervised
//! actor (`LiveSessionReader`) rather than a bare `tokio::spawn`, since
//! spec §5 lists the session loop among the long-running tasks that must
//! be spawned under a named supervisor.

use super::wire::{
    ClientContentMessage, ClientMessage, ServerEvent, SessionResumptionConfig, SetupMessage, ToolCallRequest,
    ToolResponseMessage, parse_server_event,
};
use crate::auth::coordinator::{PerCallAuthOpts, coordinate};
use crate::auth::TokenCache;
use crate::config::AuthConfig;
use crate::error::GeminiError;
use futures::{SinkExt, StreamExt};
use gemini_client_schema::Content;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;
type WsSource = futures::stream::SplitStream<WsStream>;

/// Upper bound on consecutive reconnect attempts before the session gives up
/// and tears down (spec §4.L "retryable transport errors ... trigger
/// reconnection attempts with `{attempts, delay, backoff}` policy").
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BASE_BACKOFF_MS: u64 = 500;

/// Whether a reader disconnect reason is one of the transport failures spec
/// §4.L lists as retryable (timeout, closed, econnrefused, econnreset,
/// etimedout, upgrade_timeout). Anything else -- a protocol violation, an
/// auth rejection surfaced as a close reason, a malformed handshake -- is
/// treated as non-retryable and aborts the session.
fn is_retryable_disconnect(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    ["timeout", "closed", "econnrefused", "econnreset", "etimedout", "upgrade_timeout"]
        .iter()
        .any(|needle| reason.contains(needle))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Ready,
    Closing,
    Closed,
}

/// Events surfaced to the application. Tool-response sending is a
/// deliberate deviation from a synchronous callback-return shape: the
/// caller reacts to `ToolCall` by calling `LiveSessionHandle::send_tool_response`
/// itself, an async method that only ever casts to the actor's mailbox.
/// That sidesteps the "self-send path must not deadlock" hazard entirely
/// rather than having to reason about it inside `handle`.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    Ready,
    ServerContent(Value),
    ToolCall(Vec<ToolCallRequest>),
    ToolCallCancellation(Vec<String>),
    SessionResumptionUpdate { new_handle: String, resumable: bool },
    GoAway { time_left_ms: Option<u64>, handle: Option<String> },
    UsageMetadata(Value),
    Disconnected { reason: String },
}

/// Options the caller supplies for the initial `setup` frame.
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    pub generation_config: Option<Value>,
    pub system_instruction: Option<Content>,
    pub tools: Option<Vec<Value>>,
    pub realtime_input_config: Option<Value>,
    pub context_window_compression: Option<Value>,
    pub audio_transcription_config: Option<Value>,
    pub proactivity: Option<Value>,
}

pub enum LiveSessionMessage {
    SendClientContent {
        turns: Vec<Content>,
        turn_complete: bool,
    },
    SendRealtimeInput {
        input: Value,
    },
    SendToolResponse {
        responses: Vec<Value>,
    },
    Close,
    FrameReceived(Value),
    ReaderDisconnected(String),
    Status {
        reply: RpcReplyPort<SessionStatus>,
    },
    SessionHandle {
        reply: RpcReplyPort<Option<String>>,
    },
}

#[derive(Clone)]
pub struct LiveSessionHandle {
    actor: ActorRef<LiveSessionMessage>,
}

impl LiveSessionHandle {
    pub async fn send_client_content(&self, turns: Vec<Content>, turn_complete: bool) {
        let _ = ractor::cast!(
            self.actor,
            LiveSessionMessage::SendClientContent { turns, turn_complete }
        );
    }

    pub async fn send_realtime_input(&self, input: Value) {
        let _ = ractor::cast!(self.actor, LiveSessionMessage::SendRealtimeInput { input });
    }

    pub async fn send_tool_response(&self, responses: Vec<Value>) {
        let _ = ractor::cast!(self.actor, LiveSessionMessage::SendToolResponse { responses });
    }

    pub async fn close(&self) {
        let _ = ractor::cast!(self.actor, LiveSessionMessage::Close);
    }

    pub async fn status(&self) -> SessionStatus {
        ractor::call!(self.actor, LiveSessionMessage::Status).unwrap_or(SessionStatus::Closed)
    }

    pub async fn session_handle(&self) -> Option<String> {
        ractor::call!(self.actor, LiveSessionMessage::SessionHandle).unwrap_or(None)
    }
}

/// Opens a Live session against either backend. Validates Vertex's
/// `project_id` requirement before any network activity (spec §4.L
/// "Validation").
///
/// `ws_url_override` replaces the computed endpoint wholesale when present,
/// the same escape hatch the closest reference implementation's Gemini Live
/// client exposes as `with_base_url` -- it is how a caller points the
/// session at a local WebSocket server under test instead of the real
/// Google endpoint.
pub async fn connect(
    config: &AuthConfig,
    opts: &PerCallAuthOpts,
    token_cache: &TokenCache,
    model: &str,
    setup_opts: SetupOptions,
    resumption_handle: Option<String>,
    ws_url_override: Option<&str>,
) -> Result<(LiveSessionHandle, mpsc::UnboundedReceiver<LiveEvent>), GeminiError> {
    let request = build_ws_request(config, opts, token_cache, ws_url_override).await?;

    let setup = build_setup_message(model, &setup_opts, resumption_handle.clone());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let args = ConnectArgs {
        request,
        setup,
        resumption_handle,
        events: events_tx,
        reconnect: ReconnectMaterial {
            config: config.clone(),
            opts: opts.clone(),
            token_cache: token_cache.clone(),
            model: model.to_string(),
            setup_opts,
            ws_url_override: ws_url_override.map(str::to_string),
        },
    };
    let (actor, _join) = Actor::spawn(None, LiveSessionActor, args)
        .await
        .map_err(|e| GeminiError::InvalidState {
            message: format!("failed to start live session actor: {e}"),
        })?;

    Ok((LiveSessionHandle { actor }, events_rx))
}

/// Resolves auth and builds the `tokio-tungstenite` client request for
/// either backend. Shared between the initial `connect()` and a
/// `LiveSessionActor`'s own reconnection attempts, so both paths re-resolve
/// credentials (an OAuth2 access token can expire over a long-lived session)
/// the same way.
async fn build_ws_request(
    config: &AuthConfig,
    opts: &PerCallAuthOpts,
    token_cache: &TokenCache,
    ws_url_override: Option<&str>,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, GeminiError> {
    let coordinated = coordinate(config, opts, token_cache).await?;

    let is_vertex = coordinated.credentials.access_token.is_some();
    let url = if let Some(override_url) = ws_url_override {
        override_url.to_string()
    } else if is_vertex {
        let project_id = coordinated.credentials.project_id.clone().unwrap_or_default();
        let location = coordinated.credentials.location.clone().unwrap_or_default();
        if project_id.is_empty() {
            return Err(GeminiError::InvalidState {
                message: "project_id_required_for_vertex_ai".to_string(),
            });
        }
        format!(
            "wss://{location}-aiplatform.googleapis.com/ws/google.cloud.aiplatform.v1beta1.LlmBidiService/BidiGenerateContent?project_id={project_id}"
        )
    } else {
        let api_key = coordinated.credentials.api_key.clone().unwrap_or_default();
        format!(
            "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent?key={api_key}"
        )
    };

    let mut request = url
        .into_client_request()
        .map_err(|e| GeminiError::InvalidState {
            message: format!("failed to build websocket request: {e}"),
        })?;
    if is_vertex {
        for (name, value) in &coordinated.headers {
            if let Ok(header_value) = value.parse() {
                request.headers_mut().insert(*name, header_value);
            }
        }
    }

    Ok(request)
}

fn build_setup_message(model: &str, setup_opts: &SetupOptions, resumption_handle: Option<String>) -> SetupMessage {
    SetupMessage {
        model: model.to_string(),
        generation_config: setup_opts.generation_config.clone(),
        system_instruction: setup_opts.system_instruction.clone(),
        tools: setup_opts.tools.clone(),
        realtime_input_config: setup_opts.realtime_input_config.clone(),
        session_resumption: Some(SessionResumptionConfig { handle: resumption_handle }),
        context_window_compression: setup_opts.context_window_compression.clone(),
        audio_transcription_config: setup_opts.audio_transcription_config.clone(),
        proactivity: setup_opts.proactivity.clone(),
    }
}

/// Everything a `LiveSessionActor` needs to rebuild its connection from
/// scratch on a retryable disconnect, without the caller's involvement.
struct ReconnectMaterial {
    config: AuthConfig,
    opts: PerCallAuthOpts,
    token_cache: TokenCache,
    model: String,
    setup_opts: SetupOptions,
    ws_url_override: Option<String>,
}

struct ConnectArgs {
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
    setup: SetupMessage,
    resumption_handle: Option<String>,
    events: mpsc::UnboundedSender<LiveEvent>,
    reconnect: ReconnectMaterial,
}

struct LiveSessionState {
    status: SessionStatus,
    sink: WsSink,
    pending_sends: VecDeque<ClientMessage>,
    session_handle: Option<String>,
    tool_calls_awaiting_response: HashMap<String, Instant>,
    events: mpsc::UnboundedSender<LiveEvent>,
    reconnect: ReconnectMaterial,
    reconnect_attempts: u32,
}

struct LiveSessionActor;

#[ractor::async_trait]
impl Actor for LiveSessionActor {
    type Msg = LiveSessionMessage;
    type State = LiveSessionState;
    type Arguments = ConnectArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let (ws_stream, _response) = connect_async(args.request)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("live session websocket connect failed: {e}")))?;
        let (mut sink, source) = ws_stream.split();

        let setup_frame = ClientMessage {
            setup: Some(args.setup),
            ..Default::default()
        };
        let text = serde_json::to_string(&setup_frame)
            .map_err(|e| ActorProcessingErr::from(format!("setup frame serialize failed: {e}")))?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| ActorProcessingErr::from(format!("setup frame send failed: {e}")))?;

        Actor::spawn(
            None,
            LiveSessionReader,
            ReaderArgs {
                stream: source,
                parent: myself.clone(),
            },
        )
        .await
        .map_err(|e| ActorProcessingErr::from(format!("failed to start live session reader: {e}")))?;

        Ok(LiveSessionState {
            status: SessionStatus::Connecting,
            sink,
            pending_sends: VecDeque::new(),
            session_handle: args.resumption_handle,
            tool_calls_awaiting_response: HashMap::new(),
            events: args.events,
            reconnect: args.reconnect,
            reconnect_attempts: 0,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            LiveSessionMessage::SendClientContent { turns, turn_complete } => {
                self.enqueue_or_send(
                    state,
                    ClientMessage {
                        client_content: Some(ClientContentMessage { turns, turn_complete }),
                        ..Default::default()
                    },
                )
                .await;
            }
            LiveSessionMessage::SendRealtimeInput { input } => {
                self.enqueue_or_send(
                    state,
                    ClientMessage {
                        realtime_input: Some(input),
                        ..Default::default()
                    },
                )
                .await;
            }
            LiveSessionMessage::SendToolResponse { responses } => {
                for response in &responses {
                    if let Some(id) = response.get("id").and_then(Value::as_str) {
                        state.tool_calls_awaiting_response.remove(id);
                    }
                }
                self.enqueue_or_send(
                    state,
                    ClientMessage {
                        tool_response: Some(ToolResponseMessage {
                            function_responses: responses,
                        }),
                        ..Default::default()
                    },
                )
                .await;
            }
            LiveSessionMessage::Close => {
                state.status = SessionStatus::Closing;
                let _ = state.sink.send(Message::Close(None)).await;
                state.status = SessionStatus::Closed;
                let _ = state.events.send(LiveEvent::Disconnected {
                    reason: "closed by caller".to_string(),
                });
                myself.stop(None);
            }
            LiveSessionMessage::FrameReceived(value) => {
                self.handle_frame(state, value).await;
            }
            LiveSessionMessage::ReaderDisconnected(reason) => {
                if state.status == SessionStatus::Closing {
                    state.status = SessionStatus::Closed;
                    let _ = state.events.send(LiveEvent::Disconnected { reason });
                    myself.stop(None);
                    return Ok(());
                }

                warn!(%reason, "live session reader disconnected");

                if is_retryable_disconnect(&reason) && state.reconnect_attempts < MAX_RECONNECT_ATTEMPTS {
                    state.reconnect_attempts += 1;
                    let delay_ms = RECONNECT_BASE_BACKOFF_MS * 2u64.pow(state.reconnect_attempts - 1);
                    info!(
                        attempt = state.reconnect_attempts,
                        delay_ms, "live session attempting reconnect after retryable disconnect"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                    match self.reconnect(&myself, state).await {
                        Ok(()) => {
                            state.reconnect_attempts = 0;
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(error = %e, attempt = state.reconnect_attempts, "live session reconnect attempt failed");
                        }
                    }
                }

                state.status = SessionStatus::Closed;
                let _ = state.events.send(LiveEvent::Disconnected { reason });
                myself.stop(None);
            }
            LiveSessionMessage::Status { reply } => {
                let _ = reply.send(state.status);
            }
            LiveSessionMessage::SessionHandle { reply } => {
                let _ = reply.send(state.session_handle.clone());
            }
        }
        Ok(())
    }
}

impl LiveSessionActor {
    /// Rebuilds the socket in place and resends `setup` carrying the
    /// session's current `session_handle`, so a resumable session picks up
    /// where it left off (spec §4.L: reconnection reuses
    /// `sessionResumption.handle`). On success the caller's `ActorRef` and
    /// `LiveSessionHandle` are untouched -- only `state.sink` and the
    /// spawned `LiveSessionReader` are swapped.
    async fn reconnect(
        &self,
        myself: &ActorRef<LiveSessionMessage>,
        state: &mut LiveSessionState,
    ) -> Result<(), GeminiError> {
        let request = build_ws_request(
            &state.reconnect.config,
            &state.reconnect.opts,
            &state.reconnect.token_cache,
            state.reconnect.ws_url_override.as_deref(),
        )
        .await?;

        let (ws_stream, _response) = connect_async(request).await?;
        let (mut sink, source) = ws_stream.split();

        let setup = build_setup_message(&state.reconnect.model, &state.reconnect.setup_opts, state.session_handle.clone());
        let setup_frame = ClientMessage {
            setup: Some(setup),
            ..Default::default()
        };
        send_frame(&mut sink, &setup_frame).await?;

        Actor::spawn(
            None,
            LiveSessionReader,
            ReaderArgs {
                stream: source,
                parent: myself.clone(),
            },
        )
        .await
        .map_err(|e| GeminiError::InvalidState {
            message: format!("failed to restart live session reader after reconnect: {e}"),
        })?;

        state.sink = sink;
        state.status = SessionStatus::Connecting;
        Ok(())
    }

    /// Sends immediately when `ready`, otherwise queues (spec §4.L: "Until
    /// then, all send calls queue"). Queued sends are drained in FIFO order
    /// the moment `setupComplete` arrives.
    async fn enqueue_or_send(&self, state: &mut LiveSessionState, message: ClientMessage) {
        if state.status == SessionStatus::Ready {
            if let Err(e) = send_frame(&mut state.sink, &message).await {
                warn!(error = %e, "failed to send live session frame");
            }
        } else {
            state.pending_sends.push_back(message);
        }
    }

    async fn handle_frame(&self, state: &mut LiveSessionState, value: Value) {
        match parse_server_event(value) {
            ServerEvent::SetupComplete => {
                state.status = SessionStatus::Ready;
                let _ = state.events.send(LiveEvent::Ready);
                while let Some(pending) = state.pending_sends.pop_front() {
                    if let Err(e) = send_frame(&mut state.sink, &pending).await {
                        warn!(error = %e, "failed to drain queued live session frame");
                        break;
                    }
                }
            }
            ServerEvent::ServerContent(content) => {
                let _ = state.events.send(LiveEvent::ServerContent(content));
            }
            ServerEvent::ToolCall(calls) => {
                let now = Instant::now();
                for call in &calls {
                    state
                        .tool_calls_awaiting_response
                        .insert(call.id.clone(), now + Duration::from_secs(30));
                }
                let _ = state.events.send(LiveEvent::ToolCall(calls));
            }
            ServerEvent::ToolCallCancellation(ids) => {
                for id in &ids {
                    state.tool_calls_awaiting_response.remove(id);
                }
                let _ = state.events.send(LiveEvent::ToolCallCancellation(ids));
            }
            ServerEvent::SessionResumptionUpdate { new_handle, resumable } => {
                if resumable {
                    state.session_handle = Some(new_handle.clone());
                }
                let _ = state
                    .events
                    .send(LiveEvent::SessionResumptionUpdate { new_handle, resumable });
            }
            ServerEvent::GoAway { time_left_ms } => {
                let _ = state.events.send(LiveEvent::GoAway {
                    time_left_ms,
                    handle: state.session_handle.clone(),
                });
            }
            ServerEvent::UsageMetadata(usage) => {
                let _ = state.events.send(LiveEvent::UsageMetadata(usage));
            }
            ServerEvent::Unknown(value) => {
                debug!(?value, "unrecognized live session frame, ignoring");
            }
        }
    }
}

async fn send_frame(sink: &mut WsSink, message: &ClientMessage) -> Result<(), GeminiError> {
    let text = serde_json::to_string(message).map_err(|e| GeminiError::MalformedResponse {
        message: format!("failed to serialize live session frame: {e}"),
        raw: None,
    })?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

struct ReaderArgs {
    stream: WsSource,
    parent: ActorRef<LiveSessionMessage>,
}

/// Reads frames off the socket in a loop inside its own actor lifecycle
/// (spec §5: the session loop is a long-running task that must run under a
/// named supervisor, not a bare `tokio::spawn`). Every decoded frame is
/// cast back to the parent session actor's mailbox.
struct LiveSessionReader;

#[ractor::async_trait]
impl Actor for LiveSessionReader {
    type Msg = ();
    type State = ();
    type Arguments = ReaderArgs;

    async fn pre_start(&self, myself: ActorRef<Self::Msg>, args: Self::Arguments) -> Result<Self::State, ActorProcessingErr> {
        let ReaderArgs { mut stream, parent } = args;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => {
                        let _ = ractor::cast!(parent, LiveSessionMessage::FrameReceived(value));
                    }
                    Err(e) => {
                        warn!(error = %e, "malformed live session frame, ignoring");
                    }
                },
                Some(Ok(Message::Binary(bytes))) => {
                    if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                        let _ = ractor::cast!(parent, LiveSessionMessage::FrameReceived(value));
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = ractor::cast!(
                        parent,
                        LiveSessionMessage::ReaderDisconnected("socket closed".to_string())
                    );
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = ractor::cast!(parent, LiveSessionMessage::ReaderDisconnected(e.to_string()));
                    break;
                }
            }
        }
        info!("live session reader loop ended");
        myself.stop(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Scenario S5 (spec §8): connect, receive `setupComplete`, and a send
    /// issued before that arrives is queued and flushed exactly once
    /// afterward, in submission order. Uses a real loopback WebSocket
    /// server via `ws_url_override`, the same seam the closest reference
    /// implementation's Gemini Live client exposes as `with_base_url`.
    #[tokio::test]
    async fn s5_live_session_setup_queues_sends_until_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("ws://{addr}/ws");

        let server = tokio::spawn(async move {
            let (stream, _peer) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            // First frame must be the setup envelope.
            let setup_frame = ws.next().await.unwrap().unwrap();
            let setup_json: Value = serde_json::from_str(setup_frame.to_text().unwrap()).unwrap();
            assert!(setup_json.get("setup").is_some());

            // Deliberately delay setupComplete so the client's first send
            // is forced to queue.
            tokio::time::sleep(Duration::from_millis(50)).await;
            ws.send(Message::Text(serde_json::json!({"setupComplete": {}}).to_string().into()))
                .await
                .unwrap();

            // The queued clientContent must arrive exactly once, after
            // setupComplete, with its original turn content intact.
            let client_content_frame = ws.next().await.unwrap().unwrap();
            let client_content_json: Value = serde_json::from_str(client_content_frame.to_text().unwrap()).unwrap();
            client_content_json
        });

        let config = AuthConfig::ApiKey {
            api_key: "test-key".to_string(),
        };
        let opts = PerCallAuthOpts::default();
        let token_cache = TokenCache::new(reqwest::Client::new());

        let (handle, mut events) = connect(
            &config,
            &opts,
            &token_cache,
            "gemini-2.5-flash-live",
            SetupOptions::default(),
            None,
            Some(&url),
        )
        .await
        .unwrap();

        assert_eq!(handle.status().await, SessionStatus::Connecting);

        // Sent before `ready`: per spec this must queue, not send immediately.
        handle
            .send_client_content(
                vec![Content {
                    role: Some("user".to_string()),
                    parts: vec![gemini_client_schema::Part {
                        text: Some("hi".to_string()),
                        ..Default::default()
                    }],
                    extra: Default::default(),
                }],
                true,
            )
            .await;

        match events.recv().await.unwrap() {
            LiveEvent::Ready => {}
            other => panic!("expected Ready, got {other:?}"),
        }
        assert_eq!(handle.status().await, SessionStatus::Ready);

        let sent = server.await.unwrap();
        let turns = sent["clientContent"]["turns"].as_array().unwrap();
        assert_eq!(turns[0]["parts"][0]["text"], "hi");
        assert_eq!(sent["clientContent"]["turnComplete"], true);
    }
}
