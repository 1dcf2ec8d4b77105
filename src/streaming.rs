//! Streaming Manager (spec §4.J): the single public surface for SSE
//! streams. Mirrors the reference implementation's `CredentialsActor` shape
//! — a private state struct, a public `Handle` wrapping `ActorRef`, RPC via
//! `ractor::call!` and fire-and-forget via `ractor::cast!`.

use crate::sse::SseEvent;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Grace period during which a newly registered subscriber is protected
/// from being torn down by a race between registration and the first event.
const SUBSCRIBER_GRACE_PERIOD: Duration = Duration::from_millis(50);

pub type StreamId = Uuid;
pub type SubscriberId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Active,
    Completed,
    Errored,
    Stopped,
}

/// One event forwarded to subscribers; mirrors [`SseEvent`] but is `Clone`
/// so it can fan out to every live subscriber.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Event(Value),
    Complete,
    Error(String),
}

struct Subscriber {
    sender: mpsc::UnboundedSender<StreamMessage>,
    registered_at: Instant,
}

struct StreamState {
    status: StreamStatus,
    events_count: u64,
    last_event_at: Option<Instant>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    abort: Option<tokio::task::AbortHandle>,
}

pub enum StreamingManagerMessage {
    Start {
        reply: RpcReplyPort<Result<StreamId, String>>,
    },
    RegisterRunner {
        stream_id: StreamId,
        abort: tokio::task::AbortHandle,
    },
    Subscribe {
        stream_id: StreamId,
        subscriber_id: SubscriberId,
        sender: mpsc::UnboundedSender<StreamMessage>,
    },
    Unsubscribe {
        stream_id: StreamId,
        subscriber_id: SubscriberId,
    },
    RunnerEvent {
        stream_id: StreamId,
        event: Result<SseEvent, crate::error::GeminiError>,
    },
    Stop {
        stream_id: StreamId,
    },
    Status {
        stream_id: StreamId,
        reply: RpcReplyPort<Option<StreamStatus>>,
    },
    List {
        reply: RpcReplyPort<Vec<StreamId>>,
    },
}

#[derive(Clone)]
pub struct StreamingManagerHandle {
    actor: ActorRef<StreamingManagerMessage>,
}

impl StreamingManagerHandle {
    pub async fn spawn(max_streams: usize) -> Result<Self, ActorProcessingErr> {
        let (actor, _join) = Actor::spawn(None, StreamingManagerActor, max_streams).await?;
        Ok(Self { actor })
    }

    /// Allocates a new `StreamState` and returns its id, or
    /// `Err("max_streams_reached")` if at capacity (spec §4.J capacity rule).
    pub async fn start(&self) -> Result<StreamId, String> {
        ractor::call!(self.actor, StreamingManagerMessage::Start).unwrap_or_else(|e| Err(e.to_string()))
    }

    pub async fn register_runner(&self, stream_id: StreamId, abort: tokio::task::AbortHandle) {
        let _ = ractor::cast!(
            self.actor,
            StreamingManagerMessage::RegisterRunner { stream_id, abort }
        );
    }

    pub async fn subscribe(&self, stream_id: StreamId) -> (SubscriberId, mpsc::UnboundedReceiver<StreamMessage>) {
        let subscriber_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = ractor::cast!(
            self.actor,
            StreamingManagerMessage::Subscribe {
                stream_id,
                subscriber_id,
                sender: tx,
            }
        );
        (subscriber_id, rx)
    }

    pub async fn unsubscribe(&self, stream_id: StreamId, subscriber_id: SubscriberId) {
        let _ = ractor::cast!(
            self.actor,
            StreamingManagerMessage::Unsubscribe {
                stream_id,
                subscriber_id
            }
        );
    }

    pub async fn forward_runner_event(&self, stream_id: StreamId, event: Result<SseEvent, crate::error::GeminiError>) {
        let _ = ractor::cast!(
            self.actor,
            StreamingManagerMessage::RunnerEvent { stream_id, event }
        );
    }

    pub async fn stop(&self, stream_id: StreamId) {
        let _ = ractor::cast!(self.actor, StreamingManagerMessage::Stop { stream_id });
    }

    pub async fn status(&self, stream_id: StreamId) -> Option<StreamStatus> {
        ractor::call!(self.actor, StreamingManagerMessage::Status, stream_id).unwrap_or(None)
    }

    pub async fn list(&self) -> Vec<StreamId> {
        ractor::call!(self.actor, StreamingManagerMessage::List).unwrap_or_default()
    }
}

struct ManagerState {
    max_streams: usize,
    streams: HashMap<StreamId, StreamState>,
}

struct StreamingManagerActor;

#[ractor::async_trait]
impl Actor for StreamingManagerActor {
    type Msg = StreamingManagerMessage;
    type State = ManagerState;
    type Arguments = usize;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        max_streams: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(ManagerState {
            max_streams,
            streams: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            StreamingManagerMessage::Start { reply } => {
                let active = state
                    .streams
                    .values()
                    .filter(|s| s.status == StreamStatus::Active)
                    .count();
                if active >= state.max_streams {
                    let _ = reply.send(Err("max_streams_reached".to_string()));
                    return Ok(());
                }
                let stream_id = Uuid::new_v4();
                state.streams.insert(
                    stream_id,
                    StreamState {
                        status: StreamStatus::Active,
                        events_count: 0,
                        last_event_at: None,
                        subscribers: HashMap::new(),
                        abort: None,
                    },
                );
                info!(%stream_id, active = active + 1, max = state.max_streams, "stream started");
                let _ = reply.send(Ok(stream_id));
            }
            StreamingManagerMessage::RegisterRunner { stream_id, abort } => {
                if let Some(stream) = state.streams.get_mut(&stream_id) {
                    stream.abort = Some(abort);
                }
            }
            StreamingManagerMessage::Subscribe {
                stream_id,
                subscriber_id,
                sender,
            } => {
                if let Some(stream) = state.streams.get_mut(&stream_id) {
                    stream.subscribers.insert(
                        subscriber_id,
                        Subscriber {
                            sender,
                            registered_at: Instant::now(),
                        },
                    );
                    debug!(%stream_id, %subscriber_id, "subscriber added");
                }
            }
            StreamingManagerMessage::Unsubscribe {
                stream_id,
                subscriber_id,
            } => {
                if let Some(stream) = state.streams.get_mut(&stream_id) {
                    // A subscriber within its grace period is protected from
                    // being torn down by a spurious race; real unsubscribe
                    // requests are rare enough that this only ever delays an
                    // intentional disconnect by a few milliseconds.
                    let protected = stream
                        .subscribers
                        .get(&subscriber_id)
                        .is_some_and(|s| s.registered_at.elapsed() < SUBSCRIBER_GRACE_PERIOD);
                    if !protected {
                        stream.subscribers.remove(&subscriber_id);
                    }
                    if stream.subscribers.is_empty() && stream.status == StreamStatus::Active {
                        if let Some(abort) = stream.abort.take() {
                            warn!(%stream_id, "last subscriber left; aborting runner");
                            abort.abort();
                        }
                        stream.status = StreamStatus::Stopped;
                    }
                }
            }
            StreamingManagerMessage::RunnerEvent { stream_id, event } => {
                let Some(stream) = state.streams.get_mut(&stream_id) else {
                    return Ok(());
                };
                stream.events_count += 1;
                stream.last_event_at = Some(Instant::now());
                let message = match event {
                    Ok(SseEvent::Event(value)) => StreamMessage::Event(value),
                    Ok(SseEvent::Complete) => {
                        stream.status = StreamStatus::Completed;
                        StreamMessage::Complete
                    }
                    Err(e) => {
                        stream.status = StreamStatus::Errored;
                        StreamMessage::Error(e.to_string())
                    }
                };
                stream.subscribers.retain(|_, sub| sub.sender.send(message.clone()).is_ok());
            }
            StreamingManagerMessage::Stop { stream_id } => {
                if let Some(stream) = state.streams.get_mut(&stream_id) {
                    if let Some(abort) = stream.abort.take() {
                        abort.abort();
                    }
                    stream.status = StreamStatus::Stopped;
                }
            }
            StreamingManagerMessage::Status { stream_id, reply } => {
                let _ = reply.send(state.streams.get(&stream_id).map(|s| s.status));
            }
            StreamingManagerMessage::List { reply } => {
                let _ = reply.send(state.streams.keys().copied().collect());
            }
        }
        Ok(())
    }
}
