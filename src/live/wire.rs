//! Wire types for the Live (WebSocket) protocol (spec §4.L, §6). Field
//! casing here is camelCase throughout -- unlike generation-content parts,
//! the Live envelope has no snake_case irregularities.

use gemini_client_schema::Content;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_content: Option<ClientContentMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<ToolResponseMessage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_input_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_resumption: Option<SessionResumptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_compression: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_transcription_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proactivity: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumptionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContentMessage {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponseMessage {
    pub function_responses: Vec<Value>,
}

/// One function call the model has requested, from a `toolCall` frame.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Decoded inbound frame, dispatched on the discriminator present in the
/// raw JSON object (spec §4.L "Receiving").
#[derive(Debug, Clone)]
pub enum ServerEvent {
    SetupComplete,
    ServerContent(Value),
    ToolCall(Vec<ToolCallRequest>),
    ToolCallCancellation(Vec<String>),
    SessionResumptionUpdate { new_handle: String, resumable: bool },
    GoAway { time_left_ms: Option<u64> },
    UsageMetadata(Value),
    /// A top-level key this client does not recognize. Forward-compatible
    /// with new Gemini Live features (spec §9): ignored by the state
    /// machine but logged by the caller.
    Unknown(Value),
}

pub fn parse_server_event(value: Value) -> ServerEvent {
    if value.get("setupComplete").is_some() {
        return ServerEvent::SetupComplete;
    }
    if let Some(content) = value.get("serverContent") {
        return ServerEvent::ServerContent(content.clone());
    }
    if let Some(tool_call) = value.get("toolCall") {
        let calls = tool_call
            .get("functionCalls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|c| {
                        let name = c.get("name")?.as_str()?.to_string();
                        let id = c
                            .get("id")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| name.clone());
                        let args = c.get("args").cloned().unwrap_or(Value::Null);
                        Some(ToolCallRequest { id, name, args })
                    })
                    .collect()
            })
            .unwrap_or_default();
        return ServerEvent::ToolCall(calls);
    }
    if let Some(cancellation) = value.get("toolCallCancellation") {
        let ids = cancellation
            .get("ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        return ServerEvent::ToolCallCancellation(ids);
    }
    if let Some(update) = value.get("sessionResumptionUpdate") {
        let new_handle = update
            .get("newHandle")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let resumable = update.get("resumable").and_then(Value::as_bool).unwrap_or(false);
        return ServerEvent::SessionResumptionUpdate { new_handle, resumable };
    }
    if let Some(go_away) = value.get("goAway") {
        let time_left_ms = go_away.get("timeLeft").and_then(Value::as_str).and_then(parse_go_away_duration);
        return ServerEvent::GoAway { time_left_ms };
    }
    if let Some(usage) = value.get("usageMetadata") {
        return ServerEvent::UsageMetadata(usage.clone());
    }
    ServerEvent::Unknown(value)
}

fn parse_go_away_duration(raw: &str) -> Option<u64> {
    crate::retry::parse_duration(raw)
}
