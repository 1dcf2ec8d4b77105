//! Live Session (spec §4.L): long-lived bidirectional WebSocket connection
//! to the Gemini Live API.

mod session;
mod wire;

pub use session::{connect, LiveEvent, LiveSessionHandle, SessionStatus, SetupOptions};
pub use wire::ToolCallRequest;
