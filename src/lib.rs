//! Client library for Google's Gemini generative-AI service (public Gemini
//! API and Vertex AI). See `SPEC_FULL.md` for the full component design;
//! module boundaries here mirror its §4 component list directly.

pub mod auth;
pub mod chat;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod http_client;
pub mod live;
pub mod orchestrator;
pub mod rate_limit;
pub mod retry;
pub mod sse;
pub mod state_store;
pub mod streaming;
pub mod token_estimator;
pub mod tool_registry;

pub use chat::Chat;
pub use config::{AuthConfig, Config, RateLimitProfile, RateLimitProfiles, CONFIG};
pub use error::GeminiError;
pub use rate_limit::RateLimiter;
pub use streaming::StreamingManagerHandle;
pub use tool_registry::ToolRegistry;
