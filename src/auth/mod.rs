//! Multi-auth coordinator (spec §4.A-C): two concurrent authentication
//! strategies, each exposing the same capability set, selected per call by
//! [`coordinator::coordinate`].

mod api_key;
mod model_name;
mod oauth2_strategy;
mod token_cache;

pub mod coordinator;

pub use api_key::ApiKeyStrategy;
pub use model_name::normalize as normalize_model_name;
pub use oauth2_strategy::OAuth2Strategy;
pub use token_cache::{CachedToken, ServiceAccountKey, TokenCache};

use crate::error::GeminiError;

/// Resolved credential material for one call. Not every field is populated
/// by every strategy: `ApiKeyStrategy` only ever fills `api_key`,
/// `OAuth2Strategy` only ever fills `access_token`/`project_id`/`location`.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub project_id: Option<String>,
    pub location: Option<String>,
    pub quota_project_id: Option<String>,
}

/// One `(name, value)` HTTP header pair, strategy output before it is handed
/// to the HTTP client to attach to a request builder.
pub type HeaderPair = (&'static str, String);

/// Capability set shared by every authentication strategy (spec §4.A).
pub trait AuthStrategy: Send + Sync {
    fn base_url(&self, credentials: &Credentials) -> String;

    fn path(&self, model: &str, endpoint: &str, credentials: &Credentials) -> Result<String, GeminiError>;

    fn headers(&self, credentials: &Credentials) -> Result<Vec<HeaderPair>, GeminiError>;

    /// Name used in tracing spans; an ambient logging need, not itself part
    /// of the strategy contract spec.md describes.
    fn describe(&self) -> &'static str;
}
