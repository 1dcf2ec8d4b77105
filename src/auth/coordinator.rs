use super::{ApiKeyStrategy, AuthStrategy, Credentials, HeaderPair, OAuth2Strategy, TokenCache};
use crate::config::AuthConfig;
use crate::error::GeminiError;

/// Which strategy a call wants. Accepts both `vertex` and `vertex_ai`
/// spellings as aliases for the same strategy (spec §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSelector {
    ApiKey,
    Vertex,
}

impl AuthSelector {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "api_key" => Some(Self::ApiKey),
            "vertex" | "vertex_ai" => Some(Self::Vertex),
            _ => None,
        }
    }
}

/// Per-call overrides, highest-priority input to resolution (spec §4.C
/// resolution order item 1/2).
#[derive(Debug, Clone, Default)]
pub struct PerCallAuthOpts {
    pub auth: Option<AuthSelector>,
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub location: Option<String>,
    pub access_token: Option<String>,
    pub quota_project_id: Option<String>,
}

/// Result of coordinating auth for one call: the strategy to drive the
/// request with, the resolved credential material, and the headers to
/// attach.
pub struct CoordinatedAuth {
    pub strategy: Box<dyn AuthStrategy>,
    pub credentials: Credentials,
    pub headers: Vec<HeaderPair>,
}

/// Resolves which strategy and credentials a call should use.
///
/// Resolution order (spec §4.C): (1) per-call opts override; (2) per-call
/// credentials material overrides environment; (3) environment values
/// (folded into `config` by the process's configuration loader before this
/// function ever runs); (4) static configuration. The selector, once
/// explicitly supplied, is never silently swapped for a default strategy.
pub async fn coordinate(
    config: &AuthConfig,
    opts: &PerCallAuthOpts,
    token_cache: &TokenCache,
) -> Result<CoordinatedAuth, GeminiError> {
    let selector = opts.auth.unwrap_or(match config {
        AuthConfig::ApiKey { .. } => AuthSelector::ApiKey,
        AuthConfig::OAuth2 { .. } => AuthSelector::Vertex,
    });

    match selector {
        AuthSelector::ApiKey => {
            let api_key = opts.api_key.clone().or_else(|| match config {
                AuthConfig::ApiKey { api_key } => Some(api_key.clone()),
                AuthConfig::OAuth2 { .. } => None,
            });
            let credentials = Credentials {
                api_key,
                ..Default::default()
            };
            let strategy: Box<dyn AuthStrategy> = Box::new(ApiKeyStrategy);
            let headers = strategy.headers(&credentials)?;
            Ok(CoordinatedAuth {
                strategy,
                credentials,
                headers,
            })
        }
        AuthSelector::Vertex => {
            let (cfg_project_id, cfg_location, cfg_service_account_path, cfg_access_token, cfg_quota_project_id) =
                match config {
                    AuthConfig::OAuth2 {
                        project_id,
                        location,
                        service_account_path,
                        access_token,
                        quota_project_id,
                    } => (
                        Some(project_id.clone()),
                        Some(location.clone()),
                        service_account_path.clone(),
                        access_token.clone(),
                        quota_project_id.clone(),
                    ),
                    AuthConfig::ApiKey { .. } => (None, None, None, None, None),
                };

            let project_id = opts.project_id.clone().or(cfg_project_id);
            let location = opts.location.clone().or(cfg_location);
            let quota_project_id = opts.quota_project_id.clone().or(cfg_quota_project_id);

            let access_token = if let Some(token) = opts.access_token.clone().or(cfg_access_token) {
                Some(token)
            } else if let Some(service_account_path) = cfg_service_account_path.as_deref() {
                let cached = token_cache.get_or_fetch(service_account_path, None).await?;
                Some(cached.access_token)
            } else {
                None
            };

            let credentials = Credentials {
                access_token,
                project_id,
                location,
                quota_project_id,
                ..Default::default()
            };
            let strategy: Box<dyn AuthStrategy> = Box::new(OAuth2Strategy);
            let headers = strategy.headers(&credentials)?;
            Ok(CoordinatedAuth {
                strategy,
                credentials,
                headers,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_accepts_both_vertex_spellings() {
        assert_eq!(AuthSelector::parse("vertex"), Some(AuthSelector::Vertex));
        assert_eq!(AuthSelector::parse("vertex_ai"), Some(AuthSelector::Vertex));
        assert_eq!(AuthSelector::parse("api_key"), Some(AuthSelector::ApiKey));
        assert_eq!(AuthSelector::parse("bogus"), None);
    }

    #[tokio::test]
    async fn api_key_strategy_resolves_from_per_call_override() {
        let config = AuthConfig::ApiKey {
            api_key: "config-key".to_string(),
        };
        let opts = PerCallAuthOpts {
            api_key: Some("override-key".to_string()),
            ..Default::default()
        };
        let token_cache = TokenCache::new(reqwest::Client::new());
        let resolved = coordinate(&config, &opts, &token_cache).await.unwrap();
        assert_eq!(resolved.credentials.api_key.as_deref(), Some("override-key"));
    }

    #[tokio::test]
    async fn vertex_strategy_requires_project_id() {
        let config = AuthConfig::OAuth2 {
            project_id: String::new(),
            location: "us-central1".to_string(),
            service_account_path: None,
            access_token: Some("tok".to_string()),
            quota_project_id: None,
        };
        let opts = PerCallAuthOpts::default();
        let token_cache = TokenCache::new(reqwest::Client::new());
        let resolved = coordinate(&config, &opts, &token_cache).await.unwrap();
        // coordinate() itself does not validate project_id presence; that is
        // OAuth2Strategy::path's job, exercised when a request is built.
        assert!(resolved.credentials.project_id.as_deref() == Some(""));
    }
}
