use super::{AuthStrategy, Credentials, HeaderPair, model_name};
use crate::error::GeminiError;

/// Public Gemini API authentication: a single `x-goog-api-key` header, no
/// key ever placed in the URL (spec §4.A).
#[derive(Debug, Clone, Default)]
pub struct ApiKeyStrategy;

impl AuthStrategy for ApiKeyStrategy {
    fn base_url(&self, _credentials: &Credentials) -> String {
        "https://generativelanguage.googleapis.com".to_string()
    }

    fn path(&self, model: &str, endpoint: &str, _credentials: &Credentials) -> Result<String, GeminiError> {
        let model = model_name::normalize(model)?;
        Ok(format!("v1beta/models/{model}:{endpoint}"))
    }

    fn headers(&self, credentials: &Credentials) -> Result<Vec<HeaderPair>, GeminiError> {
        let api_key = credentials
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| GeminiError::MissingCredentials {
                reason: "missing_api_key".to_string(),
            })?;
        Ok(vec![("x-goog-api-key", api_key.to_string())])
    }

    fn describe(&self) -> &'static str {
        "api_key"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_uses_normalized_model_and_endpoint() {
        let strategy = ApiKeyStrategy;
        let creds = Credentials::default();
        let path = strategy
            .path("gemini-2.5-flash:generateContent", "generateContent", &creds)
            .unwrap();
        assert_eq!(path, "v1beta/models/gemini-2.5-flash:generateContent");
    }

    #[test]
    fn headers_fail_without_api_key() {
        let strategy = ApiKeyStrategy;
        let creds = Credentials::default();
        let err = strategy.headers(&creds).unwrap_err();
        assert!(matches!(err, GeminiError::MissingCredentials { .. }));
    }

    #[test]
    fn headers_use_x_goog_api_key_not_url() {
        let strategy = ApiKeyStrategy;
        let creds = Credentials {
            api_key: Some("AIza-test".to_string()),
            ..Default::default()
        };
        let headers = strategy.headers(&creds).unwrap();
        assert_eq!(headers, vec![("x-goog-api-key", "AIza-test".to_string())]);
    }
}
