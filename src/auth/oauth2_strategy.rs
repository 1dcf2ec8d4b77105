use super::{AuthStrategy, Credentials, HeaderPair, model_name};
use crate::error::GeminiError;

/// Vertex AI authentication: bearer token plus project/location path
/// components (spec §4.A).
#[derive(Debug, Clone, Default)]
pub struct OAuth2Strategy;

impl AuthStrategy for OAuth2Strategy {
    fn base_url(&self, credentials: &Credentials) -> String {
        let location = credentials.location.as_deref().unwrap_or("us-central1");
        format!("https://{location}-aiplatform.googleapis.com")
    }

    fn path(&self, model: &str, endpoint: &str, credentials: &Credentials) -> Result<String, GeminiError> {
        let project_id = credentials
            .project_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| GeminiError::MissingCredentials {
                reason: "missing_project_id".to_string(),
            })?;
        let location = credentials
            .location
            .as_deref()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| GeminiError::MissingCredentials {
                reason: "missing_location".to_string(),
            })?;
        let model = model_name::normalize(model)?;
        Ok(format!(
            "v1/projects/{project_id}/locations/{location}/publishers/google/models/{model}:{endpoint}"
        ))
    }

    fn headers(&self, credentials: &Credentials) -> Result<Vec<HeaderPair>, GeminiError> {
        let token = credentials
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GeminiError::MissingCredentials {
                reason: "missing_access_token".to_string(),
            })?;
        let mut headers = vec![("authorization", format!("Bearer {token}"))];
        if let Some(quota_project_id) = credentials.quota_project_id.as_deref().filter(|q| !q.is_empty()) {
            headers.push(("x-goog-user-project", quota_project_id.to_string()));
        }
        Ok(headers)
    }

    fn describe(&self) -> &'static str {
        "oauth2_service_account"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_requires_project_id_and_location() {
        let strategy = OAuth2Strategy;
        let creds = Credentials::default();
        let err = strategy.path("gemini-2.5-pro", "generateContent", &creds).unwrap_err();
        assert!(matches!(err, GeminiError::MissingCredentials { .. }));
    }

    #[test]
    fn path_composes_vertex_resource_name() {
        let strategy = OAuth2Strategy;
        let creds = Credentials {
            project_id: Some("my-proj".to_string()),
            location: Some("us-central1".to_string()),
            ..Default::default()
        };
        let path = strategy.path("gemini-2.5-pro", "generateContent", &creds).unwrap();
        assert_eq!(
            path,
            "v1/projects/my-proj/locations/us-central1/publishers/google/models/gemini-2.5-pro:generateContent"
        );
    }

    #[test]
    fn headers_include_quota_project_when_present() {
        let strategy = OAuth2Strategy;
        let creds = Credentials {
            access_token: Some("tok".to_string()),
            quota_project_id: Some("billing-proj".to_string()),
            ..Default::default()
        };
        let headers = strategy.headers(&creds).unwrap();
        assert_eq!(headers[0], ("authorization", "Bearer tok".to_string()));
        assert_eq!(headers[1], ("x-goog-user-project", "billing-proj".to_string()));
    }
}
