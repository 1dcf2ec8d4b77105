use crate::error::GeminiError;

/// Normalizes a model name before it is woven into a request path.
///
/// Strips a trailing `:endpoint` suffix and a redundant `models/` or
/// `publishers/google/models/` prefix (the strategy re-adds whichever prefix
/// its own path template needs), rejects path-traversal-ish values, and
/// leaves fully qualified `projects/`/`publishers/` resource names untouched.
/// Getting this wrong silently falls back to a default model, which is the
/// bug class this function exists to close off (see spec §4.A).
pub fn normalize(raw: &str) -> Result<String, GeminiError> {
    if raw.contains("..") || raw.contains('?') || raw.contains('&') {
        return Err(GeminiError::InvalidRequest {
            message: format!("invalid model name: {raw}"),
            http_status: None,
            details: None,
        });
    }

    if raw.starts_with("projects/") || raw.starts_with("publishers/") {
        return Ok(raw.to_string());
    }

    let without_endpoint = match raw.rsplit_once(':') {
        Some((model, _endpoint)) => model,
        None => raw,
    };

    let without_prefix = without_endpoint
        .strip_prefix("publishers/google/models/")
        .or_else(|| without_endpoint.strip_prefix("models/"))
        .unwrap_or(without_endpoint);

    // Collapse a doubled `models/models/x` left behind by a prefix that was
    // already stripped once above.
    let collapsed = without_prefix
        .strip_prefix("models/")
        .unwrap_or(without_prefix);

    Ok(collapsed.to_string())
}
