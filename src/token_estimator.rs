//! Token Estimator (spec §4.N): a heuristic, network-free token count used
//! for budget gating only, never for billing.

use gemini_client_schema::Part;

/// Images contribute a fixed per-modality estimate since their true token
/// cost depends on server-side tiling the client cannot predict.
const IMAGE_TOKEN_ESTIMATE: f64 = 258.0;

/// `max(word_count * 1.3, char_count / 4.0)`, rounded up (spec §4.N).
pub fn estimate_str(input: &str) -> u64 {
    let word_count = input.split_whitespace().count() as f64;
    let char_count = input.chars().count() as f64;
    (word_count * 1.3).max(char_count / 4.0).ceil() as u64
}

/// Sums per-part estimates: text parts use [`estimate_str`], inline image
/// data contributes a fixed estimate, and any other media contributes 0
/// when its size can't be determined.
pub fn estimate_parts(parts: &[Part]) -> u64 {
    parts.iter().map(estimate_part).sum()
}

fn estimate_part(part: &Part) -> u64 {
    if let Some(text) = part.text.as_deref() {
        return estimate_str(text);
    }
    if let Some(inline_data) = &part.inline_data {
        let is_image = inline_data
            .get("mimeType")
            .and_then(|v| v.as_str())
            .is_some_and(|mime| mime.starts_with("image/"));
        return if is_image { IMAGE_TOKEN_ESTIMATE as u64 } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn short_string_uses_word_heuristic() {
        // "hello world" -> word_count=2 * 1.3 = 2.6, char_count=11/4=2.75
        assert_eq!(estimate_str("hello world"), 3);
    }

    #[test]
    fn dense_string_uses_char_heuristic() {
        let input = "a".repeat(400);
        assert_eq!(estimate_str(&input), 100);
    }

    #[test]
    fn empty_string_estimates_zero() {
        assert_eq!(estimate_str(""), 0);
    }

    #[test]
    fn image_part_uses_fixed_estimate() {
        let part = Part {
            inline_data: Some(json!({"mimeType": "image/png", "data": "base64"})),
            ..Default::default()
        };
        assert_eq!(estimate_parts(&[part]), 258);
    }

    #[test]
    fn unknown_media_without_text_estimates_zero() {
        let part = Part {
            file_data: Some(json!({"fileUri": "gs://bucket/video.mp4"})),
            ..Default::default()
        };
        assert_eq!(estimate_parts(&[part]), 0);
    }

    #[test]
    fn mixed_parts_sum_estimates() {
        let parts = vec![
            Part {
                text: Some("hello world".to_string()),
                ..Default::default()
            },
            Part {
                inline_data: Some(json!({"mimeType": "image/jpeg"})),
                ..Default::default()
            },
        ];
        assert_eq!(estimate_parts(&parts), 3 + 258);
    }
}
