//! Chat & History (spec §4.M): an append-only log of `Content` turns. The
//! one non-trivial invariant is thought-signature continuity: a model
//! response's signatures must be echoed onto the very next user turn's
//! first part so the server can verify reasoning continuity, then cleared.

use gemini_client_schema::{Content, Part};
use gemini_client_thoughtsig::{CacheKeyGenerator, ThoughtSignatureEngine};
use std::collections::BTreeMap;

/// Append-only conversation log plus the bookkeeping `add_turn` needs to
/// satisfy the thought-signature continuity invariant.
#[derive(Debug, Clone, Default)]
pub struct Chat {
    pub turns: Vec<Content>,
    pub last_signatures: Vec<String>,
}

/// One tool result to attach as a `functionResponse` part (spec §4.M).
pub struct ToolResult {
    pub call_id: String,
    pub content: serde_json::Value,
}

impl Chat {
    pub fn new() -> Self {
        Self::default()
    }

    /// `add_user_turn(chat, text|parts)` — either form is accepted; a plain
    /// string becomes a single text part.
    pub fn add_user_turn_text(&mut self, text: impl Into<String>) {
        self.add_turn_user(vec![Part {
            text: Some(text.into()),
            ..Default::default()
        }]);
    }

    pub fn add_user_turn_parts(&mut self, parts: Vec<Part>) {
        self.add_turn_user(parts);
    }

    fn add_turn_user(&mut self, mut parts: Vec<Part>) {
        if let (Some(signature), Some(first)) = (self.last_signatures.first().cloned(), parts.first_mut()) {
            *first.thought_signature_mut() = Some(signature);
        }
        self.last_signatures.clear();
        self.turns.push(Content {
            role: Some("user".to_string()),
            parts,
            extra: BTreeMap::new(),
        });
    }

    /// `add_model_response(chat, response)` — appends the model's turn and
    /// extracts every `thought_signature` present in its parts into
    /// `last_signatures`, in arrival order.
    pub fn add_model_response(&mut self, parts: Vec<Part>) {
        self.last_signatures = parts
            .iter()
            .filter_map(|p| p.thought_signature.clone())
            .collect();
        self.turns.push(Content {
            role: Some("model".to_string()),
            parts,
            extra: BTreeMap::new(),
        });
    }

    /// `add_turn(chat, "tool", tool_results)` — each result becomes a Part
    /// with `functionResponse = {name: call_id, response: {content}}`.
    pub fn add_tool_turn(&mut self, results: Vec<ToolResult>) {
        let parts = results
            .into_iter()
            .map(|result| Part {
                function_response: Some(serde_json::json!({
                    "name": result.call_id,
                    "response": { "content": result.content },
                })),
                ..Default::default()
            })
            .collect();
        self.turns.push(Content {
            role: Some("user".to_string()),
            parts,
            extra: BTreeMap::new(),
        });
    }

    /// Scans the parts of the last model turn for any whose signature was
    /// stripped upstream and fills in a cached or dummy one, mirroring the
    /// patch strategy the thought-signature engine was built for. Not part
    /// of the append/extract invariant above; a defensive secondary path
    /// for transports that silently drop signatures in transit.
    pub fn patch_missing_signatures(&mut self, engine: &ThoughtSignatureEngine) {
        let Some(last) = self.turns.last_mut() else {
            return;
        };
        if last.role.as_deref() != Some("model") {
            return;
        }
        for part in &mut last.parts {
            if part.thought_signature.is_some() {
                continue;
            }
            let cache_key = if let Some(function_call) = &part.function_call {
                CacheKeyGenerator::generate_json(function_call)
            } else if part.thought == Some(true) {
                part.text.as_deref().and_then(CacheKeyGenerator::generate_text)
            } else {
                continue;
            };
            let signature = match cache_key {
                Some(key) => engine.get_signature(&key).unwrap_or_else(|| engine.fallback_signature()),
                None => engine.fallback_signature(),
            };
            part.thought_signature = Some(signature.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_response_extracts_signatures_in_order() {
        let mut chat = Chat::new();
        chat.add_model_response(vec![
            Part {
                text: Some("thinking".to_string()),
                thought_signature: Some("sig-1".to_string()),
                ..Default::default()
            },
            Part {
                text: Some("more".to_string()),
                thought_signature: Some("sig-2".to_string()),
                ..Default::default()
            },
        ]);
        assert_eq!(chat.last_signatures, vec!["sig-1".to_string(), "sig-2".to_string()]);
    }

    #[test]
    fn user_turn_after_model_response_echoes_first_signature_then_clears() {
        let mut chat = Chat::new();
        chat.add_model_response(vec![Part {
            thought_signature: Some("sig-1".to_string()),
            ..Default::default()
        }]);
        chat.add_user_turn_text("next question");

        let last = chat.turns.last().unwrap();
        assert_eq!(last.parts[0].thought_signature.as_deref(), Some("sig-1"));
        assert!(chat.last_signatures.is_empty());
    }

    #[test]
    fn user_turn_without_prior_signature_is_untouched() {
        let mut chat = Chat::new();
        chat.add_user_turn_text("hello");
        assert!(chat.turns[0].parts[0].thought_signature.is_none());
    }

    #[test]
    fn tool_turn_builds_function_response_parts() {
        let mut chat = Chat::new();
        chat.add_tool_turn(vec![ToolResult {
            call_id: "call-1".to_string(),
            content: serde_json::json!({"temp_c": 18}),
        }]);
        let last = chat.turns.last().unwrap();
        let response = last.parts[0].function_response.as_ref().unwrap();
        assert_eq!(response["name"], "call-1");
        assert_eq!(response["response"]["content"]["temp_c"], 18);
    }

    #[test]
    fn patch_missing_signatures_fills_dummy_for_function_call() {
        let mut chat = Chat::new();
        chat.add_model_response(vec![Part {
            function_call: Some(serde_json::json!({"name": "get_weather", "args": {}})),
            ..Default::default()
        }]);
        let engine = ThoughtSignatureEngine::new(3600, 1024);
        chat.patch_missing_signatures(&engine);
        assert_eq!(
            chat.turns.last().unwrap().parts[0].thought_signature.as_deref(),
            Some("skip_thought_signature_validator")
        );
    }
}
