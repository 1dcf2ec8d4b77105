use crate::{CacheKey, CacheKeyGenerator, ThoughtSignatureEngine};
use serde_json::Value;

pub enum PatchEvent<'a> {
    ThoughtText(&'a str),
    FunctionCall(&'a Value),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Skipped,
    Patched { cache_key: Option<CacheKey> },
}

pub trait ThoughtSigPatchable {
    // Provide patch input as a normalized event so the caller does not need
    // to understand the concrete schema layout.
    fn data(&self) -> PatchEvent<'_>;
    // Provide mutable access to the destination signature slot.
    fn thought_signature_mut(&mut self) -> &mut Option<String>;

    // Shared patch pipeline:
    // 1) build cache key from event
    // 2) lookup signature (or fallback to dummy)
    // 3) write back to schema slot
    fn patch_thought_signature(&mut self, engine: &ThoughtSignatureEngine) -> PatchOutcome {
        let cache_key = match self.data() {
            PatchEvent::ThoughtText(text) => CacheKeyGenerator::generate_text(text),
            PatchEvent::FunctionCall(function_call) => {
                CacheKeyGenerator::generate_json(function_call)
            }
            PatchEvent::None => return PatchOutcome::Skipped,
        };

        let signature = match cache_key {
            Some(key) => engine
                .get_signature(&key)
                .unwrap_or_else(|| engine.fallback_signature()),
            None => engine.fallback_signature(),
        };

        *self.thought_signature_mut() = Some(signature.to_string());
        PatchOutcome::Patched { cache_key }
    }
}
