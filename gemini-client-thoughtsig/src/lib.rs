pub mod engine;
pub mod fingerprint;
pub mod patch;
mod sniffer;

pub use engine::ThoughtSignatureEngine;
pub use engine::{CacheKey, SignatureCacheStore, ThoughtSignature};
pub use fingerprint::CacheKeyGenerator;
pub use patch::{PatchEvent, PatchOutcome, ThoughtSigPatchable};
pub use sniffer::{SignatureSniffer, SniffEvent, Sniffable};
