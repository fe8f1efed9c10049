//! AI assistant support for shellmux.
//!
//! - [`llm`]: provider trait plus Anthropic, OpenAI and mock implementations
//! - [`fingerprint`]: request fingerprints used as cache keys
//! - [`cache`]: coalescing TTL + LRU response cache
//! - [`chat`]: the `/api/ai/chat` service tying the above together

pub mod cache;
pub mod chat;
pub mod fingerprint;
pub mod llm;

pub use cache::{CacheSettings, CacheStats, Lookup, LookupSource, ResponseCache};
pub use chat::{AiChatService, AiRequest, AiResponse, ChatError, ChatSettings};
pub use fingerprint::{Fingerprint, FingerprintInput};
