//! LLM provider adapters: the provider-agnostic trait plus the
//! Anthropic Messages API implementation (blocking + SSE streaming).

mod anthropic;
mod traits;
mod util;

pub use anthropic::AnthropicProvider;
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
pub use util::{is_transient, resolve_api_key};
