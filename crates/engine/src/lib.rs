//! The conversation engine: a multi-round tool-use loop over a
//! streaming LLM provider, with per-turn call quotas, citation
//! extraction/translation, and cooperative cancellation.
//!
//! Entry point: [`Engine::run_turn`], which returns a channel of
//! [`TurnEvent`]s ending in exactly one terminal event.

pub mod assembler;
pub mod cancel;
pub mod citations;
pub mod ledger;
pub mod translate;
pub mod turn;

pub use cancel::CancelToken;
pub use translate::{SchedulerContext, Translator};
pub use turn::{Engine, TurnEvent, TurnHandle, TurnInput};
