//! Sprouts: conversational agents defined by a few text files.
//!
//! A sprout is a directory holding natural-language instructions, a schema for the
//! agent's private state and a small config. Every turn the model sees the current
//! state, answers the user and proposes a JSON Patch to the state; the engine streams
//! the answer out as it arrives and only commits the new state once the reply is valid.

pub mod error;
pub mod fetcher;
pub mod llm;
pub mod patch;
pub mod sprout;
pub mod streaming_json;
pub mod types;

#[cfg(test)]
mod tests;

pub use error::{Result, SproutError};
pub use fetcher::{Fetcher, FilesystemFetcher, MemoryFetcher, MetaFetcher};
pub use llm::{AiProvider, CompletionModelId, CompletionProvider, Environment, PromptOptions};
pub use sprout::{Sprout, SproutOptions, TurnPhase};
pub use streaming_json::StreamingJsonParser;
pub use types::{CompiledSprout, ConversationTurn, Prompt, PromptPart, SproutConfig, SproutState};
