//! Model access: one prompt in, text or a stream of chunks out.
//!
//! [`AiProvider`] is what the rest of the crate talks to. It owns the configured model,
//! the credentials and the default options, and checks every request against the model's
//! declared capabilities before a [`CompletionProvider`] backend sees it.

pub mod openai;
pub mod recording;
pub mod streaming;
pub mod types;
pub mod utils;


pub use openai::OpenAIProvider;
pub use recording::{PlaybackProvider, RecordingProvider};
pub use streaming::ChunkStream;
pub use types::*;

use crate::error::{Result, SproutError};
use crate::types::Prompt;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// A transport able to run completions for already validated requests.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<Box<dyn ChunkStream>>;

    fn count_tokens(&self, text: &str) -> usize;
}

pub struct AiProvider {
    model: CompletionModelId,
    env: Environment,
    defaults: PromptOptions,
    backend: Arc<dyn CompletionProvider>,
}

impl AiProvider {
    pub fn new(
        model: CompletionModelId,
        env: Environment,
        backend: Arc<dyn CompletionProvider>,
    ) -> Self {
        Self {
            model,
            env,
            defaults: PromptOptions::default(),
            backend,
        }
    }

    pub fn with_defaults(mut self, defaults: PromptOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn model(&self) -> &CompletionModelId {
        &self.model
    }

    pub fn model_info(&self) -> Result<&'static ModelInfo> {
        ModelInfo::lookup(&self.model)
    }

    /// Runs `prompt` to completion and returns the full text.
    pub async fn prompt(&self, prompt: impl Into<Prompt>, options: PromptOptions) -> Result<String> {
        let request = self.prepare(prompt.into(), &options)?;
        self.backend.complete(&request).await
    }

    /// Starts a streamed completion. Nothing is sent unless every check passes.
    pub async fn prompt_stream(
        &self,
        prompt: impl Into<Prompt>,
        options: PromptOptions,
    ) -> Result<Box<dyn ChunkStream>> {
        let request = self.prepare(prompt.into(), &options)?;
        self.backend.complete_stream(&request).await
    }

    pub fn token_count(&self, text: &str) -> usize {
        self.backend.count_tokens(text)
    }

    fn prepare(&self, prompt: Prompt, options: &PromptOptions) -> Result<CompletionRequest> {
        let options = self.defaults.merged_with(options);
        let info = self.model_info()?;
        info.check(&options.model_requirements.unwrap_or_default(), &prompt)?;

        let key_name = self.model.provider.info().api_key_var;
        let api_key = self
            .env
            .get(key_name)
            .filter(|key| !key.is_empty())
            .cloned()
            .ok_or_else(|| {
                SproutError::Configuration(format!(
                    "No credential '{}' configured for {}",
                    key_name,
                    self.model.provider.as_str()
                ))
            })?;

        let json_response = options.json_response.unwrap_or(false) && info.supports_json_response;
        debug!(
            "Prompting {} (json_response: {}, images: {})",
            self.model,
            json_response,
            prompt.images().len()
        );
        Ok(CompletionRequest {
            model: self.model.name.clone(),
            api_key,
            prompt,
            max_tokens: info.max_tokens,
            json_response,
        })
    }
}
