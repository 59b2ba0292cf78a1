use crate::error::{Result, SproutError};
use crate::types::Prompt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Provider credentials, keyed by the provider's key name (e.g. `openai_api_key`).
pub type Environment = HashMap<String, String>;

/// One incremental piece of a streamed completion, in the Chat Completions wire shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// The finish reason of a normally completed stream.
pub const FINISH_REASON_STOP: &str = "stop";

impl CompletionChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta: ChunkDelta {
                    content: Some(text.into()),
                },
                finish_reason: None,
            }],
        }
    }

    pub fn finished(reason: impl Into<String>) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta: ChunkDelta::default(),
                finish_reason: Some(reason.into()),
            }],
        }
    }
}

/// Capabilities a request needs from the model. Checked before any transport call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequirements {
    pub json_response: bool,
    pub image_input: bool,
}

/// Per-call options. Unset fields fall back to the provider defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptOptions {
    /// Ask for forced-JSON output when the model supports it.
    pub json_response: Option<bool>,
    pub model_requirements: Option<ModelRequirements>,
}

impl PromptOptions {
    /// `self` with every field that `overrides` sets replaced.
    pub fn merged_with(&self, overrides: &PromptOptions) -> PromptOptions {
        PromptOptions {
            json_response: overrides.json_response.or(self.json_response),
            model_requirements: overrides.model_requirements.or(self.model_requirements),
        }
    }
}

/// What a provider backend receives once a request passed capability and credential checks.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model name without the provider prefix.
    pub model: String,
    pub api_key: String,
    pub prompt: Prompt,
    pub max_tokens: usize,
    pub json_response: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelProvider {
    #[serde(rename = "openai.com")]
    OpenAI,
}

pub struct ProviderInfo {
    pub default_completion_model: &'static str,
    pub api_key_var: &'static str,
}

impl ModelProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelProvider::OpenAI => "openai.com",
        }
    }

    pub fn info(&self) -> ProviderInfo {
        match self {
            ModelProvider::OpenAI => ProviderInfo {
                default_completion_model: "openai.com:gpt-3.5-turbo",
                api_key_var: "openai_api_key",
            },
        }
    }
}

impl FromStr for ModelProvider {
    type Err = SproutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai.com" => Ok(ModelProvider::OpenAI),
            other => Err(SproutError::Configuration(format!(
                "Unknown model provider: {other}"
            ))),
        }
    }
}

/// A `provider:modelName` identifier such as `openai.com:gpt-4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompletionModelId {
    pub provider: ModelProvider,
    pub name: String,
}

impl FromStr for CompletionModelId {
    type Err = SproutError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let [provider, name] = parts.as_slice() else {
            return Err(SproutError::Configuration(format!(
                "Model id '{s}' must have the form provider:modelName"
            )));
        };
        Ok(Self {
            provider: provider.parse()?,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for CompletionModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider.as_str(), self.name)
    }
}

/// Declared limits and capabilities of a completion model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub max_tokens: usize,
    pub supports_json_response: bool,
    pub supports_image_input: bool,
}

const fn model(
    id: &'static str,
    max_tokens: usize,
    supports_json_response: bool,
    supports_image_input: bool,
) -> ModelInfo {
    ModelInfo {
        id,
        max_tokens,
        supports_json_response,
        supports_image_input,
    }
}

pub const COMPLETIONS_BY_MODEL: &[ModelInfo] = &[
    model("openai.com:gpt-3.5-turbo", 4096, false, false),
    model("openai.com:gpt-3.5-turbo-16k", 16384, false, false),
    model("openai.com:gpt-4", 8192, false, false),
    model("openai.com:gpt-4-32k", 32768, false, false),
    model("openai.com:gpt-4-1106-preview", 8192, true, false),
    model("openai.com:gpt-4-vision-preview", 8192, false, true),
];

impl ModelInfo {
    pub fn lookup(id: &CompletionModelId) -> Result<&'static ModelInfo> {
        let key = id.to_string();
        COMPLETIONS_BY_MODEL
            .iter()
            .find(|info| info.id == key)
            .ok_or_else(|| SproutError::Configuration(format!("Unknown completion model: {key}")))
    }

    /// Fails if `requirements` (or the prompt itself) needs something this model lacks.
    pub fn check(&self, requirements: &ModelRequirements, prompt: &Prompt) -> Result<()> {
        if requirements.json_response && requirements.image_input {
            return Err(SproutError::UnsupportedCapability(
                "jsonResponse and imageInput cannot be combined in one request".to_string(),
            ));
        }
        if requirements.json_response && !self.supports_json_response {
            return Err(SproutError::UnsupportedCapability(format!(
                "{} does not support JSON responses",
                self.id
            )));
        }
        if (requirements.image_input || prompt.includes_image()) && !self.supports_image_input {
            return Err(SproutError::UnsupportedCapability(format!(
                "{} does not support image input",
                self.id
            )));
        }
        Ok(())
    }
}

/// Common error types for provider transports
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}
