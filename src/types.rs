use crate::error::{Result, SproutError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The state object a sprout manages. Its shape is defined by the sprout's schema file.
pub type SproutState = Value;

/// A data URL or remote URL pointing at an image.
pub type ImageUrl = String;

/// What a user (or the engine) sends to the model.
///
/// Serialized the same way sprout definitions and recordings store it: either a plain
/// string, or an array mixing strings and `{ "image": "<url>" }` objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Parts(Vec<PromptPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptPart {
    Text(String),
    Image { image: ImageUrl },
}

impl Prompt {
    /// All text parts joined by newlines; images are skipped.
    pub fn text(&self) -> String {
        match self {
            Prompt::Text(text) => text.clone(),
            Prompt::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    PromptPart::Text(text) => Some(text.as_str()),
                    PromptPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn images(&self) -> Vec<&ImageUrl> {
        match self {
            Prompt::Text(_) => Vec::new(),
            Prompt::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    PromptPart::Image { image } => Some(image),
                    PromptPart::Text(_) => None,
                })
                .collect(),
        }
    }

    pub fn includes_image(&self) -> bool {
        !self.images().is_empty()
    }

    /// Like `text()`, but with a short placeholder where each image sits. Image payloads
    /// are usually large data URLs that would swamp the logs.
    pub fn debug_text(&self) -> String {
        match self {
            Prompt::Text(text) => text.clone(),
            Prompt::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    PromptPart::Text(text) => text.clone(),
                    PromptPart::Image { image } => format!("[image: {} bytes]", image.len()),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// A copy of this prompt with `image` appended as the last part.
    pub fn with_image(self, image: impl Into<ImageUrl>) -> Self {
        let image = PromptPart::Image {
            image: image.into(),
        };
        match self {
            Prompt::Text(text) => Prompt::Parts(vec![PromptPart::Text(text), image]),
            Prompt::Parts(mut parts) => {
                parts.push(image);
                Prompt::Parts(parts)
            }
        }
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

/// Contents of a sprout's `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SproutConfig {
    #[serde(default)]
    pub version: u32,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_images: Option<bool>,
}

/// Only bundle format version currently defined.
pub const COMPILED_SPROUT_VERSION: u32 = 0;

/// Cached snapshot of a sprout's definition plus its starter state (`compiled.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledSprout {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    pub name: String,
    pub config: SproutConfig,
    pub base_instructions: String,
    pub schema_text: String,
    pub starter_state: SproutState,
}

/// What the model must produce for every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub user_message: String,
    pub patch: json_patch::Patch,
}

impl ConversationTurn {
    /// Validates a parsed model response against the turn contract.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = &value else {
            return Err(SproutError::InvalidTurnShape(format!(
                "expected an object, got {}",
                json_kind(&value)
            )));
        };

        match map.get("userMessage") {
            Some(Value::String(_)) => {}
            Some(other) => {
                return Err(SproutError::InvalidTurnShape(format!(
                    "userMessage must be a string, got {}",
                    json_kind(other)
                )))
            }
            None => {
                return Err(SproutError::InvalidTurnShape(
                    "missing userMessage".to_string(),
                ))
            }
        }

        match map.get("patch") {
            Some(Value::Array(_)) => {}
            Some(other) => {
                return Err(SproutError::InvalidTurnShape(format!(
                    "patch must be an array, got {}",
                    json_kind(other)
                )))
            }
            None => return Err(SproutError::InvalidTurnShape("missing patch".to_string())),
        }

        serde_json::from_value(value)
            .map_err(|e| SproutError::InvalidTurnShape(format!("invalid patch operation: {e}")))
    }
}

/// The tolerant view of a turn used while it is still streaming in.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialConversationTurn {
    #[serde(default)]
    pub user_message: Option<String>,
    #[serde(default)]
    pub patch: Option<Value>,
}

impl PartialConversationTurn {
    /// The user message revealed so far, if the partial value has the right shape.
    pub fn user_message_of(value: &Value) -> Option<String> {
        let partial: PartialConversationTurn = serde_json::from_value(value.clone()).ok()?;
        Some(partial.user_message.unwrap_or_default())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
