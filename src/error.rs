use crate::llm::ApiError;
use thiserror::Error;

/// Everything that can go wrong while loading a sprout or running a turn.
#[derive(Error, Debug)]
pub enum SproutError {
    /// Missing credentials, missing or unreadable source files, bad model ids.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The request asked for a model capability that the model does not declare.
    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// The model stream itself misbehaved (no choices, abnormal finish reason).
    #[error("Transport stream error: {0}")]
    TransportStream(String),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// A buffer that should hold complete JSON did not parse.
    #[error("Parse error: {message}")]
    Parse {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// The parsed turn did not match `{ userMessage: string, patch: JSONPatch }`.
    #[error("Invalid turn shape: {0}")]
    InvalidTurnShape(String),

    #[error("Patch error: {0}")]
    Patch(#[from] json_patch::PatchError),

    /// The storage backend could not serve or store a file.
    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SproutError {
    pub fn parse(message: impl Into<String>, source: serde_json::Error) -> Self {
        SproutError::Parse {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Errors that only fail the current turn; the engine stays usable afterwards.
    pub fn is_turn_failure(&self) -> bool {
        matches!(
            self,
            SproutError::TransportStream(_)
                | SproutError::Api(_)
                | SproutError::Parse { .. }
                | SproutError::InvalidTurnShape(_)
                | SproutError::Patch(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SproutError>;
