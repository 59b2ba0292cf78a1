//! The conversation turn engine.
//!
//! A [`Sprout`] is one conversational agent defined by a directory of source files
//! (`config.json`, `instructions.md`, `schema.ts`) and an optional `compiled.json` bundle.
//! Each turn prompts the model with the current state and the user's messages, streams
//! back a `{ userMessage, patch }` object and commits the patched state only once the
//! whole reply has been validated.

use crate::error::{Result, SproutError};
use crate::fetcher::Fetcher;
use crate::llm::{AiProvider, ChunkStream, ModelRequirements, PromptOptions, FINISH_REASON_STOP};
use crate::patch;
use crate::streaming_json::StreamingJsonParser;
use crate::types::{
    CompiledSprout, ConversationTurn, PartialConversationTurn, Prompt, PromptPart,
    SproutConfig, SproutState, COMPILED_SPROUT_VERSION,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

pub const SPROUT_CONFIG_PATH: &str = "config.json";
pub const SPROUT_INSTRUCTIONS_PATH: &str = "instructions.md";
pub const SPROUT_SCHEMA_PATH: &str = "schema.ts";
pub const SPROUT_COMPILED_PATH: &str = "compiled.json";

/// Source files whose modification invalidates a compiled bundle.
const BASE_SPROUT_PATHS: [&str; 3] = [
    SPROUT_INSTRUCTIONS_PATH,
    SPROUT_SCHEMA_PATH,
    SPROUT_CONFIG_PATH,
];

/// Output contract shown to the model on every turn.
pub const CONVERSATION_TURN_SCHEMA: &str = "type ConversationTurn = {
  //The message that will be shown to the user.
  userMessage: string
  //The change to make to the current state object based on this turn. If no modification needs to be made, can just be [].
  patch : JSONPatchRFC6902
}";

const INITIAL_MESSAGES_MARKER: &str = "<INITIAL>";
const USER_MESSAGE_SEPARATOR: &str = "\n---\n";

#[derive(Clone, Default)]
pub struct SproutOptions {
    pub ai: Option<Arc<AiProvider>>,
    /// Stream raw model tokens to the stream logger instead of the revealed user message.
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// No state exists yet.
    Idle,
    /// The starter state is being derived from the schema.
    AwaitingStarterState,
    Ready,
    Streaming,
}

pub struct Sprout {
    path: String,
    fetcher: Arc<dyn Fetcher>,
    ai: Option<Arc<AiProvider>>,
    debug: bool,
    // `Some(None)` means the bundle is known to be absent or stale.
    compiled: Option<Option<CompiledSprout>>,
    config: Option<SproutConfig>,
    base_instructions: Option<String>,
    schema_text: Option<String>,
    starter_state: Option<SproutState>,
    user_messages: Vec<Prompt>,
    states: Vec<SproutState>,
    phase: TurnPhase,
}

impl Sprout {
    pub fn new(path: impl Into<String>, fetcher: Arc<dyn Fetcher>, options: SproutOptions) -> Self {
        Self {
            path: path.into(),
            fetcher,
            ai: options.ai,
            debug: options.debug,
            compiled: None,
            config: None,
            base_instructions: None,
            schema_text: None,
            starter_state: None,
            user_messages: Vec::new(),
            states: Vec::new(),
            phase: TurnPhase::Idle,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path component of the sprout directory.
    pub fn name(&self) -> &str {
        self.path
            .split('/')
            .filter(|component| !component.is_empty())
            .last()
            .unwrap_or(&self.path)
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Every state so far, starter state first.
    pub fn states(&self) -> &[SproutState] {
        &self.states
    }

    pub fn user_messages(&self) -> &[Prompt] {
        &self.user_messages
    }

    fn source_path(&self, leaf: &str) -> String {
        self.fetcher.join_path(&self.path, leaf)
    }

    /// Whether a usable compiled bundle backs this sprout.
    pub async fn compiled(&mut self) -> Result<bool> {
        Ok(self.load_compiled().await?.is_some())
    }

    async fn load_compiled(&mut self) -> Result<Option<&CompiledSprout>> {
        if self.compiled.is_none() {
            let bundle = self.read_compiled().await?;
            self.compiled = Some(bundle);
        }
        Ok(self.compiled.as_ref().and_then(Option::as_ref))
    }

    async fn read_compiled(&self) -> Result<Option<CompiledSprout>> {
        let compiled_path = self.source_path(SPROUT_COMPILED_PATH);
        if !self.fetcher.file_exists(&compiled_path).await? {
            debug!("{}: No compiled file", self.name());
            return Ok(None);
        }

        let raw = self.fetcher.file_fetch(&compiled_path).await?;
        let bundle: CompiledSprout = serde_json::from_str(&raw)
            .map_err(|e| SproutError::parse(format!("{}: Invalid {}", self.name(), compiled_path), e))?;
        if bundle.version != COMPILED_SPROUT_VERSION {
            debug!(
                "{}: Ignoring compiled file with unknown version {}",
                self.name(),
                bundle.version
            );
            return Ok(None);
        }

        // Read-only storage cannot hold a fresher bundle, so whatever is there is trusted.
        if self.fetcher.writable() {
            for file in BASE_SPROUT_PATHS {
                let path = self.source_path(file);
                if !self.fetcher.file_exists(&path).await? {
                    continue;
                }
                if self.fetcher.file_last_updated(&path).await? > bundle.last_updated {
                    debug!(
                        "{}: Compiled file out of date: {} is newer than {}",
                        self.name(),
                        path,
                        compiled_path
                    );
                    return Ok(None);
                }
            }
        }
        Ok(Some(bundle))
    }

    /// Writes a fresh `compiled.json` unless a valid one exists or storage is read-only.
    pub async fn compile(&mut self) -> Result<()> {
        if self.compiled().await? {
            debug!("{}: Already compiled", self.name());
            return Ok(());
        }
        if !self.fetcher.writable() {
            debug!("{}: Not writable, not compiling", self.name());
            return Ok(());
        }

        let last_updated = Utc::now();
        let bundle = CompiledSprout {
            version: COMPILED_SPROUT_VERSION,
            last_updated,
            name: self.name().to_string(),
            config: self.config().await?,
            base_instructions: self.base_instructions().await?,
            schema_text: self.schema_text().await?,
            starter_state: self.starter_state().await?,
        };

        debug!("{}: Compiling", self.name());
        let contents = to_tab_indented_json(&bundle)?;
        self.fetcher
            .write_file(&self.source_path(SPROUT_COMPILED_PATH), &contents)
            .await?;
        self.compiled = Some(Some(bundle));
        Ok(())
    }

    async fn fetch_source(&self, leaf: &str, description: &str) -> Result<String> {
        let path = self.source_path(leaf);
        if !self.fetcher.file_exists(&path).await? {
            return Err(SproutError::Configuration(format!(
                "{}: {} file {} not found",
                self.name(),
                description,
                path
            )));
        }
        self.fetcher.file_fetch(&path).await
    }

    pub async fn config(&mut self) -> Result<SproutConfig> {
        if let Some(bundle) = self.load_compiled().await? {
            return Ok(bundle.config.clone());
        }
        if let Some(config) = &self.config {
            return Ok(config.clone());
        }

        let raw = self.fetch_source(SPROUT_CONFIG_PATH, "Config").await?;
        let config: SproutConfig = serde_json::from_str(&raw).map_err(|e| {
            SproutError::Configuration(format!("{}: Invalid config: {}", self.name(), e))
        })?;
        self.config = Some(config.clone());
        Ok(config)
    }

    pub async fn base_instructions(&mut self) -> Result<String> {
        if let Some(bundle) = self.load_compiled().await? {
            return Ok(bundle.base_instructions.clone());
        }
        if let Some(instructions) = &self.base_instructions {
            return Ok(instructions.clone());
        }

        let instructions = self
            .fetch_source(SPROUT_INSTRUCTIONS_PATH, "Instruction")
            .await?;
        self.base_instructions = Some(instructions.clone());
        Ok(instructions)
    }

    /// The schema text is forwarded to the model verbatim and never parsed here.
    pub async fn schema_text(&mut self) -> Result<String> {
        if let Some(bundle) = self.load_compiled().await? {
            return Ok(bundle.schema_text.clone());
        }
        if let Some(schema) = &self.schema_text {
            return Ok(schema.clone());
        }

        let schema = self.fetch_source(SPROUT_SCHEMA_PATH, "Schema").await?;
        self.schema_text = Some(schema.clone());
        Ok(schema)
    }

    /// Loads every source file, failing on the first one that is missing or invalid.
    pub async fn validate(&mut self) -> Result<()> {
        self.config().await?;
        self.base_instructions().await?;
        self.schema_text().await?;
        Ok(())
    }

    pub async fn allow_images(&mut self) -> Result<bool> {
        Ok(self.config().await?.allow_images.unwrap_or(false))
    }

    fn ai(&self) -> Result<Arc<AiProvider>> {
        self.ai
            .clone()
            .ok_or_else(|| SproutError::Configuration("No AI provider configured".to_string()))
    }

    /// The default state for the schema, asked from the model in JSON mode when no
    /// bundle provides it.
    pub async fn starter_state(&mut self) -> Result<SproutState> {
        if let Some(bundle) = self.load_compiled().await? {
            return Ok(bundle.starter_state.clone());
        }
        if let Some(state) = &self.starter_state {
            return Ok(state.clone());
        }

        let ai = self.ai()?;
        let schema_text = self.schema_text().await?;
        let prompt = format!(
            "Return the JSON of a default/empty object conforming to this typescript schema (following comments on defaults):\n{schema_text}\n"
        );
        let options = PromptOptions {
            json_response: Some(true),
            model_requirements: Some(ModelRequirements {
                json_response: true,
                image_input: false,
            }),
        };
        let raw = ai.prompt(prompt, options).await?;
        let state: SproutState = serde_json::from_str(&raw).map_err(|e| {
            SproutError::parse(format!("{}: Starter state is not valid JSON", self.name()), e)
        })?;
        debug!("{}: Derived starter state", self.name());
        self.starter_state = Some(state.clone());
        Ok(state)
    }

    /// The newest state, deriving the starter state on first use.
    pub async fn last_state(&mut self) -> Result<SproutState> {
        if self.states.is_empty() {
            self.phase = TurnPhase::AwaitingStarterState;
            match self.starter_state().await {
                Ok(state) => {
                    self.states.push(state);
                    self.phase = TurnPhase::Ready;
                }
                Err(e) => {
                    self.phase = TurnPhase::Idle;
                    return Err(e);
                }
            }
        }
        // Non-empty from here on.
        Ok(self.states[self.states.len() - 1].clone())
    }

    /// Builds the prompt for the next turn.
    pub async fn prompt(&mut self) -> Result<Prompt> {
        let base_instructions = self.base_instructions().await?;
        let schema_text = self.schema_text().await?;
        let state = to_tab_indented_json(&self.last_state().await?)?;

        let messages = if self.user_messages.is_empty() {
            INITIAL_MESSAGES_MARKER.to_string()
        } else {
            self.user_messages
                .iter()
                .map(Prompt::text)
                .collect::<Vec<_>>()
                .join(USER_MESSAGE_SEPARATOR)
        };

        let instructions = format!(
            "{base_instructions}

You will manage your state in an object conforming to the following schema:
{schema_text}

Do not talk about the state object with a user; it is an implementation detail the user doesn't need to know about.

Your current state is:
{state}

The last messages from the user (with the last message, which you should respond to, at the end):
{messages}

It is VERY IMPORTANT that you should respond with only a literal JSON object (not wrapped in markdown formatting or other formatting) matching this schema:
{CONVERSATION_TURN_SCHEMA}

Provide a patch to update the state object based on the users's last message and your response."
        );

        // Only the latest message's images are sent.
        let images = self
            .user_messages
            .last()
            .map(|message| message.images().into_iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        if images.is_empty() {
            return Ok(Prompt::Text(instructions));
        }
        let mut parts = vec![PromptPart::Text(instructions)];
        parts.extend(images.into_iter().map(|image| PromptPart::Image { image }));
        Ok(Prompt::Parts(parts))
    }

    pub fn provide_user_response(&mut self, response: impl Into<Prompt>) {
        self.user_messages.push(response.into());
    }

    /// Runs one model turn and returns the message to show the user.
    ///
    /// `stream_logger` receives the reply as it streams in: the revealed `userMessage`
    /// text normally, raw tokens in debug mode, and a final `"\n"`. On error the state
    /// history is left exactly as it was.
    pub async fn conversation_turn(
        &mut self,
        stream_logger: Option<&mut dyn FnMut(&str)>,
    ) -> Result<String> {
        let ai = self.ai()?;
        let allow_images = self.allow_images().await?;
        let prompt = self.prompt().await?;
        debug!("{}: Prompt:\n{}", self.name(), prompt.debug_text());

        let options = PromptOptions {
            json_response: Some(true),
            model_requirements: Some(ModelRequirements {
                json_response: !allow_images,
                image_input: allow_images,
            }),
        };
        let stream = ai.prompt_stream(prompt, options).await?;

        let streamed = {
            let _streaming = StreamingPhase::enter(&mut self.phase);
            read_turn(stream, self.debug, stream_logger).await
        };

        let turn = ConversationTurn::from_value(streamed?)?;
        debug!("{}: Turn: {:?}", self.name(), turn);

        let new_state = patch::apply(&self.last_state().await?, &turn.patch)?;
        trace!("{}: New state: {}", self.name(), new_state);
        self.states.push(new_state);
        Ok(turn.user_message)
    }
}

/// Keeps the engine in [`TurnPhase::Streaming`] while alive. Dropping it, also when the
/// turn future is cancelled, returns the engine to [`TurnPhase::Ready`].
struct StreamingPhase<'a>(&'a mut TurnPhase);

impl<'a> StreamingPhase<'a> {
    fn enter(phase: &'a mut TurnPhase) -> Self {
        *phase = TurnPhase::Streaming;
        Self(phase)
    }
}

impl Drop for StreamingPhase<'_> {
    fn drop(&mut self) {
        *self.0 = TurnPhase::Ready;
    }
}

/// Drains `stream` and returns the strictly parsed reply.
async fn read_turn(
    mut stream: Box<dyn ChunkStream>,
    debug: bool,
    mut stream_logger: Option<&mut dyn FnMut(&str)>,
) -> Result<serde_json::Value> {
    let mut parser = StreamingJsonParser::new();

    while let Some(chunk) = stream.next_chunk().await? {
        let Some(choice) = chunk.choices.first() else {
            return Err(SproutError::TransportStream("No choices".to_string()));
        };
        if let Some(reason) = &choice.finish_reason {
            if reason != FINISH_REASON_STOP {
                return Err(SproutError::TransportStream(format!(
                    "Unexpected chunk stop reason: {reason}"
                )));
            }
        }
        let content = choice.delta.content.as_deref().unwrap_or_default();

        if debug {
            parser.ingest(content);
            if let Some(logger) = stream_logger.as_deref_mut() {
                logger(content);
            }
        } else {
            let increment =
                parser.incremental_property(content, PartialConversationTurn::user_message_of);
            if let Some(logger) = stream_logger.as_deref_mut() {
                logger(&increment);
            }
        }
    }

    if let Some(logger) = stream_logger.as_deref_mut() {
        logger("\n");
    }
    trace!("Raw turn: {}", parser.raw_input());
    parser.json()
}

fn to_tab_indented_json<T: Serialize>(value: &T) -> Result<String> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|e| SproutError::parse("Could not serialize JSON", e))?;
    String::from_utf8(buffer)
        .map_err(|e| SproutError::Configuration(format!("Serialized JSON is not UTF-8: {e}")))
}
