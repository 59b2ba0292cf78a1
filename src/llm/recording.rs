use crate::error::{Result, SproutError};
use crate::llm::streaming::{ChunkStream, PlaybackChunkStream};
use crate::llm::types::{CompletionChunk, CompletionRequest};
use crate::llm::{utils, CompletionProvider};
use crate::types::Prompt;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One model call: the prompt that was sent and every chunk that came back.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordingSession {
    pub model: String,
    pub prompt: Prompt,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub chunks: Vec<RecordedChunk>,
}

/// Single recorded chunk with timing info
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordedChunk {
    /// Chunk JSON as it appeared in the `data:` line
    pub data: String,
    /// Milliseconds since the session started
    pub timestamp_ms: u64,
}

impl RecordedChunk {
    pub fn from_chunk(chunk: &CompletionChunk, timestamp_ms: u64) -> Self {
        Self {
            // A plain derived struct always serializes.
            data: serde_json::to_string(chunk).unwrap_or_default(),
            timestamp_ms,
        }
    }
}

/// Reads every session stored in a recording file.
pub async fn load_sessions(path: &Path) -> Result<Vec<RecordingSession>> {
    let content = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&content).map_err(|e| {
        SproutError::parse(
            format!("Could not read recording file {}", path.display()),
            e,
        )
    })
}

/// Appends `session` to the JSON array in `path`, creating the file when needed.
pub async fn append_session(path: &Path, session: RecordingSession) -> Result<()> {
    let mut sessions = if tokio::fs::try_exists(path).await? {
        load_sessions(path).await?
    } else {
        Vec::new()
    };
    sessions.push(session);
    let json = serde_json::to_string_pretty(&sessions)
        .map_err(|e| SproutError::parse("Could not serialize recording", e))?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

/// Passes chunks through unchanged while keeping a copy. The session is saved once the
/// wrapped stream reports its end; a stream dropped early is not recorded.
pub struct StreamRecorder {
    inner: Box<dyn ChunkStream>,
    path: PathBuf,
    session: Option<RecordingSession>,
    start_time: Instant,
}

impl StreamRecorder {
    pub fn new(inner: Box<dyn ChunkStream>, path: PathBuf, model: String, prompt: Prompt) -> Self {
        Self {
            inner,
            path,
            session: Some(RecordingSession {
                model,
                prompt,
                timestamp: chrono::Utc::now(),
                chunks: Vec::new(),
            }),
            start_time: Instant::now(),
        }
    }
}

#[async_trait]
impl ChunkStream for StreamRecorder {
    async fn next_chunk(&mut self) -> Result<Option<CompletionChunk>> {
        let next = self.inner.next_chunk().await?;
        match &next {
            Some(chunk) => {
                let timestamp_ms = self.start_time.elapsed().as_millis() as u64;
                if let Some(session) = self.session.as_mut() {
                    session
                        .chunks
                        .push(RecordedChunk::from_chunk(chunk, timestamp_ms));
                }
            }
            None => {
                if let Some(session) = self.session.take() {
                    debug!(
                        "Saving recording with {} chunks to {}",
                        session.chunks.len(),
                        self.path.display()
                    );
                    append_session(&self.path, session).await?;
                }
            }
        }
        Ok(next)
    }
}

/// Wraps another backend and records every call it serves.
pub struct RecordingProvider {
    inner: Arc<dyn CompletionProvider>,
    path: PathBuf,
}

impl RecordingProvider {
    pub fn new(inner: Arc<dyn CompletionProvider>, path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            path: path.into(),
        }
    }
}

#[async_trait]
impl CompletionProvider for RecordingProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let text = self.inner.complete(request).await?;
        let session = RecordingSession {
            model: request.model.clone(),
            prompt: request.prompt.clone(),
            timestamp: chrono::Utc::now(),
            chunks: vec![
                RecordedChunk::from_chunk(&CompletionChunk::content(text.clone()), 0),
                RecordedChunk::from_chunk(&CompletionChunk::finished("stop"), 0),
            ],
        };
        append_session(&self.path, session).await?;
        Ok(text)
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<Box<dyn ChunkStream>> {
        let stream = self.inner.complete_stream(request).await?;
        Ok(Box::new(StreamRecorder::new(
            stream,
            self.path.clone(),
            request.model.clone(),
            request.prompt.clone(),
        )))
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.inner.count_tokens(text)
    }
}

/// Serves recorded sessions in order instead of calling a model.
pub struct PlaybackProvider {
    sessions: Mutex<VecDeque<RecordingSession>>,
    simulate_timing: bool,
}

impl PlaybackProvider {
    pub fn new(sessions: Vec<RecordingSession>, simulate_timing: bool) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            simulate_timing,
        }
    }

    pub async fn from_file(path: &Path, simulate_timing: bool) -> Result<Self> {
        let sessions = load_sessions(path).await?;
        debug!(
            "Loaded {} recorded sessions from {}",
            sessions.len(),
            path.display()
        );
        Ok(Self::new(sessions, simulate_timing))
    }

    async fn next_session(&self, request: &CompletionRequest) -> Result<RecordingSession> {
        let session = self.sessions.lock().await.pop_front().ok_or_else(|| {
            SproutError::Configuration("No recorded sessions left to play back".to_string())
        })?;
        if session.prompt != request.prompt {
            warn!("Playing back a session recorded for a different prompt");
        }
        Ok(session)
    }
}

#[async_trait]
impl CompletionProvider for PlaybackProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let session = self.next_session(request).await?;
        let mut stream = PlaybackChunkStream::new(session.chunks, false);
        let mut text = String::new();
        while let Some(chunk) = stream.next_chunk().await? {
            if let Some(content) = chunk.choices.first().and_then(|c| c.delta.content.as_ref()) {
                text.push_str(content);
            }
        }
        Ok(text)
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<Box<dyn ChunkStream>> {
        let session = self.next_session(request).await?;
        Ok(Box::new(PlaybackChunkStream::new(
            session.chunks,
            self.simulate_timing,
        )))
    }

    fn count_tokens(&self, text: &str) -> usize {
        utils::estimate_tokens(text)
    }
}
