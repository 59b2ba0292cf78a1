//! Chunk sources for streamed completions.
//!
//! A live HTTP response and a recorded session are consumed through the same
//! [`ChunkStream`] trait, so everything downstream behaves identically for both.

use crate::error::{Result, SproutError};
use crate::llm::recording::RecordedChunk;
use crate::llm::types::{ApiError, CompletionChunk};
use async_trait::async_trait;
use reqwest::Response;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::trace;

/// A lazy, single-pass sequence of completion chunks.
///
/// `Ok(None)` marks the end of the stream. Dropping a stream before the end is how a
/// consumer cancels it.
#[async_trait]
pub trait ChunkStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<CompletionChunk>>;
}

/// Server-Sent-Events stream of a Chat Completions response.
pub struct HttpChunkStream {
    response: Response,
    line_buffer: Vec<u8>,
    pending: VecDeque<CompletionChunk>,
    done: bool,
}

impl HttpChunkStream {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            line_buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn process_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        for &byte in bytes {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line_buffer);
                self.process_line(&line)?;
            } else {
                self.line_buffer.push(byte);
            }
        }
        Ok(())
    }

    fn process_line(&mut self, line: &[u8]) -> Result<()> {
        if self.done {
            return Ok(());
        }
        let line = std::str::from_utf8(line)
            .map_err(|e| SproutError::TransportStream(format!("Invalid UTF-8 in stream: {e}")))?
            .trim_end_matches('\r');

        // Comments, event names and blank separators carry no payload.
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            self.done = true;
            return Ok(());
        }

        trace!("Received stream event: '{}'", data);
        let chunk = serde_json::from_str::<CompletionChunk>(data).map_err(|e| {
            SproutError::TransportStream(format!("Failed to parse stream event '{data}': {e}"))
        })?;
        self.pending.push_back(chunk);
        Ok(())
    }
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<CompletionChunk>> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Ok(Some(chunk));
            }
            if self.done {
                return Ok(None);
            }
            match self.response.chunk().await {
                Ok(Some(bytes)) => self.process_bytes(&bytes)?,
                Ok(None) => {
                    if !self.line_buffer.is_empty() {
                        let line = std::mem::take(&mut self.line_buffer);
                        self.process_line(&line)?;
                    }
                    self.done = true;
                }
                Err(e) => return Err(ApiError::NetworkError(e.to_string()).into()),
            }
        }
    }
}

/// Replays recorded chunks, optionally with their original pacing.
pub struct PlaybackChunkStream {
    chunks: Vec<RecordedChunk>,
    current_index: usize,
    start_time: Instant,
    simulate_timing: bool,
}

impl PlaybackChunkStream {
    pub fn new(chunks: Vec<RecordedChunk>, simulate_timing: bool) -> Self {
        Self {
            chunks,
            current_index: 0,
            start_time: Instant::now(),
            simulate_timing,
        }
    }
}

#[async_trait]
impl ChunkStream for PlaybackChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<CompletionChunk>> {
        let Some(chunk) = self.chunks.get(self.current_index) else {
            return Ok(None);
        };

        if self.simulate_timing {
            let elapsed = self.start_time.elapsed();
            let expected_time = Duration::from_millis(chunk.timestamp_ms);
            if elapsed < expected_time {
                tokio::time::sleep(expected_time - elapsed).await;
            }
        }

        self.current_index += 1;
        serde_json::from_str(&chunk.data)
            .map(Some)
            .map_err(|e| SproutError::TransportStream(format!("Corrupt recorded chunk: {e}")))
    }
}
