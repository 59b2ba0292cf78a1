use crate::error::{Result, SproutError};
use crate::llm::streaming::{ChunkStream, HttpChunkStream};
use crate::llm::types::CompletionRequest;
use crate::llm::{utils, ApiError, CompletionProvider};
use crate::types::{Prompt, PromptPart};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
}

#[derive(Debug, Serialize)]
struct OpenAIChatMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat Completions backend. No retries; the first failure is reported.
pub struct OpenAIProvider {
    client: Client,
    base_url: String,
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAIProvider {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn message_content(prompt: &Prompt) -> Value {
        match prompt {
            Prompt::Text(text) => Value::String(text.clone()),
            Prompt::Parts(parts) => Value::Array(
                parts
                    .iter()
                    .map(|part| match part {
                        PromptPart::Text(text) => json!({"type": "text", "text": text}),
                        PromptPart::Image { image } => {
                            json!({"type": "image_url", "image_url": {"url": image}})
                        }
                    })
                    .collect(),
            ),
        }
    }

    fn build_request(request: &CompletionRequest, stream: bool) -> OpenAIRequest {
        let has_images = request.prompt.includes_image();
        OpenAIRequest {
            model: request.model.clone(),
            messages: vec![OpenAIChatMessage {
                role: "user".to_string(),
                content: Self::message_content(&request.prompt),
            }],
            stream: stream.then_some(true),
            response_format: request
                .json_response
                .then(|| json!({"type": "json_object"})),
            // Only image prompts carry an explicit limit.
            max_tokens: has_images.then_some(request.max_tokens),
        }
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<Response> {
        let body = Self::build_request(request, stream);
        let url = self.completions_url();
        debug!("Sending request for {} to {}", body.model, url);
        trace!("Request prompt: {}", request.prompt.debug_text());

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", request.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;

        utils::check_response_error(response).await
    }
}

#[async_trait]
impl CompletionProvider for OpenAIProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let response = self.send(request, false).await?;
        let response_text = response
            .text()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;
        let openai_response: OpenAIResponse = serde_json::from_str(&response_text)
            .map_err(|e| ApiError::Unknown(format!("Failed to parse response: {}", e)))?;

        let choice = openai_response.choices.into_iter().next().ok_or_else(|| {
            SproutError::TransportStream("Completion response has no choices".to_string())
        })?;
        Ok(choice.message.content.unwrap_or_default())
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<Box<dyn ChunkStream>> {
        let response = self.send(request, true).await?;
        Ok(Box::new(HttpChunkStream::new(response)))
    }

    fn count_tokens(&self, text: &str) -> usize {
        utils::estimate_tokens(text)
    }
}
