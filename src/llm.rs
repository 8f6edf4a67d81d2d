//! Language-model provider abstraction.
//!
//! The pipeline talks to a model through the [`LanguageModel`] trait: one
//! blocking completion for condensation and non-streaming answers, and a
//! delta stream for streaming answers.
//!
//! [`OpenAiCompatibleModel`] speaks the `/chat/completions` dialect shared by
//! the llama.cpp server, Ollama's `/v1` endpoint, and OpenAI itself. Images
//! attached to user turns are sent as `image_url` content parts.

use std::pin::Pin;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::models::{ChatContent, ChatRole, ChatTurn};

/// One incremental fragment of a streamed answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ChatRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl CompletionDelta {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            role: None,
            content: Some(content.into()),
        }
    }
}

/// A streaming response: deltas in arrival order, ending when the model stops.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<CompletionDelta>> + Send + 'static>>;

/// A chat model the pipeline can call.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier, for logs.
    fn name(&self) -> &str;

    /// Run the conversation to completion and return the assistant turn.
    async fn complete(&self, messages: &[ChatTurn]) -> Result<ChatTurn>;

    /// Start a streaming completion.
    ///
    /// Errors that happen before the first byte (connection refused, HTTP
    /// status) are returned here; later failures arrive as stream items.
    async fn complete_stream(&self, messages: &[ChatTurn]) -> Result<DeltaStream>;
}

/// Client for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiCompatibleModel {
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    max_retries: u32,
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl OpenAiCompatibleModel {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .with_context(|| format!("{} environment variable not set", var))?,
            ),
            None => None,
        };

        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        // A streamed answer may take arbitrarily long; only stalls are bounded.
        let stream_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            client,
            stream_client,
        })
    }

    fn request_body(&self, messages: &[ChatTurn], stream: bool) -> Result<serde_json::Value> {
        let wire: Vec<serde_json::Value> = messages.iter().map(wire_message).collect::<Result<_>>()?;
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire,
            "stream": stream,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = self.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }
        Ok(body)
    }

    /// POST the request, retrying 429, 5xx, and network errors with
    /// exponential backoff. Other statuses fail immediately.
    async fn send(
        &self,
        client: &reqwest::Client,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::warn!(model = %self.model, attempt, ?delay, "chat request failed, retrying");
                tokio::time::sleep(delay).await;
            }

            let mut req = client.post(&url).json(body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("model API error {}: {}", status, text));
                        continue;
                    }
                    bail!("model API error {}: {}", status, text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("model connection error ({}): {}", url, e));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("chat request failed after retries")))
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatTurn]) -> Result<ChatTurn> {
        let body = self.request_body(messages, false)?;
        let json: serde_json::Value = self
            .send(&self.client, &body)
            .await?
            .json()
            .await
            .context("Invalid chat completion response")?;
        parse_completion(&json)
    }

    async fn complete_stream(&self, messages: &[ChatTurn]) -> Result<DeltaStream> {
        let body = self.request_body(messages, true)?;
        let response = self.send(&self.stream_client, &body).await?;
        Ok(parse_sse_stream(response.bytes_stream()))
    }
}

/// Convert a turn to the chat-completions message shape.
fn wire_message(turn: &ChatTurn) -> Result<serde_json::Value> {
    let role = turn.role.as_str();
    Ok(match &turn.content {
        ChatContent::Text(text) => serde_json::json!({ "role": role, "content": text }),
        ChatContent::Multimodal { text, image } => serde_json::json!({
            "role": role,
            "content": [
                { "type": "text", "text": text },
                { "type": "image_url", "image_url": { "url": image.to_url()? } }
            ]
        }),
    })
}

fn parse_completion(json: &serde_json::Value) -> Result<ChatTurn> {
    if let Some(err) = json.get("error") {
        bail!("model returned an error: {}", err);
    }
    let message = json
        .pointer("/choices/0/message")
        .ok_or_else(|| anyhow::anyhow!("Invalid chat completion response: missing choices"))?;
    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    Ok(ChatTurn::assistant(content))
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    role: Option<String>,
    content: Option<String>,
}

struct SseState {
    byte_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
    ended: bool,
    done: bool,
}

/// Turn an SSE byte stream into [`CompletionDelta`]s.
///
/// Lines are split on raw bytes so a multi-byte character cut across two
/// network reads is decoded intact. The stream ends at `data: [DONE]` or
/// when the connection closes; an unterminated last line still counts.
fn parse_sse_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> DeltaStream {
    Box::pin(futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(byte_stream),
            buffer: Vec::new(),
            ended: false,
            done: false,
        },
        |mut state| async move {
            if state.done {
                return None;
            }

            loop {
                while let Some(line_end) = state.buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = state.buffer.drain(..=line_end).collect();
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim();

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim_start();
                    if data == "[DONE]" {
                        state.done = true;
                        return None;
                    }

                    match parse_stream_data(data) {
                        Ok(Some(delta)) => return Some((Ok(delta), state)),
                        Ok(None) => {}
                        Err(e) => {
                            state.done = true;
                            return Some((Err(e), state));
                        }
                    }
                }

                if state.ended {
                    return None;
                }
                match state.byte_stream.next().await {
                    Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(anyhow::anyhow!("stream interrupted: {}", e)), state));
                    }
                    None => {
                        // Flush a final line the server sent without a newline.
                        state.ended = true;
                        if state.buffer.is_empty() {
                            return None;
                        }
                        state.buffer.push(b'\n');
                    }
                }
            }
        },
    ))
}

/// Parse one `data:` payload. Returns `None` for chunks carrying nothing
/// the caller needs (keep-alives, finish markers, unknown shapes).
fn parse_stream_data(data: &str) -> Result<Option<CompletionDelta>> {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    if let Some(err) = value.get("error") {
        bail!("model returned an error mid-stream: {}", err);
    }
    let Ok(chunk) = serde_json::from_value::<StreamChunk>(value) else {
        return Ok(None);
    };
    let Some(delta) = chunk.choices.into_iter().next().and_then(|c| c.delta) else {
        return Ok(None);
    };

    let role = match delta.role.as_deref() {
        Some("assistant") => Some(ChatRole::Assistant),
        Some("user") => Some(ChatRole::User),
        _ => None,
    };
    let content = delta.content.filter(|c| !c.is_empty());
    if role.is_none() && content.is_none() {
        return Ok(None);
    }
    Ok(Some(CompletionDelta { role, content }))
}
