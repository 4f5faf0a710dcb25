//! HTTP client for the OpenAI chat completion and embedding endpoints.

use crate::completion::{CompletionService, Embedder};
use crate::history::Message;
use crate::stream::TextStream;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4-1106-preview";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";

const DONE_MARKER: &str = "[DONE]";

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: SecretString,
    base_url: String,
    chat_model: String,
    embedding_model: String,
}

impl OpenAiClient {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_chat_model(mut self, model: &str) -> Self {
        self.chat_model = model.to_string();
        self
    }

    pub fn with_embedding_model(mut self, model: &str) -> Self {
        self.embedding_model = model.to_string();
        self
    }

    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// A POST to `path` carrying the bearer token. Shared with the audio endpoints.
    pub fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(self.endpoint(path))
            .bearer_auth(self.api_key.expose_secret())
    }
}

/// Fails with the response body attached when the status is not a success.
pub async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("{} failed with status {}: {}", what, status, body)
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Splits a server-sent event byte stream into `data:` payloads.
#[derive(Debug, Default)]
pub struct SseBuffer {
    pending: Vec<u8>,
}

impl SseBuffer {
    /// Appends `bytes` and returns the payloads of every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

/// Extracts the text delta from one streamed chunk. Role-only and empty deltas yield `None`.
fn parse_chunk(data: &str) -> Result<Option<String>> {
    let chunk: ChatChunk =
        serde_json::from_str(data).with_context(|| format!("malformed stream chunk: {data}"))?;
    if let Some(error) = chunk.error {
        anyhow::bail!("completion stream error: {}", error.message);
    }
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

struct DeltaState<B, E> {
    bytes: BoxStream<'static, Result<B, E>>,
    sse: SseBuffer,
    pending: VecDeque<Result<String>>,
    done: bool,
}

impl<B: AsRef<[u8]>, E> DeltaState<B, E> {
    fn accept(&mut self, bytes: &[u8]) {
        for data in self.sse.push(bytes) {
            if self.done {
                break;
            }
            if data == DONE_MARKER {
                self.done = true;
                break;
            }
            match parse_chunk(&data) {
                Ok(Some(text)) => self.pending.push_back(Ok(text)),
                Ok(None) => {}
                Err(e) => {
                    self.pending.push_back(Err(e));
                    self.done = true;
                }
            }
        }
    }
}

/// Turns the raw body of a streaming chat completion into its text deltas.
///
/// Ends at `[DONE]` or when the body ends; a transport or payload error is
/// yielded once and ends the stream.
pub fn text_deltas<S, B, E>(bytes: S) -> TextStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    let state = DeltaState {
        bytes: bytes.boxed(),
        sse: SseBuffer::default(),
        pending: VecDeque::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.accept(chunk.as_ref()),
                Some(Err(e)) => {
                    state.done = true;
                    let e: anyhow::Error = e.into();
                    return Some((Err(e.context("completion stream interrupted")), state));
                }
                None => state.done = true,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl CompletionService for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<TextStream> {
        let request = ChatRequest {
            model: &self.chat_model,
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_api_str(),
                    content: &m.content,
                })
                .collect(),
            stream: true,
        };

        let response = self.post("chat/completions").json(&request).send().await?;
        let response = check_status(response, "chat completion").await?;
        Ok(text_deltas(response.bytes_stream()))
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: text,
        };
        let response = self.post("embeddings").json(&request).send().await?;
        let response = check_status(response, "embedding request").await?;
        let body = response.json::<EmbeddingResponse>().await?;
        Ok(body.data.into_iter().next().map(|data| data.embedding))
    }
}
