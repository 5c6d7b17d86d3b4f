//! Chat client for OpenAI-compatible `/chat/completions` APIs.
//!
//! Works against any provider exposing the OpenAI wire format (OpenAI,
//! DashScope compatible mode, vLLM, Ollama). Supports tool binding and
//! server-sent-event streaming.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use grav_core::{
    ChatModel, CoreResult, DeltaStream, Message, ModelDelta, ModelReply, ModelSettings,
    ToolDescriptor, ToolRequest,
};

use crate::error::{LlmError, LlmResult};
use crate::sse::SseDecoder;

/// Client for one model on an OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAiChatModel {
    model: String,
    base_url: String,
    api_key: Option<String>,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiChatModel {
    pub fn new(model: impl Into<String>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            temperature: 0.7,
            max_retries: 2,
            client: reqwest::Client::new(),
        }
    }

    /// Build a client for `model` from the model settings.
    pub fn from_settings(settings: &ModelSettings, model: &str) -> LlmResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| LlmError::NotConfigured(e.to_string()))?;
        Ok(Self {
            model: model.to_string(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            temperature: settings.temperature,
            max_retries: settings.max_retries,
            client,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request<'a>(
        &'a self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: messages.iter().map(WireMessage::from).collect(),
            temperature: self.temperature,
            tools: tools.iter().map(WireTool::from).collect(),
            stream,
        }
    }

    /// POST the request, retrying network errors, 429 and 5xx with exponential backoff.
    async fn send(&self, request: &ChatRequest<'_>) -> LlmResult<reqwest::Response> {
        let attempts = self.max_retries + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                // 500ms, 1s, 2s, ...
                let delay = Duration::from_millis(500 << (attempt - 1));
                tokio::time::sleep(delay).await;
            }

            let mut builder = self
                .client
                .post(self.endpoint())
                .header("Content-Type", "application/json")
                .json(request);
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key);
            }

            let error = match builder.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    LlmError::Api { status, body }
                }
                Err(e) => LlmError::from(e),
            };

            if !error.is_retryable() {
                return Err(error);
            }
            warn!(
                "Model {} request failed (attempt {}/{}): {}",
                self.model,
                attempt + 1,
                attempts,
                error
            );
            last_error = Some(error);
        }

        Err(LlmError::RetriesExhausted {
            attempts,
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    pub async fn complete_reply(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> LlmResult<ModelReply> {
        let request = self.request(messages, tools, false);
        let response = self.send(&request).await?;
        let body: ChatResponse = response.json().await?;
        let message = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))?;

        let tool_requests = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                ToolRequest::new(
                    call.function.name,
                    grav_core::parse_arguments(&call.function.arguments),
                )
                .with_id(call.id)
            })
            .collect();

        Ok(ModelReply {
            content: message.content.unwrap_or_default(),
            tool_requests,
        })
    }

    pub async fn stream_reply(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> LlmResult<DeltaStream> {
        let request = self.request(messages, tools, true);
        let response = self.send(&request).await?;
        debug!("Streaming response from model {}", self.model);

        let bytes: ByteStream = Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec())));
        let state = StreamState {
            bytes,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        };
        Ok(Box::pin(futures::stream::unfold(state, next_delta)))
    }
}

impl std::fmt::Debug for OpenAiChatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatModel")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> CoreResult<ModelReply> {
        Ok(self.complete_reply(messages, tools).await?)
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> CoreResult<DeltaStream> {
        Ok(self.stream_reply(messages, tools).await?)
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

struct StreamState {
    bytes: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<ModelDelta>,
    done: bool,
}

impl StreamState {
    /// Queue the deltas of one payload. Returns false on the `[DONE]` marker.
    fn accept(&mut self, payload: &str) -> LlmResult<bool> {
        if payload == "[DONE]" {
            return Ok(false);
        }
        self.pending.extend(parse_chunk(payload)?);
        Ok(true)
    }
}

async fn next_delta(mut state: StreamState) -> Option<(CoreResult<ModelDelta>, StreamState)> {
    loop {
        if let Some(delta) = state.pending.pop_front() {
            return Some((Ok(delta), state));
        }
        if state.done {
            return None;
        }

        let payloads = match state.bytes.next().await {
            Some(Ok(chunk)) => state.decoder.push(&chunk),
            Some(Err(e)) => {
                state.done = true;
                return Some((Err(LlmError::from(e).into()), state));
            }
            None => {
                state.done = true;
                state.decoder.finish().into_iter().collect()
            }
        };

        for payload in payloads {
            match state.accept(&payload) {
                Ok(true) => {}
                Ok(false) => {
                    state.done = true;
                    break;
                }
                Err(e) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
            }
        }
    }
}

/// Parse one streamed chunk into deltas.
pub fn parse_chunk(payload: &str) -> LlmResult<Vec<ModelDelta>> {
    let chunk: StreamChunk = serde_json::from_str(payload)?;
    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                deltas.push(ModelDelta::Token(content));
            }
        }
        for call in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match call.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            deltas.push(ModelDelta::ToolCall {
                index: call.index,
                id: call.id,
                name,
                arguments,
            });
        }
    }
    Ok(deltas)
}

// Wire types

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    stream: bool,
}

#[derive(Debug, Serialize, PartialEq)]
struct WireMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        let plain = |role| Self {
            role,
            content: Some(message.content().to_string()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        };
        match message {
            Message::System { .. } => plain("system"),
            Message::User { .. } => plain("user"),
            Message::AssistantFinal { .. } => plain("assistant"),
            Message::AssistantDecision {
                content,
                tool_requests,
                ..
            } => Self {
                role: "assistant",
                content: (!content.is_empty() || tool_requests.is_empty()).then(|| content.clone()),
                tool_calls: tool_requests.iter().map(WireToolCall::from).collect(),
                tool_call_id: None,
            },
            Message::ToolResult {
                tool_call_id,
                content,
                ..
            } => Self {
                role: "tool",
                content: Some(content.clone()),
                tool_calls: Vec::new(),
                tool_call_id: Some(tool_call_id.clone()),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunction,
}

fn function_kind() -> String {
    "function".to_string()
}

impl From<&ToolRequest> for WireToolCall {
    fn from(request: &ToolRequest) -> Self {
        let arguments = match &request.arguments {
            Value::String(raw) => raw.clone(),
            other => other.to_string(),
        };
        Self {
            id: request.id.clone(),
            kind: function_kind(),
            function: WireFunction {
                name: request.name.clone(),
                arguments,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireToolSpec,
}

#[derive(Debug, Serialize)]
struct WireToolSpec {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolDescriptor> for WireTool {
    fn from(descriptor: &ToolDescriptor) -> Self {
        Self {
            kind: "function",
            function: WireToolSpec {
                name: descriptor.name.clone(),
                description: descriptor.description.clone(),
                parameters: descriptor.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}
