//! Scripted chat model for testing.
//!
//! Returns predefined replies in order and captures every call, so tests
//! can drive the workflow without a model endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::RwLock;

use grav_core::{
    ChatModel, CoreResult, DeltaStream, Message, ModelDelta, ModelProvider, ModelReply,
    ToolDescriptor,
};

use crate::error::LlmError;

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
    pub streamed: bool,
}

/// Chat model answering from a script.
#[derive(Clone)]
pub struct ScriptedModel {
    name: String,
    replies: Arc<RwLock<Vec<ModelReply>>>,
    reply_index: Arc<AtomicUsize>,
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    delay: Arc<RwLock<Duration>>,
    simulate_failure: Arc<RwLock<Option<String>>>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::named("scripted")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            replies: Arc::new(RwLock::new(Vec::new())),
            reply_index: Arc::new(AtomicUsize::new(0)),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            delay: Arc::new(RwLock::new(Duration::ZERO)),
            simulate_failure: Arc::new(RwLock::new(None)),
        }
    }

    /// Queue a reply for the next call.
    pub fn add_reply(self, reply: ModelReply) -> Self {
        self.replies.write().push(reply);
        self
    }

    /// Queue a plain text reply.
    pub fn add_text(self, text: impl Into<String>) -> Self {
        self.add_reply(ModelReply::text(text))
    }

    /// Sleep before answering each call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.write() = delay;
        self
    }

    /// Fail every call with the given message.
    pub fn fail_with(self, message: impl Into<String>) -> Self {
        *self.simulate_failure.write() = Some(message.into());
        self
    }

    pub fn captured_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }

    pub fn reset(&self) {
        self.replies.write().clear();
        self.captured_calls.write().clear();
        self.reply_index.store(0, Ordering::SeqCst);
    }

    async fn next_reply(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        streamed: bool,
    ) -> CoreResult<ModelReply> {
        self.captured_calls.write().push(CapturedCall {
            messages: messages.to_vec(),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
            streamed,
        });

        let delay = *self.delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.simulate_failure.read().clone() {
            return Err(LlmError::InvalidResponse(message).into());
        }

        let index = self.reply_index.fetch_add(1, Ordering::SeqCst);
        self.replies
            .read()
            .get(index)
            .cloned()
            .ok_or_else(|| LlmError::ScriptExhausted(index).into())
    }
}

/// Split text into word-sized tokens, keeping whitespace attached.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> CoreResult<ModelReply> {
        self.next_reply(messages, tools, false).await
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> CoreResult<DeltaStream> {
        let reply = self.next_reply(messages, tools, true).await?;
        let mut deltas: Vec<CoreResult<ModelDelta>> = tokenize(&reply.content)
            .into_iter()
            .map(|t| Ok(ModelDelta::Token(t)))
            .collect();
        for (index, request) in reply.tool_requests.into_iter().enumerate() {
            deltas.push(Ok(ModelDelta::ToolCall {
                index,
                id: Some(request.id),
                name: Some(request.name),
                arguments: request.arguments.to_string(),
            }));
        }
        Ok(Box::pin(stream::iter(deltas)))
    }
}

/// Provider serving scripted models by name.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    default: ScriptedModel,
    models: Arc<RwLock<HashMap<String, ScriptedModel>>>,
}

impl ScriptedProvider {
    pub fn new(default: ScriptedModel) -> Self {
        Self {
            default,
            models: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Serve `model` for its name.
    pub fn with_model(self, model: ScriptedModel) -> Self {
        self.models.write().insert(model.name.clone(), model);
        self
    }

    pub fn default_model(&self) -> &ScriptedModel {
        &self.default
    }
}

impl ModelProvider for ScriptedProvider {
    fn model(&self, name: Option<&str>) -> CoreResult<Arc<dyn ChatModel>> {
        let model = name
            .and_then(|n| self.models.read().get(n).cloned())
            .unwrap_or_else(|| self.default.clone());
        Ok(Arc::new(model))
    }
}
