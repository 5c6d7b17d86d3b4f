//! Chat model abstraction.
//!
//! The workflow talks to language models only through [`ChatModel`]. A model
//! either answers in one call or yields a lazy sequence of [`ModelDelta`]
//! fragments that the caller folds together with a [`ReplyAccumulator`].

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CoreResult;
use crate::message::{Message, ToolRequest};
use crate::tool::ToolDescriptor;

/// A complete assistant reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    pub content: String,
    #[serde(default)]
    pub tool_requests: Vec<ToolRequest>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_requests: Vec::new(),
        }
    }

    pub fn with_tools(content: impl Into<String>, tool_requests: Vec<ToolRequest>) -> Self {
        Self {
            content: content.into(),
            tool_requests,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_requests.is_empty()
    }
}

/// An incremental fragment of a streamed reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelDelta {
    /// A piece of answer text
    Token(String),
    /// A piece of a tool call. Fragments with the same index belong together.
    ToolCall {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = CoreResult<ModelDelta>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier
    fn name(&self) -> &str;

    /// Single request/response completion.
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> CoreResult<ModelReply>;

    /// Streamed completion. Defaults to replaying a full completion.
    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> CoreResult<DeltaStream> {
        let reply = self.complete(messages, tools).await?;
        Ok(Box::pin(stream::iter(reply_to_deltas(reply).into_iter().map(Ok))))
    }
}

/// Split a reply into the deltas a streaming model would have produced.
pub fn reply_to_deltas(reply: ModelReply) -> Vec<ModelDelta> {
    let mut deltas = Vec::new();
    if !reply.content.is_empty() {
        deltas.push(ModelDelta::Token(reply.content));
    }
    for (index, request) in reply.tool_requests.into_iter().enumerate() {
        deltas.push(ModelDelta::ToolCall {
            index,
            id: Some(request.id),
            name: Some(request.name),
            arguments: request.arguments.to_string(),
        });
    }
    deltas
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Folds streamed deltas into a complete reply.
#[derive(Debug, Default)]
pub struct ReplyAccumulator {
    content: String,
    calls: BTreeMap<usize, PartialCall>,
}

impl ReplyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &ModelDelta) {
        match delta {
            ModelDelta::Token(text) => self.content.push_str(text),
            ModelDelta::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                let call = self.calls.entry(*index).or_default();
                if let Some(id) = id {
                    call.id = Some(id.clone());
                }
                if let Some(name) = name {
                    call.name.push_str(name);
                }
                call.arguments.push_str(arguments);
            }
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn finish(self) -> ModelReply {
        let tool_requests = self
            .calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let arguments = parse_arguments(&c.arguments);
                let request = ToolRequest::new(c.name, arguments);
                match c.id {
                    Some(id) => request.with_id(id),
                    None => request,
                }
            })
            .collect();
        ModelReply {
            content: self.content,
            tool_requests,
        }
    }
}

/// Parse accumulated tool arguments. Malformed JSON is kept as a raw string.
pub fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Resolves a model by name, falling back to the configured default.
pub trait ModelProvider: Send + Sync {
    fn model(&self, name: Option<&str>) -> CoreResult<Arc<dyn ChatModel>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_tokens_and_calls() {
        let mut acc = ReplyAccumulator::new();
        acc.push(&ModelDelta::Token("Let me ".into()));
        acc.push(&ModelDelta::Token("check.".into()));
        acc.push(&ModelDelta::ToolCall {
            index: 0,
            id: Some("call_a".into()),
            name: Some("retrieve_context".into()),
            arguments: "{\"que".into(),
        });
        acc.push(&ModelDelta::ToolCall {
            index: 1,
            id: Some("call_b".into()),
            name: Some("search_projects".into()),
            arguments: "{\"query\":\"acme\"}".into(),
        });
        acc.push(&ModelDelta::ToolCall {
            index: 0,
            id: None,
            name: None,
            arguments: "ry\":\"rag\"}".into(),
        });

        let reply = acc.finish();
        assert_eq!(reply.content, "Let me check.");
        assert_eq!(reply.tool_requests.len(), 2);
        assert_eq!(reply.tool_requests[0].id, "call_a");
        assert_eq!(reply.tool_requests[0].arguments, json!({"query": "rag"}));
        assert_eq!(reply.tool_requests[1].name, "search_projects");
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments("not json"), json!("not json"));
    }

    #[test]
    fn test_reply_to_deltas_roundtrip_through_accumulator() {
        let reply = ModelReply::with_tools(
            "",
            vec![ToolRequest::new("web_search", json!({"query": "news"})).with_id("c1")],
        );
        let mut acc = ReplyAccumulator::new();
        for delta in reply_to_deltas(reply.clone()) {
            acc.push(&delta);
        }
        assert_eq!(acc.finish(), reply);
    }
}
