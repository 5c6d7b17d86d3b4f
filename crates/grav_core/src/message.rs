//! Conversation messages.
//!
//! Messages are a tagged union over the roles a conversation can contain.
//! The `role` discriminant is serialized alongside the payload so that
//! checkpoints and history responses stay self-describing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request, emitted by the model, to invoke a named tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRequest {
    /// Call identifier assigned by the model (or generated when absent)
    pub id: String,
    /// Name of the tool to invoke
    pub name: String,
    /// JSON arguments for the tool
    #[serde(default)]
    pub arguments: Value,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// A document uploaded alongside a question and inlined into it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadedDocument {
    pub name: String,
    pub content: String,
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        id: String,
        content: String,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
    },
    User {
        id: String,
        content: String,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
    },
    /// Output of the deciding model call. Carries the tools it wants run.
    AssistantDecision {
        id: String,
        content: String,
        #[serde(rename = "toolRequests", default)]
        tool_requests: Vec<ToolRequest>,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
    },
    AssistantFinal {
        id: String,
        content: String,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
    },
    ToolResult {
        id: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<Value>,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
    },
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Message {
    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            id: new_id(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            id: new_id(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Create a user message with uploaded documents appended to the question.
    pub fn user_with_documents(question: &str, documents: &[UploadedDocument]) -> Self {
        let mut content = question.to_string();
        for doc in documents {
            content.push_str("\n\n---\n");
            content.push_str(&format!("Attached document: {}\n\n", doc.name));
            content.push_str(doc.content.trim());
        }
        Self::user(content)
    }

    pub fn decision(content: impl Into<String>, tool_requests: Vec<ToolRequest>) -> Self {
        Self::AssistantDecision {
            id: new_id(),
            content: content.into(),
            tool_requests,
            created_at: Utc::now(),
        }
    }

    pub fn final_answer(content: impl Into<String>) -> Self {
        Self::AssistantFinal {
            id: new_id(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn tool_result(
        request: &ToolRequest,
        content: impl Into<String>,
        artifacts: Vec<Value>,
    ) -> Self {
        Self::ToolResult {
            id: new_id(),
            tool_call_id: request.id.clone(),
            tool_name: request.name.clone(),
            content: content.into(),
            artifacts,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::System { id, .. }
            | Self::User { id, .. }
            | Self::AssistantDecision { id, .. }
            | Self::AssistantFinal { id, .. }
            | Self::ToolResult { id, .. } => id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System { content, .. }
            | Self::User { content, .. }
            | Self::AssistantDecision { content, .. }
            | Self::AssistantFinal { content, .. }
            | Self::ToolResult { content, .. } => content,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::System { created_at, .. }
            | Self::User { created_at, .. }
            | Self::AssistantDecision { created_at, .. }
            | Self::AssistantFinal { created_at, .. }
            | Self::ToolResult { created_at, .. } => *created_at,
        }
    }

    /// Serialized role discriminant.
    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::AssistantDecision { .. } => "assistant_decision",
            Self::AssistantFinal { .. } => "assistant_final",
            Self::ToolResult { .. } => "tool_result",
        }
    }

    /// Tool requests attached to a decision. Empty for every other role.
    pub fn tool_requests(&self) -> &[ToolRequest] {
        match self {
            Self::AssistantDecision { tool_requests, .. } => tool_requests,
            _ => &[],
        }
    }

    /// Whether the message belongs in the history shown to users.
    ///
    /// Decisions that requested tools and the tool results themselves are
    /// intermediate steps and are filtered out.
    pub fn is_user_visible(&self) -> bool {
        match self {
            Self::User { .. } | Self::AssistantFinal { .. } => true,
            Self::AssistantDecision { tool_requests, .. } => tool_requests.is_empty(),
            Self::System { .. } | Self::ToolResult { .. } => false,
        }
    }

    /// Whether this message is an answer produced by the model.
    pub fn is_answer(&self) -> bool {
        match self {
            Self::AssistantFinal { .. } => true,
            Self::AssistantDecision { tool_requests, .. } => tool_requests.is_empty(),
            _ => false,
        }
    }
}
