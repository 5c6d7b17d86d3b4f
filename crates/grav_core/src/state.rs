//! Per-thread conversation state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Stable identity of a conversation.
pub type ThreadId = String;

/// Full conversation state persisted in the checkpoint store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(rename = "threadId")]
    pub thread_id: ThreadId,
    /// Causally ordered history of the conversation
    pub messages: Vec<Message>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    /// Create an empty state for a new thread
    pub fn new(thread_id: impl Into<ThreadId>) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
        self.updated_at = Utc::now();
    }

    /// Content of the most recent answer, if any.
    pub fn last_answer(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_answer())
            .map(|m| m.content())
    }

    /// The user-visible projection of the history.
    pub fn visible_history(&self) -> Vec<HistoryMessage> {
        self.messages
            .iter()
            .filter(|m| m.is_user_visible())
            .map(HistoryMessage::from)
            .collect()
    }
}

/// A message as shown in thread history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryMessage {
    pub id: String,
    /// `user` or `assistant`
    pub role: String,
    pub content: String,
    /// Unix timestamp in seconds
    pub timestamp: f64,
}

impl From<&Message> for HistoryMessage {
    fn from(message: &Message) -> Self {
        let role = match message {
            Message::User { .. } => "user",
            Message::System { .. } => "system",
            Message::ToolResult { .. } => "tool",
            Message::AssistantDecision { .. } | Message::AssistantFinal { .. } => "assistant",
        };
        Self {
            id: message.id().to_string(),
            role: role.to_string(),
            content: message.content().to_string(),
            timestamp: message.created_at().timestamp_millis() as f64 / 1000.0,
        }
    }
}

/// History response for a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadHistory {
    pub thread_id: ThreadId,
    pub messages: Vec<HistoryMessage>,
    pub total_messages: usize,
}

impl ThreadHistory {
    pub fn from_state(state: &ConversationState) -> Self {
        let messages = state.visible_history();
        Self {
            thread_id: state.thread_id.clone(),
            total_messages: messages.len(),
            messages,
        }
    }

    pub fn empty(thread_id: impl Into<ThreadId>) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages: Vec::new(),
            total_messages: 0,
        }
    }
}
