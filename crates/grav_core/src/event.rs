//! Workflow stream events and the sink they are published to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Node name used for turn-level events.
pub const WORKFLOW_NODE: &str = "workflow";
/// Node name of the deciding step.
pub const DECIDE_NODE: &str = "query_or_respond";
/// Node name of the tool execution step.
pub const TOOLS_NODE: &str = "tools";
/// Node name of the answer generation step.
pub const GENERATE_NODE: &str = "generate";

/// Kind of stream event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Start,
    Output,
    Token,
    Complete,
    Error,
    Custom,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Output => "output",
            Self::Token => "token",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Custom => "custom",
        }
    }

    /// Whether this event ends a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Progress status carried by a stream event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Started,
    Starting,
    Running,
    Streaming,
    Completed,
    Failed,
}

/// A single progress event emitted while a turn runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    pub thread_id: String,
    pub node_name: String,
    pub message_type: EventType,
    pub status: EventStatus,
    /// Unix timestamp in seconds
    pub timestamp: f64,
    #[serde(rename = "data", default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl StreamEvent {
    pub fn new(
        thread_id: impl Into<String>,
        node_name: impl Into<String>,
        message_type: EventType,
        status: EventStatus,
        payload: Value,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            node_name: node_name.into(),
            message_type,
            status,
            timestamp: now_secs(),
            payload,
            execution_time_ms: None,
        }
    }

    pub fn with_execution_time(mut self, ms: f64) -> Self {
        self.execution_time_ms = Some(ms);
        self
    }

    /// Turn-level start event
    pub fn workflow_start(thread_id: &str, question: &str) -> Self {
        Self::new(
            thread_id,
            WORKFLOW_NODE,
            EventType::Start,
            EventStatus::Started,
            json!({ "question": question }),
        )
    }

    /// Inferred start of a node
    pub fn node_starting(thread_id: &str, node: &str) -> Self {
        Self::new(thread_id, node, EventType::Start, EventStatus::Starting, Value::Null)
    }

    /// Output of a completed node
    pub fn node_output(thread_id: &str, node: &str, payload: Value, elapsed_ms: f64) -> Self {
        Self::new(thread_id, node, EventType::Output, EventStatus::Completed, payload)
            .with_execution_time(elapsed_ms)
    }

    /// A streamed model fragment
    pub fn token(thread_id: &str, node: &str, content: &str) -> Self {
        Self::new(
            thread_id,
            node,
            EventType::Token,
            EventStatus::Streaming,
            json!({ "content": content }),
        )
    }

    /// Completion of a single tool call inside the tools node
    pub fn tool_finished(thread_id: &str, tool: &str, elapsed_ms: f64) -> Self {
        Self::new(
            thread_id,
            TOOLS_NODE,
            EventType::Custom,
            EventStatus::Completed,
            json!({ "tool": tool, "elapsed_ms": elapsed_ms }),
        )
        .with_execution_time(elapsed_ms)
    }

    pub fn workflow_complete(thread_id: &str, payload: Value, total_ms: f64) -> Self {
        Self::new(
            thread_id,
            WORKFLOW_NODE,
            EventType::Complete,
            EventStatus::Completed,
            payload,
        )
        .with_execution_time(total_ms)
    }

    pub fn workflow_error(
        thread_id: &str,
        error: &str,
        error_type: &str,
        timeout_seconds: Option<u64>,
    ) -> Self {
        let mut payload = json!({ "error": error, "error_type": error_type });
        if let Some(secs) = timeout_seconds {
            payload["timeout_seconds"] = json!(secs);
        }
        Self::new(
            thread_id,
            WORKFLOW_NODE,
            EventType::Error,
            EventStatus::Failed,
            payload,
        )
    }

    /// Name of the legacy pattern channel this event is broadcast on.
    pub fn channel(&self) -> String {
        format!(
            "workflow:{}:{}:{}",
            self.thread_id,
            self.node_name,
            self.message_type.as_str()
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.message_type.is_terminal()
    }
}

/// Destination for stream events.
///
/// Publishing is fire-and-forget: implementations log their own failures
/// and never hand them back to the workflow.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: StreamEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone)]
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn publish(&self, _event: StreamEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serialized_as_data() {
        let event = StreamEvent::token("t1", DECIDE_NODE, "Hel");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["data"]["content"], "Hel");
        assert_eq!(value["message_type"], "token");
        assert_eq!(value["status"], "streaming");
        assert!(value.get("execution_time_ms").is_none());
    }

    #[test]
    fn test_error_payload() {
        let event = StreamEvent::workflow_error("t1", "too slow", "timeout", Some(30));
        assert!(event.is_terminal());
        assert_eq!(event.payload["timeout_seconds"], 30);

        let event = StreamEvent::workflow_error("t1", "boom", "execution_error", None);
        assert!(event.payload.get("timeout_seconds").is_none());
    }

    #[test]
    fn test_channel_name() {
        let event = StreamEvent::node_output("thread_123", DECIDE_NODE, Value::Null, 1.0);
        assert_eq!(event.channel(), "workflow:thread_123:query_or_respond:output");
    }
}
