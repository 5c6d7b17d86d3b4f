//! Mock tool for testing.
//!
//! Returns predefined outputs, optionally after a delay, and captures the
//! arguments of every call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use grav_core::{Tool, ToolOutput};

/// Configurable mock implementation of [`Tool`].
#[derive(Clone)]
pub struct MockTool {
    name: String,
    description: String,
    responses: Arc<RwLock<Vec<ToolOutput>>>,
    response_index: Arc<AtomicUsize>,
    captured_calls: Arc<RwLock<Vec<Value>>>,
    delay: Arc<RwLock<Duration>>,
}

impl MockTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: "Mock tool".to_string(),
            responses: Arc::new(RwLock::new(Vec::new())),
            response_index: Arc::new(AtomicUsize::new(0)),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            delay: Arc::new(RwLock::new(Duration::ZERO)),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add an output for the next call. The last output repeats once exhausted.
    pub fn add_response(self, output: ToolOutput) -> Self {
        self.responses.write().push(output);
        self
    }

    pub fn add_text(self, text: impl Into<String>) -> Self {
        self.add_response(ToolOutput::new(text, Vec::new()))
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.write() = delay;
        self
    }

    pub fn captured_calls(&self) -> Vec<Value> {
        self.captured_calls.read().clone()
    }

    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, arguments: &Value) -> ToolOutput {
        self.captured_calls.write().push(arguments.clone());

        let delay = *self.delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let index = self.response_index.fetch_add(1, Ordering::SeqCst);
        let responses = self.responses.read();
        responses
            .get(index)
            .or_else(|| responses.last())
            .cloned()
            .unwrap_or_else(|| ToolOutput::failure(format!("{} has no scripted output.", self.name)))
    }
}
