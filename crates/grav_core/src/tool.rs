//! Tool capabilities and their registry.
//!
//! A tool is a named, callable unit the model may request during the
//! deciding step. Tools never fail a turn: expected failures are turned
//! into human-readable text inside `invoke`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// Result of a tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolOutput {
    /// Text shown to the model
    pub text: String,
    /// Structured records kept for citation
    #[serde(default)]
    pub artifacts: Vec<Value>,
}

impl ToolOutput {
    pub fn new(text: impl Into<String>, artifacts: Vec<Value>) -> Self {
        Self {
            text: text.into(),
            artifacts,
        }
    }

    /// A humanized failure: text only, no artifacts.
    pub fn failure(text: impl Into<String>) -> Self {
        Self::new(text, Vec::new())
    }
}

/// Descriptor bound to a model call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments
    pub parameters: Value,
}

/// Schema for tools that take a single `query` string.
pub fn query_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string", "description": description }
        },
        "required": ["query"]
    })
}

/// Extract the `query` argument, accepting a bare string as well.
pub fn query_argument(arguments: &Value) -> Option<String> {
    let query = match arguments {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("query")?.as_str()?,
        _ => return None,
    };
    let query = query.trim();
    (!query.is_empty()).then(|| query.to_string())
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value {
        query_schema("Search query")
    }

    /// Run the tool. Never fails; failures are reported in the text.
    async fn invoke(&self, arguments: &Value) -> ToolOutput;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Ordered collection of tools, looked up by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool under its `name()`, replacing one with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        debug!("Registering tool: {}", tool.name());
        match self.tools.iter().position(|t| t.name() == tool.name()) {
            Some(idx) => self.tools[idx] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Descriptors of the tools accepted by `filter`, in registration order.
    pub fn descriptors(&self, filter: impl Fn(&str) -> bool) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .filter(|t| filter(t.name()))
            .map(|t| t.descriptor())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
