//! Document search over a vector store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use grav_core::{query_argument, query_schema, Tool, ToolOutput, RETRIEVE_TOOL};

use crate::error::{ToolError, ToolResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A retrieved document chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Similarity search backend.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Return up to `k` documents ranked by relevance to `query`.
    async fn search(&self, query: &str, k: usize) -> ToolResult<Vec<Document>>;
}

/// Optional post-filter over ranked documents.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: Vec<Document>) -> ToolResult<Vec<Document>>;
}

/// Render documents as `Source: ...\nContent: ...` blocks.
pub fn format_documents(documents: &[Document]) -> String {
    documents
        .iter()
        .map(|doc| {
            format!(
                "Source: {}\nContent: {}",
                Value::Object(doc.metadata.clone()),
                doc.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The `retrieve_context` tool.
pub struct RetrieveContextTool {
    search: Arc<dyn VectorSearch>,
    reranker: Option<Arc<dyn Reranker>>,
    top_k: usize,
    timeout: Duration,
}

impl RetrieveContextTool {
    pub fn new(search: Arc<dyn VectorSearch>, top_k: usize) -> Self {
        Self {
            search,
            reranker: None,
            top_k: top_k.max(1),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Search then rerank, bounded by the tool's timeout.
    async fn retrieve(&self, query: &str) -> ToolResult<Vec<Document>> {
        tokio::time::timeout(self.timeout, self.search_and_rerank(query)).await?
    }

    async fn search_and_rerank(&self, query: &str) -> ToolResult<Vec<Document>> {
        let documents = self.search.search(query, self.top_k).await?;
        match &self.reranker {
            Some(reranker) if !documents.is_empty() => reranker.rerank(query, documents).await,
            _ => Ok(documents),
        }
    }
}

#[async_trait]
impl Tool for RetrieveContextTool {
    fn name(&self) -> &str {
        RETRIEVE_TOOL
    }

    fn description(&self) -> &str {
        "Retrieve information from the document knowledge base to help answer a query."
    }

    fn parameters_schema(&self) -> Value {
        query_schema("What to look up in the knowledge base")
    }

    async fn invoke(&self, arguments: &Value) -> ToolOutput {
        let Some(query) = query_argument(arguments) else {
            return ToolOutput::failure("Document search needs a non-empty 'query' argument.");
        };

        debug!("[RETRIEVE] Searching for: {}", query);
        match self.retrieve(&query).await {
            Ok(documents) if documents.is_empty() => {
                info!("[RETRIEVE] No documents for: {}", query);
                ToolOutput::failure(format!("No relevant documents were found for '{}'.", query))
            }
            Ok(documents) => {
                info!("[RETRIEVE] Found {} document(s)", documents.len());
                let artifacts = documents
                    .iter()
                    .filter_map(|d| serde_json::to_value(d).ok())
                    .collect();
                ToolOutput::new(format_documents(&documents), artifacts)
            }
            Err(ToolError::Timeout) => {
                error!("[RETRIEVE] Search timed out after {:?}", self.timeout);
                ToolOutput::failure("Document search timed out. Please try again later.")
            }
            Err(e) => {
                error!("[RETRIEVE] Search failed: {}", e);
                ToolOutput::failure("Document search is temporarily unavailable. Please try again later.")
            }
        }
    }
}
