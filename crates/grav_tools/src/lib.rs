//! # grav_tools
//!
//! Tool capabilities bound to the deciding model call.
//!
//! - **retrieve_context**: document search over a [`VectorSearch`] backend,
//!   with an optional [`Reranker`]
//! - **search_projects**: project database lookups with cached bearer tokens
//! - **web_search**: Tavily web search
//!
//! Every tool turns its failures into readable text, so a broken backend
//! degrades an answer instead of failing the turn.

pub mod corpus;
pub mod error;
pub mod mock;
pub mod project_search;
pub mod retrieval;
pub mod web_search;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use grav_core::{Settings, ToolRegistry};

pub use corpus::KeywordCorpus;
pub use error::{ToolError, ToolResult};
pub use mock::MockTool;
pub use project_search::{format_project, ProjectPage, ProjectSearchClient, SearchProjectsTool};
pub use retrieval::{format_documents, Document, Reranker, RetrieveContextTool, VectorSearch};
pub use web_search::{format_results, WebSearchTool};

/// Build the default tool registry.
///
/// `search` overrides the document backend; without it the keyword corpus
/// under `retrieval.corpus_dir` is used.
pub fn default_registry(
    settings: &Settings,
    search: Option<Arc<dyn VectorSearch>>,
) -> ToolResult<ToolRegistry> {
    let search = match search {
        Some(search) => search,
        None => {
            let corpus = match &settings.retrieval.corpus_dir {
                Some(dir) => KeywordCorpus::load_dir(dir)?,
                None => {
                    warn!("No corpus directory configured; document search will find nothing");
                    KeywordCorpus::new()
                }
            };
            Arc::new(corpus)
        }
    };

    let registry = ToolRegistry::new()
        .with(Arc::new(
            RetrieveContextTool::new(search, settings.retrieval.top_k)
                .with_timeout(Duration::from_secs(settings.retrieval.timeout_secs)),
        ))
        .with(Arc::new(SearchProjectsTool::from_settings(
            &settings.project_search,
        )))
        .with(Arc::new(WebSearchTool::from_settings(&settings.web_search)?));

    info!("Registered tools: {:?}", registry.names());
    Ok(registry)
}
