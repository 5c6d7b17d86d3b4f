//! Web search through the Tavily API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use grav_core::{query_argument, query_schema, Tool, ToolOutput, WebSearchSettings, WEB_SEARCH_TOOL};

use crate::error::{ToolError, ToolResult};

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
    include_raw_content: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<Value>,
}

/// Render results as numbered `[i] title / URL / Content` blocks.
pub fn format_results(results: &[Value]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let field = |key: &str, fallback: &'static str| {
                result
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or(fallback)
                    .to_string()
            };
            format!(
                "[{}] {}\nURL: {}\nContent: {}",
                i + 1,
                field("title", "No title"),
                field("url", "No URL"),
                field("content", "No content")
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The `web_search` tool.
pub struct WebSearchTool {
    api_key: Option<String>,
    base_url: String,
    max_results: usize,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn from_settings(settings: &WebSearchSettings) -> ToolResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| ToolError::NotConfigured(e.to_string()))?;
        Ok(Self {
            api_key: settings.api_key.clone().filter(|k| !k.is_empty()),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_results: settings.max_results.max(1),
            client,
        })
    }

    async fn search(&self, api_key: &str, query: &str) -> ToolResult<Vec<Value>> {
        let request = SearchRequest {
            api_key,
            query,
            max_results: self.max_results,
            include_raw_content: true,
        };
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Status(status.as_u16()));
        }
        let body: SearchResponse = response.json().await?;
        Ok(body.results)
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        WEB_SEARCH_TOOL
    }

    fn description(&self) -> &str {
        "Search the web for real-time information such as recent news, current events \
         or anything not available in the knowledge base."
    }

    fn parameters_schema(&self) -> Value {
        query_schema("The search query")
    }

    async fn invoke(&self, arguments: &Value) -> ToolOutput {
        let Some(api_key) = self.api_key.as_deref() else {
            return ToolOutput::failure(
                "Web search is not configured. Please set TAVILY_API_KEY in environment variables.",
            );
        };
        let Some(query) = query_argument(arguments) else {
            return ToolOutput::failure("Web search needs a non-empty 'query' argument.");
        };

        info!("[WEB_SEARCH] Searching for: {}", query);
        match self.search(api_key, &query).await {
            Ok(results) if results.is_empty() => {
                ToolOutput::failure(format!("No web results found for '{}'.", query))
            }
            Ok(results) => ToolOutput::new(format_results(&results), results),
            Err(ToolError::Timeout) => {
                error!("[WEB_SEARCH] Request timed out");
                ToolOutput::failure("Web search timed out. Please try again later.")
            }
            Err(e @ (ToolError::Status(_) | ToolError::Network(_))) => {
                error!("[WEB_SEARCH] HTTP error: {}", e);
                ToolOutput::failure("The web search service is temporarily unavailable.")
            }
            Err(e) => {
                error!("[WEB_SEARCH] Search failed: {}", e);
                ToolOutput::failure(format!("Web search failed: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_results() {
        let results = vec![
            json!({"title": "Rust 2024", "url": "https://blog.rust-lang.org", "content": "Edition news"}),
            json!({"url": "https://example.com"}),
        ];
        let text = format_results(&results);
        assert!(text.starts_with("[1] Rust 2024\nURL: https://blog.rust-lang.org\nContent: Edition news"));
        assert!(text.ends_with("[2] No title\nURL: https://example.com\nContent: No content"));
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let tool = WebSearchTool::from_settings(&WebSearchSettings::default()).unwrap();
        let output = tool.invoke(&json!({"query": "news"})).await;
        assert!(output.text.contains("TAVILY_API_KEY"));
        assert!(output.artifacts.is_empty());
    }
}
