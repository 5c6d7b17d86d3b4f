//! Project database search.
//!
//! Talks to an external project management API that issues bearer tokens
//! through a password grant. The token is cached; a 401 clears it, a new
//! one is acquired and the search is retried once.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use grav_core::{query_argument, query_schema, ProjectSearchSettings, Tool, ToolOutput, PROJECT_SEARCH_TOOL};

use crate::error::{ToolError, ToolResult};

const TECH_SUMMARY_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Search response from the project API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectPage {
    #[serde(default)]
    pub items: Vec<Value>,
    pub total: Option<u64>,
}

/// Client for the project API with token caching.
pub struct ProjectSearchClient {
    api_url: String,
    username: String,
    password: String,
    timeout: Duration,
    client: reqwest::Client,
    token: Mutex<Option<String>>,
}

impl ProjectSearchClient {
    pub fn new(
        api_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> ToolResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::NotConfigured(e.to_string()))?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            timeout,
            client,
            token: Mutex::new(None),
        })
    }

    /// Return the cached token or acquire a new one.
    async fn token(&self) -> ToolResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let response = self
            .client
            .post(format!("{}/api/auth/token", self.api_url))
            .form(&[
                ("grant_type", "password"),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let token: TokenResponse = response.json().await?;
        debug!("[PROJECT_SEARCH] Token acquired successfully");
        *cached = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    async fn clear_token(&self) {
        self.token.lock().await.take();
    }

    async fn search_once(&self, token: &str, query: &str, limit: usize) -> ToolResult<ProjectPage> {
        let limit = limit.to_string();
        let response = self
            .client
            .get(format!("{}/api/projects/search", self.api_url))
            .query(&[("query", query), ("limit", limit.as_str()), ("offset", "0")])
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }

    /// Search projects by keyword.
    pub async fn search(&self, query: &str, limit: usize) -> ToolResult<ProjectPage> {
        let search = async {
            let token = self.token().await?;
            match self.search_once(&token, query, limit).await {
                Err(e) if e.is_unauthorized() => {
                    debug!("[PROJECT_SEARCH] Token expired, refreshing...");
                    self.clear_token().await;
                    let token = self.token().await?;
                    self.search_once(&token, query, limit).await
                }
                other => other,
            }
        };
        // Bounds the whole exchange, token refresh included
        Ok(tokio::time::timeout(self.timeout * 2, search).await??)
    }
}

/// Render one project record.
pub fn format_project(project: &Value) -> String {
    let field = |key: &str| {
        project
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    };

    let mut lines = vec![format!("**{}**", field("project_name").unwrap_or("N/A"))];
    if let Some(company) = field("company_name") {
        lines.push(format!("- Company: {}", company));
    }
    if let Some(industry) = field("industry") {
        lines.push(format!("- Industry: {}", industry));
    }
    if let Some(tech) = field("core_technology") {
        let tech = if tech.chars().count() > TECH_SUMMARY_CHARS {
            format!("{}...", tech.chars().take(TECH_SUMMARY_CHARS).collect::<String>())
        } else {
            tech.to_string()
        };
        lines.push(format!("- Core technology: {}", tech));
    }
    let team: Vec<&str> = project
        .get("core_team")
        .and_then(Value::as_array)
        .map(|members| {
            members
                .iter()
                .filter_map(|m| m.get("name").and_then(Value::as_str))
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if !team.is_empty() {
        lines.push(format!("- Team: {}", team.join(", ")));
    }
    lines.join("\n")
}

enum Backend {
    Disabled,
    Unconfigured(&'static str),
    Ready(ProjectSearchClient),
}

/// The `search_projects` tool.
pub struct SearchProjectsTool {
    backend: Backend,
    result_limit: usize,
}

impl SearchProjectsTool {
    pub fn from_settings(settings: &ProjectSearchSettings) -> Self {
        let backend = if !settings.enabled {
            Backend::Disabled
        } else {
            match (&settings.api_url, &settings.username, &settings.password) {
                (None, _, _) => {
                    warn!("[PROJECT_SEARCH] API URL not configured");
                    Backend::Unconfigured("The project search service is not configured.")
                }
                (Some(_), None, _) | (Some(_), _, None) => {
                    warn!("[PROJECT_SEARCH] API credentials not configured");
                    Backend::Unconfigured("Project search credentials are not configured.")
                }
                (Some(url), Some(user), Some(password)) => match ProjectSearchClient::new(
                    url,
                    user.as_str(),
                    password.as_str(),
                    Duration::from_secs(settings.timeout_secs),
                ) {
                    Ok(client) => Backend::Ready(client),
                    Err(e) => {
                        error!("[PROJECT_SEARCH] Client setup failed: {}", e);
                        Backend::Unconfigured("The project search service could not be initialized.")
                    }
                },
            }
        };
        Self {
            backend,
            result_limit: settings.result_limit.max(1),
        }
    }

    pub fn with_client(client: ProjectSearchClient, result_limit: usize) -> Self {
        Self {
            backend: Backend::Ready(client),
            result_limit: result_limit.max(1),
        }
    }
}

#[async_trait]
impl Tool for SearchProjectsTool {
    fn name(&self) -> &str {
        PROJECT_SEARCH_TOOL
    }

    fn description(&self) -> &str {
        "Search the project database by keyword. Use this when the user asks about \
         specific companies or projects, their funding or their team."
    }

    fn parameters_schema(&self) -> Value {
        query_schema("Search keyword such as a company or project name")
    }

    async fn invoke(&self, arguments: &Value) -> ToolOutput {
        let client = match &self.backend {
            Backend::Disabled => return ToolOutput::failure("Project search is not enabled."),
            Backend::Unconfigured(reason) => return ToolOutput::failure(*reason),
            Backend::Ready(client) => client,
        };
        let Some(query) = query_argument(arguments) else {
            return ToolOutput::failure("Project search needs a non-empty 'query' argument.");
        };

        info!("[PROJECT_SEARCH] Searching for: {}", query);
        match client.search(&query, self.result_limit).await {
            Ok(page) if page.items.is_empty() => {
                info!("[PROJECT_SEARCH] No results found for: {}", query);
                ToolOutput::failure(format!("No projects found matching '{}'.", query))
            }
            Ok(page) => {
                info!("[PROJECT_SEARCH] Found {} result(s)", page.items.len());
                let total = page.total.unwrap_or(page.items.len() as u64);
                let text = format!(
                    "Found {} related project(s):\n\n{}",
                    total,
                    format_project(&page.items[0])
                );
                ToolOutput::new(text, page.items)
            }
            Err(ToolError::Timeout) => {
                error!("[PROJECT_SEARCH] API timeout");
                ToolOutput::failure("The project search service timed out. Please try again later.")
            }
            Err(e @ (ToolError::Status(_) | ToolError::Network(_))) => {
                error!("[PROJECT_SEARCH] HTTP error: {}", e);
                ToolOutput::failure("The project search service is temporarily unavailable.")
            }
            Err(e) => {
                error!("[PROJECT_SEARCH] Unexpected error: {}", e);
                ToolOutput::failure("Project search failed, please try again later.")
            }
        }
    }
}
