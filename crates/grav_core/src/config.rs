//! Service configuration.
//!
//! Settings are read from an optional TOML file, every field falling back
//! to a documented default, and then overlaid with environment variables.
//!
//! ```toml
//! [model]
//! name = "qwen-plus-latest"
//! base_url = "https://dashscope.aliyuncs.com/compatible-mode/v1"
//!
//! [stream]
//! backend = "file"
//! delivery_mode = "legacy"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to a document \
knowledge base, a project database and, when enabled, web search.

Rules:
- Use retrieve_context for questions about documents in the knowledge base.
- Use search_projects for questions about specific companies or projects, together with retrieve_context.
- Use web_search only for recent events or information outside the knowledge base.
- Answer directly without tools for greetings and general questions.
- Never fabricate information. If nothing relevant is found, say so.

Current time: {time}";

pub const DEFAULT_GENERATE_PROMPT: &str = "Answer the question using the retrieved context below. \
Cite the key points you rely on. If the context does not contain the answer, say that the \
information was not found.

Question:
{question}

Retrieved context:
{documents}";

/// Top-level settings record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub workflow: WorkflowSettings,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub project_search: ProjectSearchSettings,
    #[serde(default)]
    pub web_search: WebSearchSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

/// Chat model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Default model name, overridable per call
    pub name: String,
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    /// Maximum number of configured model clients kept alive
    pub cache_size: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            name: "qwen-plus-latest".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            temperature: 0.7,
            max_retries: 2,
            request_timeout_secs: 120,
            cache_size: 10,
        }
    }
}

/// Workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Wall-clock budget for one turn
    pub turn_timeout_secs: u64,
    /// Stream model output token by token
    pub streaming: bool,
    /// System instruction; `{time}` is replaced with the current time
    pub system_prompt: String,
    /// Answer template; `{question}` and `{documents}` are substituted
    pub generate_prompt: String,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            turn_timeout_secs: 300,
            streaming: true,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            generate_prompt: DEFAULT_GENERATE_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    /// Directory of text documents searched when no vector backend is wired in
    pub corpus_dir: Option<PathBuf>,
    /// Budget for one search including reranking
    pub timeout_secs: u64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 2,
            corpus_dir: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSearchSettings {
    pub enabled: bool,
    pub api_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub result_limit: usize,
}

impl Default for ProjectSearchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: None,
            username: None,
            password: None,
            timeout_secs: 10,
            result_limit: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSearchSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub max_results: usize,
    pub timeout_secs: u64,
}

impl Default for WebSearchSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.tavily.com".to_string(),
            max_results: 5,
            timeout_secs: 15,
        }
    }
}

/// Durable event log backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamBackend {
    Memory,
    File,
}

/// How node progress is reported to subscribers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Node completions, tokens and terminal events only
    Simplified,
    /// Also emits inferred node-start events and serves wildcard channels
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Retain events in the durable log. Disabled means live broadcast only.
    pub enabled: bool,
    pub backend: StreamBackend,
    /// Maximum retained events per thread
    pub max_length: usize,
    /// Retention window, refreshed on every append
    pub ttl_secs: u64,
    pub delivery_mode: DeliveryMode,
    /// Buffered events per live channel before a subscriber lags
    pub channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: StreamBackend::Memory,
            max_length: 1000,
            ttl_secs: 3600,
            delivery_mode: DeliveryMode::Simplified,
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".grav"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut settings = Self::from_toml(&content)?;
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overlaid with environment variables.
    pub fn from_env() -> CoreResult<Self> {
        let mut settings = Self::default();
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> CoreResult<Self> {
        toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Overlay environment variables onto the current values.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok().filter(|v| !v.is_empty()));
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(model) = var("GRAV_MODEL") {
            self.model.name = model;
        }
        if let Some(url) = var("GRAV_LLM_BASE_URL") {
            self.model.base_url = url;
        }
        if let Some(key) = var("GRAV_LLM_API_KEY").or_else(|| var("OPENAI_API_KEY")) {
            self.model.api_key = Some(key);
        }
        if let Some(dir) = var("GRAV_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(bind) = var("GRAV_BIND") {
            self.server.bind = bind;
        }
        if let Some(key) = var("TAVILY_API_KEY") {
            self.web_search.api_key = Some(key);
        }
        if let Some(url) = var("PROJECT_SEARCH_API_URL") {
            self.project_search.api_url = Some(url);
            self.project_search.enabled = true;
        }
        if let Some(user) = var("PROJECT_SEARCH_API_USERNAME") {
            self.project_search.username = Some(user);
        }
        if let Some(password) = var("PROJECT_SEARCH_API_PASSWORD") {
            self.project_search.password = Some(password);
        }
        if let Some(secs) = var("GRAV_TURN_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.workflow.turn_timeout_secs = secs;
        }
        if let Some(enabled) = var("GRAV_STREAM_ENABLED") {
            self.stream.enabled = enabled.to_lowercase() != "false";
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.workflow.turn_timeout_secs == 0 {
            return Err(CoreError::Config("workflow.turn_timeout_secs must be > 0".into()));
        }
        if self.model.cache_size == 0 {
            return Err(CoreError::Config("model.cache_size must be > 0".into()));
        }
        if self.retrieval.top_k == 0 {
            return Err(CoreError::Config("retrieval.top_k must be > 0".into()));
        }
        if self.stream.max_length == 0 {
            return Err(CoreError::Config("stream.max_length must be > 0".into()));
        }
        if self.stream.channel_capacity == 0 {
            return Err(CoreError::Config("stream.channel_capacity must be > 0".into()));
        }
        if self.retrieval.timeout_secs == 0
            || self.project_search.timeout_secs == 0
            || self.web_search.timeout_secs == 0
        {
            return Err(CoreError::Config("tool timeouts must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.model.cache_size, 10);
        assert_eq!(settings.retrieval.top_k, 2);
        assert_eq!(settings.stream.max_length, 1000);
        assert_eq!(settings.stream.ttl_secs, 3600);
        assert_eq!(settings.stream.delivery_mode, DeliveryMode::Simplified);
        assert!(settings.workflow.system_prompt.contains("{time}"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let settings = Settings::from_toml(
            r#"
            [model]
            name = "qwen-max-latest"

            [stream]
            backend = "file"
            delivery_mode = "legacy"
            "#,
        )
        .unwrap();

        assert_eq!(settings.model.name, "qwen-max-latest");
        assert_eq!(settings.model.max_retries, 2);
        assert_eq!(settings.stream.backend, StreamBackend::File);
        assert_eq!(settings.stream.delivery_mode, DeliveryMode::Legacy);
        assert!(settings.stream.enabled);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = Settings::from_toml("[stream]\nbackend = \"redis-cluster\"\n");
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("GRAV_MODEL", "qwen-flash"),
            ("PROJECT_SEARCH_API_URL", "http://projects.local"),
            ("GRAV_TURN_TIMEOUT_SECS", "42"),
            ("GRAV_STREAM_ENABLED", "false"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_vars(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(settings.model.name, "qwen-flash");
        assert!(settings.project_search.enabled);
        assert_eq!(settings.workflow.turn_timeout_secs, 42);
        assert!(!settings.stream.enabled);
    }

    #[test]
    fn test_validation() {
        let mut settings = Settings::default();
        settings.workflow.turn_timeout_secs = 0;
        assert!(settings.validate().is_err());
    }
}
