//! Shared application context.
//!
//! Everything a request needs is built once at startup and shared behind
//! `Arc`s: the checkpoint store, the event publisher, the model gateway,
//! the tool registry and the workflow engine wired from them.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use grav_core::{
    CheckpointStore, FileCheckpointStore, ModelProvider, Settings, ToolRegistry, WorkflowConfig,
    WorkflowEngine,
};
use grav_llm::ModelGateway;
use grav_stream::EventPublisher;
use grav_tools::default_registry;

use crate::error::ServiceResult;

pub struct AppContext {
    pub settings: Settings,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub publisher: Arc<EventPublisher>,
    pub models: Arc<dyn ModelProvider>,
    pub tools: Arc<ToolRegistry>,
    pub engine: Arc<WorkflowEngine>,
    shutdown: CancellationToken,
}

impl AppContext {
    /// Build the production context from settings.
    ///
    /// Fails when the checkpoint directory cannot be created. An unusable
    /// event log only degrades streaming to live delivery.
    pub fn init(settings: Settings) -> ServiceResult<Self> {
        settings.validate()?;
        let data_dir = settings.storage.data_dir.clone();

        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::open(&data_dir)?);
        let publisher = Arc::new(EventPublisher::from_settings(&settings.stream, &data_dir));
        let models: Arc<dyn ModelProvider> = Arc::new(ModelGateway::from_settings(&settings.model));
        let tools = Arc::new(default_registry(&settings, None)?);

        info!(
            "Application context ready (data dir {}, model {}, durable events: {})",
            data_dir.display(),
            settings.model.name,
            publisher.is_durable()
        );
        Ok(Self::from_parts(settings, models, tools, checkpoints, publisher))
    }

    /// Wire a context from already-built parts.
    pub fn from_parts(
        settings: Settings,
        models: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        let engine = Arc::new(WorkflowEngine::new(
            models.clone(),
            tools.clone(),
            checkpoints.clone(),
            publisher.clone(),
            WorkflowConfig::from(&settings),
        ));
        Self {
            settings,
            checkpoints,
            publisher,
            models,
            tools,
            engine,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token for work that must stop when the context shuts down.
    pub fn turn_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop every turn started from this context. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down application context");
            self.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_storage() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.storage.data_dir = dir.path().to_path_buf();

        let ctx = AppContext::init(settings).unwrap();
        assert!(dir.path().join("threads").is_dir());
        assert_eq!(ctx.tools.len(), 3);
        assert!(ctx.publisher.is_durable());
    }

    #[test]
    fn test_shutdown_cancels_turn_tokens() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.storage.data_dir = dir.path().to_path_buf();
        let ctx = AppContext::init(settings).unwrap();

        let token = ctx.turn_token();
        assert!(!token.is_cancelled());
        ctx.shutdown();
        ctx.shutdown();
        assert!(token.is_cancelled());
        assert!(ctx.is_shut_down());
    }

    #[test]
    fn test_init_fails_on_unusable_data_dir() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let mut settings = Settings::default();
        settings.storage.data_dir = blocker;
        let err = AppContext::init(settings).err().unwrap();
        assert_eq!(err.code(), "unavailable");
    }
}
