//! # grav_core
//!
//! Conversation model and workflow engine for Gravaity.
//!
//! This crate holds the decide / retrieve / generate state machine that
//! answers a question, together with the traits it is wired through.
//!
//! # Architecture
//!
//! - **Messages**: Tagged conversation messages and per-thread state
//! - **Tools**: Named capabilities the model may request, kept in a registry
//! - **Models**: Chat model abstraction with token streaming
//! - **Checkpoints**: Durable per-thread state written when a turn completes
//! - **Events**: Progress events published to an [`EventSink`]
//! - **Workflow**: The engine that runs turns with timeout and cancellation
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use grav_core::{
//!     InMemoryCheckpointStore, NoopSink, ToolRegistry, TurnOptions, WorkflowConfig,
//!     WorkflowEngine,
//! };
//!
//! let tools = ToolRegistry::new().with(Arc::new(MyRetriever));
//! let engine = WorkflowEngine::new(
//!     Arc::new(my_models),
//!     Arc::new(tools),
//!     Arc::new(InMemoryCheckpointStore::new()),
//!     Arc::new(NoopSink),
//!     WorkflowConfig::default(),
//! );
//!
//! let outcome = engine.run_turn("thread-1", "What is RAG?", TurnOptions::default()).await?;
//! println!("{}", outcome.answer);
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod locks;
pub mod message;
pub mod model;
pub mod state;
pub mod tool;
pub mod workflow;

// Re-export main types for convenience
pub use checkpoint::{storage_key, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use config::{
    DeliveryMode, ModelSettings, ProjectSearchSettings, RetrievalSettings, ServerSettings,
    Settings, StorageSettings, StreamBackend, StreamSettings, WebSearchSettings, WorkflowSettings,
};
pub use error::{CoreError, CoreResult};
pub use event::{
    EventSink, EventStatus, EventType, NoopSink, StreamEvent, DECIDE_NODE, GENERATE_NODE,
    TOOLS_NODE, WORKFLOW_NODE,
};
pub use locks::ThreadLocks;
pub use message::{Message, ToolRequest, UploadedDocument};
pub use model::{
    parse_arguments, reply_to_deltas, ChatModel, DeltaStream, ModelDelta, ModelProvider,
    ModelReply, ReplyAccumulator,
};
pub use state::{ConversationState, HistoryMessage, ThreadHistory, ThreadId};
pub use tool::{query_argument, query_schema, Tool, ToolDescriptor, ToolOutput, ToolRegistry};
pub use workflow::{
    TurnOptions, TurnOutcome, TurnPhase, WorkflowConfig, WorkflowEngine, PROJECT_SEARCH_TOOL,
    RETRIEVE_TOOL, WEB_SEARCH_TOOL,
};
