//! # grav_llm
//!
//! Language model access for Gravaity.
//!
//! - [`OpenAiChatModel`]: client for OpenAI-compatible chat completion APIs,
//!   with tool binding, SSE streaming and retry with backoff
//! - [`ModelGateway`]: resolves model names to clients through a bounded
//!   least-recently-used cache
//! - [`ScriptedModel`]: scripted model for tests

pub mod error;
pub mod gateway;
pub mod mock;
pub mod openai;
pub mod sse;

pub use error::{LlmError, LlmResult};
pub use gateway::ModelGateway;
pub use mock::{CapturedCall, ScriptedModel, ScriptedProvider};
pub use openai::OpenAiChatModel;
pub use sse::SseDecoder;
