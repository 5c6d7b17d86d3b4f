//! # grav_service
//!
//! Runs Gravaity as a service.
//!
//! [`AppContext`] holds the shared resources built from [`grav_core::Settings`],
//! [`ChatService`] exposes invocation, streaming, history, deletion and
//! cancellation on top of it, and [`http`] serves those over axum with a
//! WebSocket endpoint for event subscriptions.

pub mod context;
pub mod error;
pub mod http;
pub mod service;

pub use context::AppContext;
pub use error::{ServiceError, ServiceResult};
pub use http::{router, serve};
pub use service::{
    CancelOutcome, ChatRequest, ChatResponse, ChatService, DeleteOutcome, StreamRequest,
    StreamStarted,
};
