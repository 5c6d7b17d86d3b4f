//! HTTP and WebSocket adapter.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | Run a turn and return the answer |
//! | `POST` | `/chat/stream` | Start a turn in the background |
//! | `POST` | `/chat/{thread_id}/cancel` | Cancel running turns of a thread |
//! | `GET`  | `/chat/{thread_id}/history` | User-visible history |
//! | `DELETE` | `/chat/{thread_id}` | Delete a thread |
//! | `GET`  | `/ws/{thread_id}?last_message_id=` | Event subscription |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `unavailable` (503), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted for browser clients.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};

use grav_core::ThreadHistory;
use grav_stream::Subscription;

use crate::error::{ServiceError, ServiceResult};
use crate::service::{
    CancelOutcome, ChatRequest, ChatResponse, ChatService, DeleteOutcome, StreamRequest,
    StreamStarted,
};

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Build the router over a chat service.
pub fn router(service: Arc<ChatService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/chat/stream", post(handle_chat_stream))
        .route("/chat/{thread_id}/cancel", post(handle_cancel))
        .route("/chat/{thread_id}/history", get(handle_history))
        .route("/chat/{thread_id}", delete(handle_delete))
        .route("/ws/{thread_id}", get(handle_ws))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(service)
}

/// Serve until `shutdown` resolves, then cancel running turns.
pub async fn serve(
    service: Arc<ChatService>,
    bind: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> ServiceResult<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| ServiceError::Unavailable(format!("cannot bind {}: {}", bind, e)))?;
    info!("Gravaity listening on http://{}", bind);

    axum::serve(listener, router(service.clone()))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServiceError::Internal(format!("server error: {}", e)))?;

    service.shutdown();
    Ok(())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Chat ============

async fn handle_chat(
    State(service): State<Arc<ChatService>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ServiceError> {
    Ok(Json(service.invoke(request).await?))
}

async fn handle_chat_stream(
    State(service): State<Arc<ChatService>>,
    Json(request): Json<StreamRequest>,
) -> Result<Json<StreamStarted>, ServiceError> {
    Ok(Json(service.start_stream(request).await?))
}

async fn handle_cancel(
    State(service): State<Arc<ChatService>>,
    Path(thread_id): Path<String>,
) -> Json<CancelOutcome> {
    Json(service.cancel(&thread_id))
}

async fn handle_history(
    State(service): State<Arc<ChatService>>,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadHistory>, ServiceError> {
    Ok(Json(service.history(&thread_id).await?))
}

async fn handle_delete(
    State(service): State<Arc<ChatService>>,
    Path(thread_id): Path<String>,
) -> Result<Json<DeleteOutcome>, ServiceError> {
    Ok(Json(service.delete_thread(&thread_id).await?))
}

// ============ GET /ws/{thread_id} ============

#[derive(Debug, Deserialize)]
struct WsQuery {
    last_message_id: Option<u64>,
}

async fn handle_ws(
    State(service): State<Arc<ChatService>>,
    Path(thread_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServiceError> {
    let subscription = service.subscribe(&thread_id, query.last_message_id).await?;
    Ok(ws.on_upgrade(move |socket| forward_events(socket, subscription)))
}

/// Forward frames as JSON text messages until either side goes away.
async fn forward_events(socket: WebSocket, mut subscription: Subscription) {
    let thread_id = subscription.thread_id().to_string();
    let (mut sender, mut receiver) = socket.split();
    debug!("WebSocket opened for thread {}", thread_id);

    loop {
        tokio::select! {
            frame = subscription.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode event for thread {}: {}", thread_id, e);
                        continue;
                    }
                };
                if sender.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.close().await;
    debug!("WebSocket closed for thread {}", thread_id);
}
