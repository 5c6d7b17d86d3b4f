//! Chat service: the entry points shared by the HTTP adapter and the CLI.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use grav_core::{CoreError, ThreadHistory, TurnOptions, TurnOutcome, UploadedDocument};
use grav_stream::{EventFrame, Subscription};

use crate::context::AppContext;
use crate::error::{ServiceError, ServiceResult};

/// Synchronous chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub thread_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub chat_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub thread_id: String,
    pub user_id: Option<String>,
    pub answer: String,
}

/// Streaming chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub thread_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub chat_model: Option<String>,
    #[serde(default)]
    pub documents: Vec<UploadedDocument>,
    #[serde(default)]
    pub enable_websearch: bool,
}

/// Acknowledgement of a turn started in the background.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStarted {
    pub thread_id: String,
    pub user_id: Option<String>,
    /// Channel pattern covering every event of the thread
    pub ws_channel: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub thread_id: String,
    pub deleted_checkpoints: usize,
    pub deleted_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub thread_id: String,
    pub cancelled: usize,
}

struct RunningTurn {
    id: u64,
    cancel: CancellationToken,
}

type RunningTurns = Arc<Mutex<HashMap<String, Vec<RunningTurn>>>>;

fn require(field: &str, value: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::BadRequest(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Main chat entry point.
pub struct ChatService {
    ctx: Arc<AppContext>,
    running: RunningTurns,
    next_turn: AtomicU64,
}

impl ChatService {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            running: Arc::new(Mutex::new(HashMap::new())),
            next_turn: AtomicU64::new(1),
        }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Run a turn and wait for its answer.
    pub async fn invoke(&self, request: ChatRequest) -> ServiceResult<ChatResponse> {
        require("thread_id", &request.thread_id)?;
        require("message", &request.message)?;

        let options = TurnOptions {
            chat_model: request.chat_model,
            user_id: request.user_id.clone(),
            ..TurnOptions::default()
        };
        let outcome = self
            .ctx
            .engine
            .run_turn(&request.thread_id, &request.message, options)
            .await?;

        Ok(ChatResponse {
            thread_id: request.thread_id,
            user_id: request.user_id,
            answer: outcome.answer,
        })
    }

    /// Start a turn in the background and return immediately.
    ///
    /// The checkpoint store is read first, so an unavailable store is
    /// reported to the caller instead of failing silently in the task.
    pub async fn start_stream(&self, request: StreamRequest) -> ServiceResult<StreamStarted> {
        let (started, _) = self.spawn_stream(request).await?;
        Ok(started)
    }

    /// Like [`start_stream`](Self::start_stream), also returning the task
    /// so a caller in the same process can wait for the outcome.
    pub async fn spawn_stream(
        &self,
        request: StreamRequest,
    ) -> ServiceResult<(StreamStarted, JoinHandle<Result<TurnOutcome, CoreError>>)> {
        require("thread_id", &request.thread_id)?;
        require("message", &request.message)?;
        if self.ctx.is_shut_down() {
            return Err(ServiceError::Unavailable("Service is shutting down".to_string()));
        }
        self.ctx.checkpoints.load(&request.thread_id).await?;

        let thread_id = request.thread_id.clone();
        let id = self.next_turn.fetch_add(1, Ordering::SeqCst);
        let cancel = self.ctx.turn_token();
        self.running
            .lock()
            .entry(thread_id.clone())
            .or_default()
            .push(RunningTurn {
                id,
                cancel: cancel.clone(),
            });

        let options = TurnOptions {
            chat_model: request.chat_model,
            enable_websearch: request.enable_websearch,
            documents: request.documents,
            user_id: request.user_id.clone(),
        };
        let engine = self.ctx.engine.clone();
        let running = self.running.clone();
        let message = request.message;
        let task_thread = thread_id.clone();

        let handle = tokio::spawn(async move {
            let result = engine
                .run_turn_with_cancel(&task_thread, &message, options, cancel)
                .await;
            match &result {
                Ok(outcome) => debug!(
                    "Streaming turn for thread {} finished in {:.0}ms",
                    task_thread, outcome.total_ms
                ),
                Err(CoreError::Cancelled) => info!("Streaming turn for thread {} cancelled", task_thread),
                Err(e) => error!("Streaming turn for thread {} failed: {}", task_thread, e),
            }

            let mut by_thread = running.lock();
            if let Some(turns) = by_thread.get_mut(&task_thread) {
                turns.retain(|turn| turn.id != id);
                if turns.is_empty() {
                    by_thread.remove(&task_thread);
                }
            }
            drop(by_thread);
            result
        });

        info!("Started streaming turn for thread {}", thread_id);
        Ok((
            StreamStarted {
                ws_channel: format!("workflow:{}:*", thread_id),
                thread_id,
                user_id: request.user_id,
                status: "streaming".to_string(),
            },
            handle,
        ))
    }

    /// Cancel the running streaming turns of a thread.
    pub fn cancel(&self, thread_id: &str) -> CancelOutcome {
        let turns = self.running.lock().remove(thread_id).unwrap_or_default();
        for turn in &turns {
            turn.cancel.cancel();
        }
        if !turns.is_empty() {
            info!("Cancelled {} turn(s) for thread {}", turns.len(), thread_id);
        }
        CancelOutcome {
            thread_id: thread_id.to_string(),
            cancelled: turns.len(),
        }
    }

    /// Number of streaming turns still running.
    pub fn running_turns(&self) -> usize {
        self.running.lock().values().map(Vec::len).sum()
    }

    /// User-visible history of a thread. Unknown threads are empty.
    pub async fn history(&self, thread_id: &str) -> ServiceResult<ThreadHistory> {
        require("thread_id", thread_id)?;
        Ok(match self.ctx.checkpoints.load(thread_id).await? {
            Some(state) => ThreadHistory::from_state(&state),
            None => ThreadHistory::empty(thread_id),
        })
    }

    /// Remove a thread's checkpoint and retained events. Idempotent.
    pub async fn delete_thread(&self, thread_id: &str) -> ServiceResult<DeleteOutcome> {
        require("thread_id", thread_id)?;
        // Streaming turns stop at once; a synchronous turn finishes and
        // saves before the engine lets the delete through.
        self.cancel(thread_id);

        let deleted_checkpoints = self.ctx.engine.delete_thread(thread_id).await?;
        let deleted_events = match self.ctx.publisher.delete_thread(thread_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to delete event log for thread {}: {}", thread_id, e);
                0
            }
        };
        info!(
            "Deleted thread {} ({} checkpoint(s), {} event(s))",
            thread_id, deleted_checkpoints, deleted_events
        );
        Ok(DeleteOutcome {
            thread_id: thread_id.to_string(),
            deleted_checkpoints,
            deleted_events,
        })
    }

    /// Subscribe to a thread's events.
    pub async fn subscribe(
        &self,
        thread_id: &str,
        last_message_id: Option<u64>,
    ) -> ServiceResult<Subscription> {
        require("thread_id", thread_id)?;
        Ok(self.ctx.publisher.subscribe(thread_id, last_message_id).await?)
    }

    /// Retained events of a thread.
    pub async fn events(&self, thread_id: &str, after: Option<u64>) -> ServiceResult<Vec<EventFrame>> {
        require("thread_id", thread_id)?;
        Ok(self.ctx.publisher.history(thread_id, after).await?)
    }

    /// Cancel every running turn and refuse new streaming turns.
    pub fn shutdown(&self) {
        let running = self.running_turns();
        self.ctx.shutdown();
        info!("Chat service shut down ({} turn(s) cancelled)", running);
    }
}
