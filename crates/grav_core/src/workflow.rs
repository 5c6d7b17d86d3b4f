//! The conversation turn state machine.
//!
//! A turn moves through at most three nodes:
//!
//! ```text
//! DECIDING ──(no tool requests)──────────────────────────► DONE
//!    │
//!    └──(tool requests)──► EXECUTING_TOOLS ──► GENERATING ──► DONE
//! ```
//!
//! Any error, the turn timeout, or caller cancellation ends the turn in
//! FAILED. Only DONE writes a checkpoint.
//!
//! Every transition is reported to the configured [`EventSink`]. Model
//! tokens travel through a separate per-node channel whose forwarder is
//! joined before the node's completion event, so a node's tokens always
//! precede its output.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{DeliveryMode, Settings, DEFAULT_GENERATE_PROMPT, DEFAULT_SYSTEM_PROMPT};
use crate::error::{CoreError, CoreResult};
use crate::event::{
    EventSink, StreamEvent, DECIDE_NODE, GENERATE_NODE, TOOLS_NODE, WORKFLOW_NODE,
};
use crate::locks::ThreadLocks;
use crate::message::{Message, ToolRequest, UploadedDocument};
use crate::model::{ChatModel, ModelDelta, ModelProvider, ModelReply, ReplyAccumulator};
use crate::state::ConversationState;
use crate::tool::{ToolDescriptor, ToolOutput, ToolRegistry};

/// Document search tool, bound on every turn.
pub const RETRIEVE_TOOL: &str = "retrieve_context";
/// Project database tool, bound when enabled in configuration.
pub const PROJECT_SEARCH_TOOL: &str = "search_projects";
/// Web search tool, bound when the caller asks for it.
pub const WEB_SEARCH_TOOL: &str = "web_search";

const TOKEN_CHANNEL_CAPACITY: usize = 256;

/// Phase of a running turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnPhase {
    Deciding,
    ExecutingTools,
    Generating,
    Done,
    Failed,
}

impl TurnPhase {
    /// Node name reported in events for this phase.
    pub fn node_name(&self) -> &'static str {
        match self {
            Self::Deciding => DECIDE_NODE,
            Self::ExecutingTools => TOOLS_NODE,
            Self::Generating => GENERATE_NODE,
            Self::Done | Self::Failed => WORKFLOW_NODE,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Engine-level settings.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub system_prompt: String,
    pub generate_prompt: String,
    pub turn_timeout: Duration,
    pub streaming: bool,
    pub delivery_mode: DeliveryMode,
    pub project_search_enabled: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            generate_prompt: DEFAULT_GENERATE_PROMPT.to_string(),
            turn_timeout: Duration::from_secs(300),
            streaming: true,
            delivery_mode: DeliveryMode::Simplified,
            project_search_enabled: false,
        }
    }
}

impl From<&Settings> for WorkflowConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            system_prompt: settings.workflow.system_prompt.clone(),
            generate_prompt: settings.workflow.generate_prompt.clone(),
            turn_timeout: Duration::from_secs(settings.workflow.turn_timeout_secs),
            streaming: settings.workflow.streaming,
            delivery_mode: settings.stream.delivery_mode,
            project_search_enabled: settings.project_search.enabled,
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnOptions {
    /// Model override for this turn
    pub chat_model: Option<String>,
    /// Bind the web search tool
    #[serde(default)]
    pub enable_websearch: bool,
    /// Documents inlined into the user message
    #[serde(default)]
    pub documents: Vec<UploadedDocument>,
    pub user_id: Option<String>,
}

/// Result of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub thread_id: String,
    pub answer: String,
    /// Messages appended to the conversation by this turn
    pub messages: Vec<Message>,
    /// Elapsed milliseconds per node
    pub node_times: BTreeMap<String, f64>,
    pub total_ms: f64,
}

impl TurnOutcome {
    pub fn tool_results(&self) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(|m| matches!(m, Message::ToolResult { .. }))
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Per-turn switch for token publishing.
///
/// Forwarders publish while holding the lock, so once [`close`](Self::close)
/// returns no token of the turn can reach the sink anymore.
struct TokenGate {
    open: tokio::sync::Mutex<bool>,
}

impl TokenGate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: tokio::sync::Mutex::new(true),
        })
    }

    async fn publish(&self, events: &dyn EventSink, event: StreamEvent) {
        let open = self.open.lock().await;
        if *open {
            events.publish(event).await;
        }
    }

    /// Wait for an in-flight token publish, then drop every later one.
    async fn close(&self) {
        *self.open.lock().await = false;
    }
}

/// Forwards one node's tokens to the event sink from a separate task.
struct TokenForwarder {
    tx: Option<mpsc::Sender<String>>,
    handle: Option<JoinHandle<()>>,
}

impl TokenForwarder {
    fn spawn(
        events: Arc<dyn EventSink>,
        gate: Arc<TokenGate>,
        thread_id: &str,
        node: &'static str,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(TOKEN_CHANNEL_CAPACITY);
        let thread_id = thread_id.to_string();
        let handle = tokio::spawn(async move {
            while let Some(token) = rx.recv().await {
                gate.publish(events.as_ref(), StreamEvent::token(&thread_id, node, &token))
                    .await;
            }
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    async fn send(&self, token: String) {
        if let Some(tx) = &self.tx {
            // A closed channel only means the forwarder is gone.
            let _ = tx.send(token).await;
        }
    }

    /// Close the channel and wait until every queued token is published.
    async fn finish(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Token forwarder ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for TokenForwarder {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Runs conversation turns.
pub struct WorkflowEngine {
    models: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<dyn EventSink>,
    config: WorkflowConfig,
    locks: ThreadLocks,
}

impl WorkflowEngine {
    pub fn new(
        models: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        events: Arc<dyn EventSink>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            models,
            tools,
            checkpoints,
            events,
            config,
            locks: ThreadLocks::new(),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Run one turn to completion.
    pub async fn run_turn(
        &self,
        thread_id: &str,
        message: &str,
        options: TurnOptions,
    ) -> CoreResult<TurnOutcome> {
        self.run_turn_with_cancel(thread_id, message, options, CancellationToken::new())
            .await
    }

    /// Run one turn that stops silently when `cancel` fires.
    ///
    /// A cancelled turn returns [`CoreError::Cancelled`] without emitting a
    /// terminal event. A turn that outlives the configured budget emits one
    /// `error` event classified `timeout`.
    pub async fn run_turn_with_cancel(
        &self,
        thread_id: &str,
        message: &str,
        options: TurnOptions,
        cancel: CancellationToken,
    ) -> CoreResult<TurnOutcome> {
        let _guard = tokio::select! {
            guard = self.locks.acquire(thread_id) => guard,
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        };

        let state = self
            .checkpoints
            .load(thread_id)
            .await?
            .unwrap_or_else(|| ConversationState::new(thread_id));

        info!(
            "Starting turn for thread {} ({} prior messages)",
            thread_id,
            state.messages.len()
        );
        self.events
            .publish(StreamEvent::workflow_start(thread_id, message))
            .await;

        let started = Instant::now();
        let timeout = self.config.turn_timeout;
        let gate = TokenGate::new();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                gate.close().await;
                info!("Turn for thread {} cancelled", thread_id);
                return Err(CoreError::Cancelled);
            }
            result = tokio::time::timeout(timeout, self.drive(thread_id, state, message, &options, &gate)) => result,
        };

        let (state, mut outcome) = match result {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                gate.close().await;
                error!("Turn for thread {} failed: {}", thread_id, e);
                self.publish_error(thread_id, &e).await;
                return Err(e);
            }
            Err(_) => {
                // Forwarders of the abandoned node may still be publishing
                gate.close().await;
                let e = CoreError::Timeout(timeout.as_secs());
                warn!("Turn for thread {} timed out after {:?}", thread_id, timeout);
                self.publish_error(thread_id, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.checkpoints.save(&state).await {
            error!("Failed to save checkpoint for thread {}: {}", thread_id, e);
            self.publish_error(thread_id, &e).await;
            return Err(e);
        }

        outcome.total_ms = elapsed_ms(started);
        self.events
            .publish(StreamEvent::workflow_complete(
                thread_id,
                json!({
                    "node_times": outcome.node_times,
                    "total_ms": outcome.total_ms,
                    "answer": outcome.answer,
                }),
                outcome.total_ms,
            ))
            .await;

        info!(
            "Turn for thread {} completed in {:.0}ms",
            thread_id, outcome.total_ms
        );
        Ok(outcome)
    }

    /// Delete a thread's checkpoint once no turn holds the thread.
    ///
    /// A turn already running on the thread finishes and saves first, so
    /// its state cannot resurrect the thread after the delete.
    pub async fn delete_thread(&self, thread_id: &str) -> CoreResult<usize> {
        let _guard = self.locks.acquire(thread_id).await;
        let deleted = self.checkpoints.delete(thread_id).await?;
        debug!("Deleted {} checkpoint(s) for thread {}", deleted, thread_id);
        Ok(deleted)
    }

    async fn publish_error(&self, thread_id: &str, err: &CoreError) {
        let timeout_seconds = match err {
            CoreError::Timeout(secs) => Some(*secs),
            _ => None,
        };
        self.events
            .publish(StreamEvent::workflow_error(
                thread_id,
                &err.to_string(),
                err.error_type(),
                timeout_seconds,
            ))
            .await;
    }

    async fn enter(&self, thread_id: &str, phase: TurnPhase) {
        debug!("Thread {} entering {:?}", thread_id, phase);
        if self.config.delivery_mode == DeliveryMode::Legacy {
            self.events
                .publish(StreamEvent::node_starting(thread_id, phase.node_name()))
                .await;
        }
    }

    async fn drive(
        &self,
        thread_id: &str,
        mut state: ConversationState,
        message: &str,
        options: &TurnOptions,
        gate: &Arc<TokenGate>,
    ) -> CoreResult<(ConversationState, TurnOutcome)> {
        let model = self.models.model(options.chat_model.as_deref())?;
        let user_message = Message::user_with_documents(message, &options.documents);
        let question = user_message.content().to_string();
        let mut added = vec![user_message];
        let mut node_times = BTreeMap::new();

        // DECIDING
        self.enter(thread_id, TurnPhase::Deciding).await;
        let started = Instant::now();
        let tools = self.bound_tools(options);
        let prompt = self.decide_messages(&state.messages, &added);
        let reply = self
            .call_model(thread_id, DECIDE_NODE, model.as_ref(), &prompt, &tools, gate)
            .await?;
        let decision = Message::decision(reply.content, reply.tool_requests);
        let elapsed = elapsed_ms(started);
        node_times.insert(DECIDE_NODE.to_string(), elapsed);
        self.events
            .publish(StreamEvent::node_output(
                thread_id,
                DECIDE_NODE,
                json!({ "messages": [&decision] }),
                elapsed,
            ))
            .await;

        let requests = decision.tool_requests().to_vec();
        added.push(decision);

        let answer = if requests.is_empty() {
            let answer = added.last().map(|m| m.content().to_string()).unwrap_or_default();
            if answer.trim().is_empty() {
                return Err(CoreError::EmptyResponse);
            }
            answer
        } else {
            // EXECUTING_TOOLS
            self.enter(thread_id, TurnPhase::ExecutingTools).await;
            let started = Instant::now();
            let results = self.execute_tools(thread_id, &requests, options).await;
            let elapsed = elapsed_ms(started);
            node_times.insert(TOOLS_NODE.to_string(), elapsed);
            self.events
                .publish(StreamEvent::node_output(
                    thread_id,
                    TOOLS_NODE,
                    json!({ "messages": &results }),
                    elapsed,
                ))
                .await;

            // GENERATING
            self.enter(thread_id, TurnPhase::Generating).await;
            let started = Instant::now();
            let prompt = self.generate_messages(&state.messages, &question, &results);
            added.extend(results);
            let reply = self
                .call_model(thread_id, GENERATE_NODE, model.as_ref(), &prompt, &[], gate)
                .await?;
            if reply.content.trim().is_empty() {
                return Err(CoreError::EmptyResponse);
            }
            let final_message = Message::final_answer(reply.content);
            let elapsed = elapsed_ms(started);
            node_times.insert(GENERATE_NODE.to_string(), elapsed);
            self.events
                .publish(StreamEvent::node_output(
                    thread_id,
                    GENERATE_NODE,
                    json!({ "messages": [&final_message] }),
                    elapsed,
                ))
                .await;
            let answer = final_message.content().to_string();
            added.push(final_message);
            answer
        };

        state.extend(added.clone());
        let outcome = TurnOutcome {
            thread_id: thread_id.to_string(),
            answer,
            messages: added,
            node_times,
            total_ms: 0.0,
        };
        Ok((state, outcome))
    }

    fn tool_enabled(&self, name: &str, options: &TurnOptions) -> bool {
        match name {
            PROJECT_SEARCH_TOOL => self.config.project_search_enabled,
            WEB_SEARCH_TOOL => options.enable_websearch,
            _ => true,
        }
    }

    fn bound_tools(&self, options: &TurnOptions) -> Vec<ToolDescriptor> {
        self.tools
            .descriptors(|name| self.tool_enabled(name, options))
    }

    fn decide_messages(&self, history: &[Message], added: &[Message]) -> Vec<Message> {
        let system = self
            .config
            .system_prompt
            .replace("{time}", &chrono::Utc::now().to_rfc3339());
        std::iter::once(Message::system(system))
            .chain(history.iter().cloned())
            .chain(added.iter().cloned())
            .collect()
    }

    fn generate_messages(
        &self,
        history: &[Message],
        question: &str,
        results: &[Message],
    ) -> Vec<Message> {
        let documents = results
            .iter()
            .map(|m| m.content())
            .collect::<Vec<_>>()
            .join("\n\n");
        let documents = if documents.trim().is_empty() {
            "No supporting documents were retrieved."
        } else {
            documents.as_str()
        };
        let prompt = self
            .config
            .generate_prompt
            .replace("{question}", question)
            .replace("{documents}", documents);

        history
            .iter()
            .filter(|m| m.is_user_visible())
            .cloned()
            .chain(std::iter::once(Message::user(prompt)))
            .collect()
    }

    async fn call_model(
        &self,
        thread_id: &str,
        node: &'static str,
        model: &dyn ChatModel,
        messages: &[Message],
        tools: &[ToolDescriptor],
        gate: &Arc<TokenGate>,
    ) -> CoreResult<ModelReply> {
        debug!(
            "Calling model {} for {} with {} messages and {} tools",
            model.name(),
            node,
            messages.len(),
            tools.len()
        );
        if !self.config.streaming {
            return model.complete(messages, tools).await;
        }

        let mut stream = model.stream(messages, tools).await?;
        let forwarder = TokenForwarder::spawn(self.events.clone(), gate.clone(), thread_id, node);
        let mut acc = ReplyAccumulator::new();
        while let Some(delta) = stream.next().await {
            let delta = delta?;
            if let ModelDelta::Token(token) = &delta {
                if !token.is_empty() {
                    forwarder.send(token.clone()).await;
                }
            }
            acc.push(&delta);
        }
        forwarder.finish().await;
        Ok(acc.finish())
    }

    async fn execute_tools(
        &self,
        thread_id: &str,
        requests: &[ToolRequest],
        options: &TurnOptions,
    ) -> Vec<Message> {
        let calls = requests.iter().map(|request| async move {
            let started = Instant::now();
            let output = match self.tools.get(&request.name) {
                Some(tool) if self.tool_enabled(&request.name, options) => {
                    tool.invoke(&request.arguments).await
                }
                _ => {
                    warn!("Model requested unavailable tool '{}'", request.name);
                    ToolOutput::failure(format!(
                        "Tool '{}' is not available for this request.",
                        request.name
                    ))
                }
            };
            let output = if output.text.trim().is_empty() {
                ToolOutput::failure(format!("Tool '{}' returned no content.", request.name))
            } else {
                output
            };
            let elapsed = elapsed_ms(started);
            debug!("Tool {} finished in {:.0}ms", request.name, elapsed);
            self.events
                .publish(StreamEvent::tool_finished(thread_id, &request.name, elapsed))
                .await;
            Message::tool_result(request, output.text, output.artifacts)
        });
        futures::future::join_all(calls).await
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("tools", &self.tools)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_node_names() {
        assert_eq!(TurnPhase::Deciding.node_name(), "query_or_respond");
        assert_eq!(TurnPhase::ExecutingTools.node_name(), "tools");
        assert_eq!(TurnPhase::Generating.node_name(), "generate");
        assert!(TurnPhase::Failed.is_terminal());
        assert!(!TurnPhase::Generating.is_terminal());
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.workflow.turn_timeout_secs = 12;
        settings.project_search.enabled = true;
        let config = WorkflowConfig::from(&settings);
        assert_eq!(config.turn_timeout, Duration::from_secs(12));
        assert!(config.project_search_enabled);
        assert!(config.streaming);
    }
}
