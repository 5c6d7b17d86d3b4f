//! Integration tests for the turn state machine.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use grav_core::{
    ChatModel, CheckpointStore, CoreError, CoreResult, DeliveryMode, DeltaStream, EventSink,
    EventStatus, EventType, InMemoryCheckpointStore, Message, ModelDelta, ModelProvider,
    ModelReply, StreamEvent, Tool, ToolDescriptor, ToolOutput, ToolRegistry, ToolRequest,
    TurnOptions, WorkflowConfig, WorkflowEngine,
};

/// Replies from a fixed script, recording every call.
struct ScriptModel {
    replies: Mutex<VecDeque<ModelReply>>,
    calls: Mutex<Vec<(Vec<Message>, Vec<ToolDescriptor>)>>,
    delay: Duration,
}

impl ScriptModel {
    fn new(replies: Vec<ModelReply>) -> Arc<Self> {
        Self::slow(replies, Duration::ZERO)
    }

    fn slow(replies: Vec<ModelReply>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ChatModel for ScriptModel {
    fn name(&self) -> &str {
        "script"
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> CoreResult<ModelReply> {
        self.calls.lock().push((messages.to_vec(), tools.to_vec()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .lock()
            .pop_front()
            .ok_or_else(|| CoreError::Model("script exhausted".into()))
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> CoreResult<DeltaStream> {
        let reply = self.complete(messages, tools).await?;
        // Split text into word tokens to exercise the forwarder
        let mut deltas: Vec<CoreResult<ModelDelta>> = reply
            .content
            .split_inclusive(' ')
            .map(|t| Ok(ModelDelta::Token(t.to_string())))
            .collect();
        for (index, request) in reply.tool_requests.into_iter().enumerate() {
            deltas.push(Ok(ModelDelta::ToolCall {
                index,
                id: Some(request.id),
                name: Some(request.name),
                arguments: request.arguments.to_string(),
            }));
        }
        Ok(Box::pin(stream::iter(deltas)))
    }
}

struct Provider(Arc<ScriptModel>);

impl ModelProvider for Provider {
    fn model(&self, _name: Option<&str>) -> CoreResult<Arc<dyn ChatModel>> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().clone()
    }

    fn terminal(&self) -> Vec<StreamEvent> {
        self.events().into_iter().filter(|e| e.is_terminal()).collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: StreamEvent) {
        self.events.lock().push(event);
    }
}

/// Tool answering with a canned text after an optional delay.
struct CannedTool {
    name: &'static str,
    text: &'static str,
    delay: Duration,
}

#[async_trait]
impl Tool for CannedTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "canned"
    }

    async fn invoke(&self, _arguments: &Value) -> ToolOutput {
        tokio::time::sleep(self.delay).await;
        ToolOutput::new(self.text, vec![json!({"tool": self.name})])
    }
}

fn canned(name: &'static str, text: &'static str, delay_ms: u64) -> Arc<dyn Tool> {
    Arc::new(CannedTool {
        name,
        text,
        delay: Duration::from_millis(delay_ms),
    })
}

struct Harness {
    engine: WorkflowEngine,
    model: Arc<ScriptModel>,
    sink: Arc<RecordingSink>,
    store: Arc<InMemoryCheckpointStore>,
}

fn harness(model: Arc<ScriptModel>, tools: ToolRegistry, config: WorkflowConfig) -> Harness {
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = WorkflowEngine::new(
        Arc::new(Provider(model.clone())),
        Arc::new(tools),
        store.clone(),
        sink.clone(),
        config,
    );
    Harness {
        engine,
        model,
        sink,
        store,
    }
}

fn default_tools() -> ToolRegistry {
    ToolRegistry::new()
        .with(canned("retrieve_context", "Source: {}\nContent: RAG docs", 0))
        .with(canned("search_projects", "1 project found", 0))
        .with(canned("web_search", "[1] News", 0))
}

#[tokio::test]
async fn test_direct_answer_without_tools() {
    let model = ScriptModel::new(vec![ModelReply::text(
        "RAG stands for retrieval-augmented generation.",
    )]);
    let h = harness(model, default_tools(), WorkflowConfig::default());

    let outcome = h
        .engine
        .run_turn("t1", "What is RAG?", TurnOptions::default())
        .await
        .unwrap();

    assert_eq!(h.model.call_count(), 1);
    assert_eq!(outcome.tool_results().count(), 0);
    assert_eq!(outcome.answer, "RAG stands for retrieval-augmented generation.");

    let state = h.store.load("t1").await.unwrap().unwrap();
    assert_eq!(state.messages.len(), 2);
    assert_eq!(state.visible_history().len(), 2);

    let events = h.sink.events();
    assert_eq!(events[0].message_type, EventType::Start);
    let complete = events.last().unwrap();
    assert_eq!(complete.message_type, EventType::Complete);
    assert!(complete.execution_time_ms.is_some());
    assert_eq!(complete.payload["answer"], outcome.answer);
    assert!(complete.payload["node_times"]["query_or_respond"].is_number());
    assert_eq!(h.sink.terminal().len(), 1);
}

#[tokio::test]
async fn test_tool_results_follow_request_order() {
    let requests = vec![
        ToolRequest::new("search_projects", json!({"query": "acme"})).with_id("a"),
        ToolRequest::new("retrieve_context", json!({"query": "acme"})).with_id("b"),
    ];
    let model = ScriptModel::new(vec![
        ModelReply::with_tools("", requests),
        ModelReply::text("Acme builds rockets."),
    ]);
    // The first tool is slower, so completion order differs from request order
    let tools = ToolRegistry::new()
        .with(canned("retrieve_context", "Source: {}\nContent: docs", 0))
        .with(canned("search_projects", "1 project found", 40));
    let config = WorkflowConfig {
        project_search_enabled: true,
        ..WorkflowConfig::default()
    };
    let h = harness(model, tools, config);

    let outcome = h
        .engine
        .run_turn("t2", "Tell me about Acme", TurnOptions::default())
        .await
        .unwrap();

    let ids: Vec<_> = outcome
        .tool_results()
        .map(|m| match m {
            Message::ToolResult { tool_call_id, .. } => tool_call_id.clone(),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(h.model.call_count(), 2);

    let roles: Vec<_> = outcome.messages.iter().map(|m| m.role()).collect();
    assert_eq!(
        roles,
        vec!["user", "assistant_decision", "tool_result", "tool_result", "assistant_final"]
    );

    // GENERATING gets no tools and sees both tool outputs
    let calls = h.model.calls.lock();
    assert!(calls[1].1.is_empty());
    let prompt = calls[1].0.last().unwrap().content().to_string();
    assert!(prompt.contains("1 project found"));
    assert!(prompt.contains("Content: docs"));
}

#[tokio::test]
async fn test_tools_bound_per_call() {
    let model = ScriptModel::new(vec![ModelReply::text("hi"), ModelReply::text("hi again")]);
    let h = harness(model, default_tools(), WorkflowConfig::default());

    h.engine
        .run_turn("t3", "hello", TurnOptions::default())
        .await
        .unwrap();
    let options = TurnOptions {
        enable_websearch: true,
        ..TurnOptions::default()
    };
    h.engine.run_turn("t3", "news?", options).await.unwrap();

    let calls = h.model.calls.lock();
    let names = |i: usize| calls[i].1.iter().map(|d| d.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(0), vec!["retrieve_context"]);
    assert_eq!(names(1), vec!["retrieve_context", "web_search"]);

    // System prompt is injected per call, history carries the first turn
    assert!(matches!(calls[1].0[0], Message::System { .. }));
    assert!(!calls[1].0[0].content().contains("{time}"));
    assert_eq!(calls[1].0.len(), 4);
}

#[tokio::test]
async fn test_timed_out_project_search_still_answers() {
    let requests = vec![
        ToolRequest::new("retrieve_context", json!({"query": "acme"})),
        ToolRequest::new("search_projects", json!({"query": "acme"})),
    ];
    let model = ScriptModel::new(vec![
        ModelReply::with_tools("", requests),
        ModelReply::text("Based on the documents, Acme builds rockets."),
    ]);
    let tools = ToolRegistry::new()
        .with(canned("retrieve_context", "Source: {}\nContent: Acme builds rockets", 0))
        .with(canned(
            "search_projects",
            "The project search timed out. Please try again later.",
            0,
        ));
    let config = WorkflowConfig {
        project_search_enabled: true,
        ..WorkflowConfig::default()
    };
    let h = harness(model, tools, config);

    let outcome = h
        .engine
        .run_turn("t4", "What does Acme build?", TurnOptions::default())
        .await
        .unwrap();

    let results: Vec<_> = outcome.tool_results().map(|m| m.content()).collect();
    assert_eq!(results.len(), 2);
    assert!(results[1].contains("timed out"));
    assert_eq!(h.model.call_count(), 2);
    assert_eq!(
        outcome
            .messages
            .iter()
            .filter(|m| matches!(m, Message::AssistantFinal { .. }))
            .count(),
        1
    );
    assert!(h
        .sink
        .events()
        .iter()
        .all(|e| e.message_type != EventType::Error));

    let custom = h
        .sink
        .events()
        .into_iter()
        .filter(|e| e.message_type == EventType::Custom)
        .count();
    assert_eq!(custom, 2);
}

#[tokio::test]
async fn test_unknown_tool_becomes_result() {
    let model = ScriptModel::new(vec![
        ModelReply::with_tools("", vec![ToolRequest::new("delete_database", json!({}))]),
        ModelReply::text("I could not do that."),
    ]);
    let h = harness(model, default_tools(), WorkflowConfig::default());

    let outcome = h
        .engine
        .run_turn("t5", "drop everything", TurnOptions::default())
        .await
        .unwrap();
    let result = outcome.tool_results().next().unwrap();
    assert!(result.content().contains("not available"));
}

#[tokio::test]
async fn test_tokens_precede_node_output() {
    let model = ScriptModel::new(vec![ModelReply::text("one two three four")]);
    let h = harness(model, default_tools(), WorkflowConfig::default());

    h.engine
        .run_turn("t6", "count", TurnOptions::default())
        .await
        .unwrap();

    let events = h.sink.events();
    let output_at = events
        .iter()
        .position(|e| e.message_type == EventType::Output)
        .unwrap();
    let tokens: Vec<_> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.message_type == EventType::Token)
        .collect();
    assert_eq!(tokens.len(), 4);
    assert!(tokens.iter().all(|(i, e)| *i < output_at && e.status == EventStatus::Streaming));
    let text: String = tokens
        .iter()
        .map(|(_, e)| e.payload["content"].as_str().unwrap())
        .collect();
    assert_eq!(text, "one two three four");
}

#[tokio::test]
async fn test_legacy_mode_emits_node_starts() {
    let model = ScriptModel::new(vec![ModelReply::text("hello")]);
    let config = WorkflowConfig {
        delivery_mode: DeliveryMode::Legacy,
        streaming: false,
        ..WorkflowConfig::default()
    };
    let h = harness(model, default_tools(), config);

    h.engine
        .run_turn("t7", "hi", TurnOptions::default())
        .await
        .unwrap();

    let starting: Vec<_> = h
        .sink
        .events()
        .into_iter()
        .filter(|e| e.status == EventStatus::Starting)
        .map(|e| e.node_name)
        .collect();
    assert_eq!(starting, vec!["query_or_respond"]);
}

#[tokio::test]
async fn test_timeout_emits_single_error() {
    let model = ScriptModel::slow(vec![ModelReply::text("late")], Duration::from_secs(5));
    let config = WorkflowConfig {
        turn_timeout: Duration::from_millis(50),
        ..WorkflowConfig::default()
    };
    let h = harness(model, default_tools(), config);

    let err = h
        .engine
        .run_turn("t8", "slow question", TurnOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout(_)));

    let terminal = h.sink.terminal();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].message_type, EventType::Error);
    assert_eq!(terminal[0].payload["error_type"], "timeout");
    assert!(h.store.load("t8").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancelled_turn_is_silent() {
    let model = ScriptModel::slow(vec![ModelReply::text("late")], Duration::from_secs(5));
    let h = harness(model, default_tools(), WorkflowConfig::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let err = h
        .engine
        .run_turn_with_cancel("t9", "never mind", TurnOptions::default(), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    assert!(h.sink.terminal().is_empty());
    assert!(h.store.load("t9").await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_model_output_fails() {
    let model = ScriptModel::new(vec![ModelReply::text("   ")]);
    let h = harness(model, default_tools(), WorkflowConfig::default());

    let err = h
        .engine
        .run_turn("t10", "hello?", TurnOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Model returned empty response");

    let terminal = h.sink.terminal();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].payload["error_type"], "execution_error");
}

#[tokio::test]
async fn test_turns_on_same_thread_are_serialized() {
    let model = ScriptModel::slow(
        vec![ModelReply::text("first"), ModelReply::text("second")],
        Duration::from_millis(30),
    );
    let h = Arc::new(harness(model, default_tools(), WorkflowConfig::default()));

    let a = {
        let h = h.clone();
        tokio::spawn(async move { h.engine.run_turn("shared", "one", TurnOptions::default()).await })
    };
    let b = {
        let h = h.clone();
        tokio::spawn(async move { h.engine.run_turn("shared", "two", TurnOptions::default()).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let state = h.store.load("shared").await.unwrap().unwrap();
    assert_eq!(state.messages.len(), 4);
    // The second turn saw the first turn's history
    let calls = h.model.calls.lock();
    assert_eq!(calls[1].0.len(), 4);
}

/// Streams its tokens, then never finishes.
struct StallingModel;

#[async_trait]
impl ChatModel for StallingModel {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn complete(&self, _: &[Message], _: &[ToolDescriptor]) -> CoreResult<ModelReply> {
        futures::future::pending().await
    }

    async fn stream(&self, _: &[Message], _: &[ToolDescriptor]) -> CoreResult<DeltaStream> {
        let tokens = ["first ", "second "]
            .into_iter()
            .map(|t| Ok(ModelDelta::Token(t.to_string())));
        Ok(Box::pin(stream::iter(tokens).chain(stream::pending())))
    }
}

struct StallingProvider;

impl ModelProvider for StallingProvider {
    fn model(&self, _name: Option<&str>) -> CoreResult<Arc<dyn ChatModel>> {
        Ok(Arc::new(StallingModel))
    }
}

/// Sink whose token writes block the worker, so they cannot be aborted.
#[derive(Default)]
struct SlowTokenSink {
    events: Mutex<Vec<StreamEvent>>,
}

#[async_trait]
impl EventSink for SlowTokenSink {
    async fn publish(&self, event: StreamEvent) {
        if event.message_type == EventType::Token {
            std::thread::sleep(Duration::from_millis(300));
        }
        self.events.lock().push(event);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_token_after_timeout_error() {
    let sink = Arc::new(SlowTokenSink::default());
    let engine = WorkflowEngine::new(
        Arc::new(StallingProvider),
        Arc::new(default_tools()),
        Arc::new(InMemoryCheckpointStore::new()),
        sink.clone(),
        WorkflowConfig {
            turn_timeout: Duration::from_millis(100),
            ..WorkflowConfig::default()
        },
    );

    let err = engine
        .run_turn("t11", "hello", TurnOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout(_)));

    // Give a stray forwarder time to publish
    tokio::time::sleep(Duration::from_millis(700)).await;
    let events = sink.events.lock().clone();
    let last = events.last().unwrap();
    assert_eq!(last.message_type, EventType::Error);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn test_delete_waits_for_running_turn() {
    let model = ScriptModel::slow(
        vec![ModelReply::text("one"), ModelReply::text("two")],
        Duration::from_millis(300),
    );
    let h = Arc::new(harness(model, default_tools(), WorkflowConfig::default()));
    h.engine
        .run_turn("t12", "first", TurnOptions::default())
        .await
        .unwrap();

    let turn = {
        let h = h.clone();
        tokio::spawn(async move { h.engine.run_turn("t12", "second", TurnOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The delete waits for the running turn's save, then removes it
    assert_eq!(h.engine.delete_thread("t12").await.unwrap(), 1);
    assert_eq!(turn.await.unwrap().unwrap().answer, "two");
    assert!(h.store.load("t12").await.unwrap().is_none());
    assert_eq!(h.engine.delete_thread("t12").await.unwrap(), 0);
}
