//! Tests for the OpenAI-compatible client against a local stub server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};

use grav_core::{ChatModel, Message, ModelDelta, ReplyAccumulator, ToolDescriptor};
use grav_llm::{LlmError, OpenAiChatModel};

#[derive(Clone, Default)]
struct Stub {
    calls: Arc<AtomicUsize>,
    fail_first: usize,
    last_body: Arc<parking_lot::Mutex<Option<Value>>>,
}

async fn completions(State(stub): State<Stub>, Json(body): Json<Value>) -> Response {
    let call = stub.calls.fetch_add(1, Ordering::SeqCst);
    *stub.last_body.lock() = Some(body.clone());
    if call < stub.fail_first {
        return (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response();
    }

    if body["stream"] == json!(true) {
        let chunks = [
            json!({"choices":[{"delta":{"content":"Hello"}}]}),
            json!({"choices":[{"delta":{"content":" world"}}]}),
            json!({"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"retrieve_context","arguments":"{\"query\""}}]}}]}),
            json!({"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":\"rag\"}"}}]}}]}),
        ];
        let mut sse = String::new();
        for chunk in chunks {
            sse.push_str(&format!("data: {}\n\n", chunk));
        }
        sse.push_str("data: [DONE]\n\n");
        return ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response();
    }

    Json(json!({
        "choices": [{
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": {"name": "search_projects", "arguments": "{\"query\":\"acme\"}"}
                }]
            }
        }]
    }))
    .into_response()
}

async fn serve(stub: Stub) -> String {
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1", addr)
}

fn retrieve_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "retrieve_context".into(),
        description: "Search documents".into(),
        parameters: grav_core::query_schema("Search query"),
    }
}

#[tokio::test]
async fn test_complete_parses_tool_calls() {
    let stub = Stub::default();
    let base = serve(stub.clone()).await;
    let model = OpenAiChatModel::new("qwen-plus-latest", base, Some("sk-test".into()));

    let reply = model
        .complete(&[Message::user("Who is Acme?")], &[retrieve_descriptor()])
        .await
        .unwrap();
    assert_eq!(reply.content, "");
    assert_eq!(reply.tool_requests.len(), 1);
    assert_eq!(reply.tool_requests[0].id, "call_9");
    assert_eq!(reply.tool_requests[0].arguments, json!({"query": "acme"}));

    let body = stub.last_body.lock().clone().unwrap();
    assert_eq!(body["tools"][0]["function"]["name"], "retrieve_context");
    assert_eq!(body["temperature"].as_f64().map(|t| (t * 10.0).round()), Some(7.0));
}

#[tokio::test]
async fn test_stream_yields_tokens_and_tool_calls() {
    let base = serve(Stub::default()).await;
    let model = OpenAiChatModel::new("qwen-plus-latest", base, None);

    let mut stream = model.stream(&[Message::user("hi")], &[]).await.unwrap();
    let mut tokens = Vec::new();
    let mut acc = ReplyAccumulator::new();
    while let Some(delta) = stream.next().await {
        let delta = delta.unwrap();
        if let ModelDelta::Token(t) = &delta {
            tokens.push(t.clone());
        }
        acc.push(&delta);
    }

    assert_eq!(tokens, vec!["Hello", " world"]);
    let reply = acc.finish();
    assert_eq!(reply.content, "Hello world");
    assert_eq!(reply.tool_requests[0].arguments, json!({"query": "rag"}));
}

#[tokio::test]
async fn test_retries_server_errors() {
    let stub = Stub {
        fail_first: 1,
        ..Stub::default()
    };
    let base = serve(stub.clone()).await;
    let model = OpenAiChatModel::new("m", base, None).with_max_retries(2);

    model.complete_reply(&[Message::user("hi")], &[]).await.unwrap();
    assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_gives_up_after_max_retries() {
    let stub = Stub {
        fail_first: 10,
        ..Stub::default()
    };
    let base = serve(stub.clone()).await;
    let model = OpenAiChatModel::new("m", base, None).with_max_retries(1);

    let err = model
        .complete_reply(&[Message::user("hi")], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::RetriesExhausted { attempts: 2, .. }));
    assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
}
