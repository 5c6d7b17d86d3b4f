//! Web search against a local stub of the Tavily API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use grav_core::{Tool, WebSearchSettings};
use grav_tools::WebSearchTool;

#[derive(Clone, Default)]
struct Stub {
    calls: Arc<AtomicUsize>,
    fail_status: Option<u16>,
    delay: Duration,
    empty: bool,
}

async fn search(State(stub): State<Stub>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    stub.calls.fetch_add(1, Ordering::SeqCst);
    if !stub.delay.is_zero() {
        tokio::time::sleep(stub.delay).await;
    }
    if let Some(status) = stub.fail_status {
        return StatusCode::from_u16(status).unwrap().into_response();
    }
    assert_eq!(
        headers.get("authorization").and_then(|v| v.to_str().ok()),
        Some("Bearer tvly-test")
    );
    assert_eq!(body["api_key"], "tvly-test");
    assert_eq!(body["max_results"], 5);
    if stub.empty {
        return Json(json!({"results": []})).into_response();
    }
    Json(json!({
        "query": body["query"],
        "results": [
            {"title": "Rust 1.90 released", "url": "https://blog.rust-lang.org/1.90", "content": "New stable release", "score": 0.9},
            {"title": "Tokio news", "url": "https://tokio.rs/blog", "content": "Runtime update", "score": 0.7},
        ]
    }))
    .into_response()
}

async fn tool_for(stub: Stub, timeout_secs: u64) -> WebSearchTool {
    let app = Router::new().route("/search", post(search)).with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let settings = WebSearchSettings {
        api_key: Some("tvly-test".to_string()),
        base_url: format!("http://{}", addr),
        max_results: 5,
        timeout_secs,
    };
    WebSearchTool::from_settings(&settings).unwrap()
}

#[tokio::test]
async fn test_results_formatted_with_raw_artifacts() {
    let stub = Stub::default();
    let tool = tool_for(stub.clone(), 5).await;

    let output = tool.invoke(&json!({"query": "rust release"})).await;
    assert!(output
        .text
        .starts_with("[1] Rust 1.90 released\nURL: https://blog.rust-lang.org/1.90\nContent: New stable release"));
    assert!(output.text.contains("\n\n[2] Tokio news"));
    assert_eq!(output.artifacts.len(), 2);
    assert_eq!(output.artifacts[1]["score"], 0.7);
    assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_server_error_is_humanized() {
    let tool = tool_for(
        Stub {
            fail_status: Some(502),
            ..Stub::default()
        },
        5,
    )
    .await;

    let output = tool.invoke(&json!({"query": "news"})).await;
    assert_eq!(output.text, "The web search service is temporarily unavailable.");
    assert!(output.artifacts.is_empty());
}

#[tokio::test]
async fn test_timeout_is_humanized() {
    let tool = tool_for(
        Stub {
            delay: Duration::from_secs(3),
            ..Stub::default()
        },
        1,
    )
    .await;

    let output = tool.invoke(&json!({"query": "news"})).await;
    assert_eq!(output.text, "Web search timed out. Please try again later.");
    assert!(output.artifacts.is_empty());
}

#[tokio::test]
async fn test_empty_results_and_missing_query() {
    let stub = Stub {
        empty: true,
        ..Stub::default()
    };
    let tool = tool_for(stub.clone(), 5).await;

    let output = tool.invoke(&json!({"query": "nothing"})).await;
    assert_eq!(output.text, "No web results found for 'nothing'.");
    assert!(output.artifacts.is_empty());

    let output = tool.invoke(&json!({"query": "  "})).await;
    assert!(output.text.contains("query"));
    assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
}
