//! Project search against a local stub of the project API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::json;

use grav_core::Tool;
use grav_tools::{ProjectSearchClient, SearchProjectsTool};

#[derive(Clone, Default)]
struct Stub {
    tokens_issued: Arc<AtomicUsize>,
    searches: Arc<AtomicUsize>,
    /// Reject the first search with 401
    expire_first: bool,
    /// Fail every search with this status
    fail_status: Option<u16>,
    delay: Duration,
    empty: bool,
}

async fn token(State(stub): State<Stub>, Form(form): Form<HashMap<String, String>>) -> Response {
    if form.get("grant_type").map(String::as_str) != Some("password")
        || form.get("password").map(String::as_str) != Some("secret")
    {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let n = stub.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({"access_token": format!("token-{}", n), "token_type": "bearer"})).into_response()
}

async fn search(
    State(stub): State<Stub>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let call = stub.searches.fetch_add(1, Ordering::SeqCst);
    if !stub.delay.is_zero() {
        tokio::time::sleep(stub.delay).await;
    }
    if let Some(status) = stub.fail_status {
        return StatusCode::from_u16(status).unwrap().into_response();
    }
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if stub.expire_first && call == 0 {
        assert_eq!(auth, "Bearer token-1");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    assert_eq!(params.get("offset").map(String::as_str), Some("0"));
    if stub.empty {
        return Json(json!({"items": [], "total": 0})).into_response();
    }
    Json(json!({
        "total": 3,
        "items": [{
            "project_name": format!("{} Orbital", params["query"]),
            "company_name": "Acme",
            "industry": "Aerospace",
            "core_team": [{"name": "Ada"}],
            "auth": auth,
        }]
    }))
    .into_response()
}

async fn serve(stub: Stub) -> String {
    let app = Router::new()
        .route("/api/auth/token", post(token))
        .route("/api/projects/search", get(search))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn tool_for(stub: Stub, timeout: Duration) -> SearchProjectsTool {
    let url = serve(stub).await;
    let client = ProjectSearchClient::new(&url, "svc", "secret", timeout).unwrap();
    SearchProjectsTool::with_client(client, 1)
}

#[tokio::test]
async fn test_search_formats_top_project() {
    let stub = Stub::default();
    let tool = tool_for(stub.clone(), Duration::from_secs(5)).await;

    let output = tool.invoke(&json!({"query": "Acme"})).await;
    assert!(output.text.starts_with("Found 3 related project(s):\n\n**Acme Orbital**"));
    assert!(output.text.contains("- Team: Ada"));
    assert_eq!(output.artifacts.len(), 1);

    // Token is cached between calls
    tool.invoke(&json!({"query": "Acme"})).await;
    assert_eq!(stub.tokens_issued.load(Ordering::SeqCst), 1);
    assert_eq!(stub.searches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_expired_token_refreshed_once() {
    let stub = Stub {
        expire_first: true,
        ..Stub::default()
    };
    let tool = tool_for(stub.clone(), Duration::from_secs(5)).await;

    let output = tool.invoke(&json!({"query": "Acme"})).await;
    assert_eq!(output.artifacts[0]["auth"], "Bearer token-2");
    assert_eq!(stub.tokens_issued.load(Ordering::SeqCst), 2);
    assert_eq!(stub.searches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_persistent_unauthorized_is_humanized() {
    let stub = Stub {
        fail_status: Some(401),
        ..Stub::default()
    };
    let tool = tool_for(stub.clone(), Duration::from_secs(5)).await;

    let output = tool.invoke(&json!({"query": "Acme"})).await;
    assert!(output.text.contains("temporarily unavailable"));
    assert!(output.artifacts.is_empty());
    // One retry only
    assert_eq!(stub.searches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_timeout_is_humanized() {
    let stub = Stub {
        delay: Duration::from_millis(500),
        ..Stub::default()
    };
    let tool = tool_for(stub, Duration::from_millis(100)).await;

    let output = tool.invoke(&json!({"query": "Acme"})).await;
    assert!(output.text.contains("timed out"));
    assert!(output.artifacts.is_empty());
}

#[tokio::test]
async fn test_server_error_and_empty_results() {
    let tool = tool_for(
        Stub {
            fail_status: Some(500),
            ..Stub::default()
        },
        Duration::from_secs(5),
    )
    .await;
    let output = tool.invoke(&json!({"query": "Acme"})).await;
    assert!(output.text.contains("temporarily unavailable"));

    let tool = tool_for(
        Stub {
            empty: true,
            ..Stub::default()
        },
        Duration::from_secs(5),
    )
    .await;
    let output = tool.invoke(&json!({"query": "Nobody"})).await;
    assert_eq!(output.text, "No projects found matching 'Nobody'.");
}
