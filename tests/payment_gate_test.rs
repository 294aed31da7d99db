//! x402 gate tests against a mock facilitator: challenge flow, verify →
//! execute → settle, idempotent replay, and failure routing.

mod support;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Json;
use base64::Engine;
use dir2mcp::{Config, DocType, X402Mode};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use support::{initialize, rpc_post, tools_call, StubRetriever, TestServer};
use tempfile::TempDir;

#[derive(Default)]
struct FacilitatorState {
    verify_calls: AtomicUsize,
    settle_calls: AtomicUsize,
    /// Remaining verify calls to reject with 402.
    verify_failures: AtomicUsize,
    /// Remaining settle calls to fail with 500.
    settle_failures: AtomicUsize,
}

async fn start_facilitator(state: Arc<FacilitatorState>) -> SocketAddr {
    async fn verify(State(state): State<Arc<FacilitatorState>>) -> impl IntoResponse {
        state.verify_calls.fetch_add(1, Ordering::SeqCst);
        if state
            .verify_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return (
                axum::http::StatusCode::PAYMENT_REQUIRED,
                Json(json!({"code": "PAYMENT_INVALID", "retryable": false})),
            )
                .into_response();
        }
        Json(json!({"isValid": true})).into_response()
    }

    async fn settle(State(state): State<Arc<FacilitatorState>>) -> impl IntoResponse {
        state.settle_calls.fetch_add(1, Ordering::SeqCst);
        if state
            .settle_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "simulated outage"})),
            )
                .into_response();
        }
        Json(json!({"success": true, "transaction": "0xabc123"})).into_response()
    }

    let router = axum::Router::new()
        .route("/verify", post(verify))
        .route("/settle", post(settle))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

async fn paid_server(
    facilitator: SocketAddr,
) -> (TempDir, TempDir, Arc<StubRetriever>, TestServer) {
    let root = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();

    let mut config = Config::default();
    config.root = root.path().to_path_buf();
    config.state_dir = state.path().to_path_buf();
    config.x402.mode = X402Mode::Required;
    config.x402.asset = "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_string();
    config.x402.pay_to = "0xf2757Fe8Ba90ad98dAed8e6254bA9A677069826a".to_string();
    config.x402.facilitator_url = format!("http://{facilitator}");

    let retriever = Arc::new(StubRetriever::new().with_doc(
        "guide.md",
        DocType::Markdown,
        "how to use the system",
    ));
    let server = TestServer::start(config, Some(retriever.clone()), None).await;
    (root, state, retriever, server)
}

#[tokio::test]
async fn missing_payment_yields_402_challenge() {
    let facilitator = Arc::new(FacilitatorState::default());
    let addr = start_facilitator(facilitator.clone()).await;
    let (_root, _state, retriever, server) = paid_server(addr).await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &server.url).await;

    let response = rpc_post(
        &client,
        &server.url,
        Some(&session),
        tools_call(json!(1), "dir2mcp.search", json!({"query": "guide"})),
    )
    .await;
    assert_eq!(response.status(), 402);

    let challenge = response
        .headers()
        .get("www-authenticate")
        .expect("challenge header")
        .to_str()
        .unwrap()
        .to_string();
    let encoded = challenge.strip_prefix("Payment ").expect("Payment scheme");
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .unwrap();
    let requirement: Value = serde_json::from_slice(&decoded).unwrap();
    assert_eq!(requirement["scheme"], "exact");
    assert_eq!(requirement["network"], "eip155:84532");
    assert!(requirement["resourceUrl"].as_str().unwrap().ends_with("/mcp"));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["data"]["code"], "PAYMENT_REQUIRED");

    // Nothing was verified or executed.
    assert_eq!(facilitator.verify_calls.load(Ordering::SeqCst), 0);
    assert_eq!(retriever.search_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn paid_call_verifies_executes_and_settles() {
    let facilitator = Arc::new(FacilitatorState::default());
    let addr = start_facilitator(facilitator.clone()).await;
    let (_root, state_dir, retriever, server) = paid_server(addr).await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &server.url).await;

    let response = client
        .post(&server.url)
        .header("Content-Type", "application/json")
        .header("MCP-Session-Id", &session)
        .header("X-PAYMENT", "sig-aaa")
        .body(tools_call(json!(1), "dir2mcp.search", json!({"query": "guide"})).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let payment_response = response
        .headers()
        .get("x-payment-response")
        .expect("settlement header")
        .to_str()
        .unwrap()
        .to_string();
    assert!(payment_response.contains("0xabc123"));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["isError"], false);

    assert_eq!(facilitator.verify_calls.load(Ordering::SeqCst), 1);
    assert_eq!(facilitator.settle_calls.load(Ordering::SeqCst), 1);
    assert_eq!(retriever.search_count(), 1);

    // The settlement log has one line per pipeline transition.
    let log = std::fs::read_to_string(
        state_dir.path().join("payments").join("settlement.log"),
    )
    .unwrap();
    let events: Vec<String> = log
        .lines()
        .map(|line| {
            serde_json::from_str::<Value>(line).unwrap()["event"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(events, vec!["verify_succeeded", "execute", "settle_succeeded"]);

    server.stop().await;
}

#[tokio::test]
async fn concurrent_duplicates_execute_at_most_once() {
    let facilitator = Arc::new(FacilitatorState::default());
    let addr = start_facilitator(facilitator.clone()).await;
    let (_root, _state, retriever, server) = paid_server(addr).await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &server.url).await;

    let body = tools_call(json!(1), "dir2mcp.search", json!({"query": "guide"})).to_string();
    let send = |body: String| {
        let client = client.clone();
        let url = server.url.clone();
        let session = session.clone();
        async move {
            client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("MCP-Session-Id", &session)
                .header("X-PAYMENT", "sig-dup")
                .body(body)
                .send()
                .await
                .unwrap()
        }
    };

    let (first, second) = tokio::join!(send(body.clone()), send(body.clone()));
    assert_eq!(first.status(), 200);
    assert_eq!(second.status(), 200);

    let header_a = first
        .headers()
        .get("x-payment-response")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let header_b = second
        .headers()
        .get("x-payment-response")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(header_a, header_b);

    let body_a = first.text().await.unwrap();
    let body_b = second.text().await.unwrap();
    assert_eq!(body_a, body_b);

    // Verify, settle, and the tool itself each ran exactly once.
    assert_eq!(facilitator.verify_calls.load(Ordering::SeqCst), 1);
    assert_eq!(facilitator.settle_calls.load(Ordering::SeqCst), 1);
    assert_eq!(retriever.search_count(), 1);

    // A later duplicate replays from cache without touching anything.
    let third = send(body).await;
    assert_eq!(third.text().await.unwrap(), body_a);
    assert_eq!(facilitator.verify_calls.load(Ordering::SeqCst), 1);
    assert_eq!(retriever.search_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn distinct_params_are_distinct_executions() {
    let facilitator = Arc::new(FacilitatorState::default());
    let addr = start_facilitator(facilitator.clone()).await;
    let (_root, _state, retriever, server) = paid_server(addr).await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &server.url).await;

    for query in ["first", "second"] {
        let response = client
            .post(&server.url)
            .header("Content-Type", "application/json")
            .header("MCP-Session-Id", &session)
            .header("X-PAYMENT", "sig-same")
            .body(tools_call(json!(1), "dir2mcp.search", json!({"query": query})).to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    assert_eq!(facilitator.verify_calls.load(Ordering::SeqCst), 2);
    assert_eq!(retriever.search_count(), 2);

    server.stop().await;
}

#[tokio::test]
async fn tool_errors_do_not_settle() {
    let facilitator = Arc::new(FacilitatorState::default());
    let addr = start_facilitator(facilitator.clone()).await;
    let (_root, _state, _retriever, server) = paid_server(addr).await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &server.url).await;

    let body = tools_call(json!(1), "dir2mcp.unknown", json!({})).to_string();
    let response = client
        .post(&server.url)
        .header("Content-Type", "application/json")
        .header("MCP-Session-Id", &session)
        .header("X-PAYMENT", "sig-err")
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get("x-payment-response").is_none());
    let first: Value = response.json().await.unwrap();
    assert_eq!(first["result"]["isError"], true);

    assert_eq!(facilitator.verify_calls.load(Ordering::SeqCst), 1);
    assert_eq!(facilitator.settle_calls.load(Ordering::SeqCst), 0);

    // Replay is idempotent and still does not settle.
    let response = client
        .post(&server.url)
        .header("Content-Type", "application/json")
        .header("MCP-Session-Id", &session)
        .header("X-PAYMENT", "sig-err")
        .body(body)
        .send()
        .await
        .unwrap();
    let second: Value = response.json().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(facilitator.settle_calls.load(Ordering::SeqCst), 0);

    server.stop().await;
}

#[tokio::test]
async fn settle_failure_reports_503_then_recovers_without_rerunning_the_tool() {
    let facilitator = Arc::new(FacilitatorState {
        settle_failures: AtomicUsize::new(1),
        ..Default::default()
    });
    let addr = start_facilitator(facilitator.clone()).await;
    let (_root, _state, retriever, server) = paid_server(addr).await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &server.url).await;

    let body = tools_call(json!(1), "dir2mcp.search", json!({"query": "guide"})).to_string();
    let response = client
        .post(&server.url)
        .header("Content-Type", "application/json")
        .header("MCP-Session-Id", &session)
        .header("X-PAYMENT", "sig-flaky")
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let first: Value = response.json().await.unwrap();
    assert_eq!(
        first["error"]["data"]["code"],
        "PAYMENT_FACILITATOR_UNAVAILABLE"
    );
    assert_eq!(first["error"]["data"]["retryable"], true);
    assert_eq!(retriever.search_count(), 1);

    // Retry: settlement completes, the tool does not run again.
    let response = client
        .post(&server.url)
        .header("Content-Type", "application/json")
        .header("MCP-Session-Id", &session)
        .header("X-PAYMENT", "sig-flaky")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get("x-payment-response").is_some());
    assert_eq!(retriever.search_count(), 1);
    assert_eq!(facilitator.verify_calls.load(Ordering::SeqCst), 1);
    assert_eq!(facilitator.settle_calls.load(Ordering::SeqCst), 2);

    server.stop().await;
}

#[tokio::test]
async fn verify_rejection_routes_to_402() {
    let facilitator = Arc::new(FacilitatorState {
        verify_failures: AtomicUsize::new(1),
        ..Default::default()
    });
    let addr = start_facilitator(facilitator.clone()).await;
    let (_root, _state, retriever, server) = paid_server(addr).await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &server.url).await;

    let response = client
        .post(&server.url)
        .header("Content-Type", "application/json")
        .header("MCP-Session-Id", &session)
        .header("X-PAYMENT", "sig-bad")
        .body(tools_call(json!(1), "dir2mcp.search", json!({"query": "guide"})).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 402);
    assert!(response.headers().get("www-authenticate").is_some());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["data"]["code"], "PAYMENT_INVALID");

    // The tool never ran.
    assert_eq!(retriever.search_count(), 0);
    assert_eq!(facilitator.settle_calls.load(Ordering::SeqCst), 0);

    server.stop().await;
}
