//! Streamable HTTP transport for the MCP endpoint.
//!
//! One configured path serves POST (JSON-RPC 2.0), GET (SSE event stream),
//! and DELETE (session termination). The in-handler middleware chain runs
//! origin → auth → rate limit → body/framing → session resolution →
//! method dispatch, with the x402 gate wrapped around `tools/call` when
//! payments are enabled.

use crate::config::{AuthMode, Config};
use crate::mcp::server::AppState;
use crate::mcp::types::{canonical, invalid_request, parse_error, server_error, unknown_method};
use crate::payment::GateReply;
use crate::rate_limit::client_ip;
use crate::session::{Session, SessionLookup};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::{future, stream, StreamExt};
use jsonrpc_core::types::request::{Call, MethodCall};
use jsonrpc_core::types::response::{Failure, Output, Success};
use jsonrpc_core::{Error as RpcError, Id, Params, Version};
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
pub const X_PAYMENT_HEADER: &str = "x-payment";
pub const X_PAYMENT_RESPONSE_HEADER: &str = "x-payment-response";

const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the axum router for the MCP endpoint.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(MCP_SESSION_ID_HEADER),
            HeaderName::from_static(X_PAYMENT_RESPONSE_HEADER),
            header::WWW_AUTHENTICATE,
        ]);
    let mcp_path = state.config.mcp_path.clone();

    Router::new()
        .route(
            &mcp_path,
            post(handle_post).get(handle_get).delete(handle_delete),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(HANDLER_TIMEOUT))
        .layer(cors)
        .with_state(state)
}

/// Normalized origin allow-set: scheme and host lowercased, default ports
/// folded away. An empty set skips the check.
pub struct OriginSet {
    allowed: Vec<String>,
}

impl OriginSet {
    pub fn new(origins: &[String]) -> Self {
        Self {
            allowed: origins.iter().filter_map(|o| normalize_origin(o)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn allows(&self, origin: &str) -> bool {
        match normalize_origin(origin) {
            Some(normalized) => self.allowed.iter().any(|a| *a == normalized),
            None => false,
        }
    }
}

fn normalize_origin(origin: &str) -> Option<String> {
    let parsed = url::Url::parse(origin.trim()).ok()?;
    let scheme = parsed.scheme().to_ascii_lowercase();
    let host = parsed.host_str()?.to_ascii_lowercase();
    match parsed.port() {
        Some(port) if !is_default_port(&scheme, port) => {
            Some(format!("{scheme}://{host}:{port}"))
        }
        _ => Some(format!("{scheme}://{host}")),
    }
}

fn is_default_port(scheme: &str, port: u16) -> bool {
    matches!((scheme, port), ("http", 80) | ("https", 443) | ("ws", 80) | ("wss", 443))
}

/// Pre-parse transport failure: plain HTTP, no JSON-RPC body.
struct TransportError {
    status: StatusCode,
    code: &'static str,
    message: String,
    www_authenticate: Option<String>,
}

impl TransportError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            www_authenticate: None,
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: message.into(),
            www_authenticate: Some("Bearer".to_string()),
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let body = Json(json!({"error": self.code, "message": self.message}));
        let mut response = (self.status, body).into_response();
        if let Some(value) = self.www_authenticate {
            if let Ok(value) = HeaderValue::from_str(&value) {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

/// Origin, auth, and rate-limit checks shared by all three verbs.
fn guard_request(
    state: &AppState,
    headers: &HeaderMap,
    remote: SocketAddr,
) -> Result<(), Response> {
    check_origin(state, headers).map_err(IntoResponse::into_response)?;
    check_auth(&state.config, headers).map_err(|err| {
        state.events.warning("auth_rejected", json!({"remote": remote.ip().to_string()}));
        err.into_response()
    })?;
    check_rate_limit(state, headers, remote)?;
    Ok(())
}

fn check_origin(state: &AppState, headers: &HeaderMap) -> Result<(), TransportError> {
    if state.origins.is_empty() {
        return Ok(());
    }
    let origin = match headers.get(header::ORIGIN) {
        Some(value) => value.to_str().map_err(|_| {
            TransportError::new(
                StatusCode::FORBIDDEN,
                "origin_not_allowed",
                "Origin header must be valid UTF-8",
            )
        })?,
        // Non-browser callers carry no Origin; nothing to check.
        None => return Ok(()),
    };
    if state.origins.allows(origin) {
        Ok(())
    } else {
        tracing::warn!("rejected request from disallowed origin {}", origin);
        Err(TransportError::new(
            StatusCode::FORBIDDEN,
            "origin_not_allowed",
            format!("origin '{origin}' is not permitted"),
        ))
    }
}

fn check_auth(config: &Config, headers: &HeaderMap) -> Result<(), TransportError> {
    let accepted: Vec<&str> = match config.auth.mode {
        AuthMode::None => return Ok(()),
        AuthMode::Token => config.auth.token.as_deref().into_iter().collect(),
        AuthMode::Allowlist => config.auth.allowlist.iter().map(String::as_str).collect(),
    };

    let presented = bearer_token(headers)
        .ok_or_else(|| TransportError::unauthorized("bearer token required"))?;
    let authorized = accepted
        .iter()
        .any(|token| constant_time_eq(presented.as_bytes(), token.as_bytes()));
    if authorized {
        Ok(())
    } else {
        Err(TransportError::unauthorized("invalid bearer token"))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn check_rate_limit(
    state: &AppState,
    headers: &HeaderMap,
    remote: SocketAddr,
) -> Result<(), Response> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok());
    // An underivable client IP bypasses limiting rather than failing the
    // request.
    let ip = match client_ip(remote, forwarded, &state.proxies) {
        Some(ip) => ip,
        None => return Ok(()),
    };
    if state.limiter.allow(ip) {
        return Ok(());
    }

    state
        .events
        .warning("rate_limited", json!({"ip": ip.to_string()}));
    let output = failure_output(
        Id::Null,
        server_error("rate limit exceeded", canonical::RATE_LIMITED, true),
    );
    let mut response = rpc_response(StatusCode::TOO_MANY_REQUESTS, &output);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    Err(response)
}

fn failure_output(id: Id, error: RpcError) -> Output {
    Output::Failure(Failure {
        jsonrpc: Some(Version::V2),
        error,
        id,
    })
}

fn success_output(id: Id, result: Value) -> Output {
    Output::Success(Success {
        jsonrpc: Some(Version::V2),
        result,
        id,
    })
}

fn rpc_response(status: StatusCode, output: &Output) -> Response {
    let body = serde_json::to_vec(output).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn accepted_response() -> Response {
    Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::ACCEPTED.into_response())
}

/// POST: JSON-RPC requests.
///
/// The body is deliberately not an extractor: origin, auth, and rate
/// limiting must reject before a single body byte is read, so the size
/// guard runs fourth, on the raw request.
async fn handle_post(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let headers = request.headers().clone();
    if let Err(response) = guard_request(&state, &headers, remote) {
        return response;
    }

    if !content_type_is_json(&headers) {
        return TransportError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported_media_type",
            "Content-Type must be application/json",
        )
        .into_response();
    }

    let limit = state.config.body_limit_bytes;
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if matches!(declared, Some(len) if len > limit) {
        return body_too_large(limit);
    }
    // Chunked bodies carry no Content-Length; the buffered read enforces
    // the same cap.
    let body = match axum::body::to_bytes(request.into_body(), limit).await {
        Ok(body) => body,
        Err(_) => return body_too_large(limit),
    };

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            let output = failure_output(Id::Null, parse_error(format!("invalid JSON: {err}")));
            return rpc_response(StatusCode::BAD_REQUEST, &output);
        }
    };

    let request: jsonrpc_core::Request = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(_) => {
            let output = failure_output(
                Id::Null,
                invalid_request("not a JSON-RPC request", canonical::INVALID_FIELD),
            );
            return rpc_response(StatusCode::BAD_REQUEST, &output);
        }
    };

    match request {
        jsonrpc_core::Request::Single(Call::MethodCall(call)) => {
            process_call(state, headers, call).await
        }
        // Notifications are acknowledged and dropped.
        jsonrpc_core::Request::Single(Call::Notification(_)) => accepted_response(),
        jsonrpc_core::Request::Single(Call::Invalid { id }) => {
            let output = failure_output(
                id,
                invalid_request("invalid JSON-RPC request", canonical::INVALID_FIELD),
            );
            rpc_response(StatusCode::BAD_REQUEST, &output)
        }
        jsonrpc_core::Request::Batch(_) => {
            let output = failure_output(
                Id::Null,
                invalid_request("batch requests are not supported", canonical::INVALID_FIELD),
            );
            rpc_response(StatusCode::BAD_REQUEST, &output)
        }
    }
}

fn body_too_large(limit: usize) -> Response {
    TransportError::new(
        StatusCode::PAYLOAD_TOO_LARGE,
        "payload_too_large",
        format!("request body exceeds {limit} bytes"),
    )
    .into_response()
}

fn content_type_is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .map(|m| m.type_() == mime::APPLICATION && m.subtype() == mime::JSON)
        .unwrap_or(false)
}

async fn process_call(state: AppState, headers: HeaderMap, call: MethodCall) -> Response {
    let id = call.id.clone();
    match call.method.as_str() {
        // The one method that mints a session instead of requiring one.
        "initialize" => handle_initialize(state, call),
        "tools/list" => {
            if let Err(response) = resolve_session(&state, &headers, id.clone()) {
                return response;
            }
            let tools: Vec<_> = state.registry.definitions().into_iter().cloned().collect();
            rpc_response(StatusCode::OK, &success_output(id, json!({"tools": tools})))
        }
        "tools/call" => {
            let session = match resolve_session(&state, &headers, id.clone()) {
                Ok(session) => session,
                Err(response) => return response,
            };
            handle_tools_call(state, headers, session, call).await
        }
        "ping" => {
            if let Err(response) = resolve_session(&state, &headers, id.clone()) {
                return response;
            }
            let result = json!({
                "status": "ok",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "uptime_seconds": state.start_time.elapsed().as_secs(),
            });
            rpc_response(StatusCode::OK, &success_output(id, result))
        }
        other => rpc_response(StatusCode::OK, &failure_output(id, unknown_method(other))),
    }
}

fn handle_initialize(state: AppState, call: MethodCall) -> Response {
    let params = match call.params {
        Params::None => Map::new(),
        Params::Map(map) => map,
        Params::Array(_) => {
            let output = failure_output(
                call.id,
                invalid_request("params must be an object", canonical::INVALID_FIELD),
            );
            return rpc_response(StatusCode::BAD_REQUEST, &output);
        }
    };
    let protocol_version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(&state.config.protocol_version);

    let session = state.sessions.create(protocol_version);
    session.mark_initialized();
    state
        .events
        .info("session_created", json!({"session": session.id}));

    let result = json!({
        "protocolVersion": state.config.protocol_version,
        "capabilities": {
            "tools": {"listChanged": false},
            "logging": {},
        },
        "serverInfo": {
            "name": state.config.server_name,
            "version": state.config.server_version,
        },
    });
    let mut response = rpc_response(StatusCode::OK, &success_output(call.id, result));
    if let Ok(value) = HeaderValue::from_str(&session.id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(MCP_SESSION_ID_HEADER), value);
    }
    response
}

/// Look up the session named by the request headers, touching it on
/// success. Missing or unknown sessions are HTTP 400 with the matching
/// canonical code.
fn resolve_session(
    state: &AppState,
    headers: &HeaderMap,
    id: Id,
) -> Result<Arc<Session>, Response> {
    let raw = match headers.get(MCP_SESSION_ID_HEADER) {
        Some(raw) => raw,
        None => {
            let output = failure_output(
                id,
                server_error(
                    "MCP-Session-Id header is required",
                    canonical::SESSION_REQUIRED,
                    false,
                ),
            );
            return Err(rpc_response(StatusCode::BAD_REQUEST, &output));
        }
    };
    let session_id = raw.to_str().map_err(|_| {
        let output = failure_output(
            id.clone(),
            server_error(
                "MCP-Session-Id header must be valid UTF-8",
                canonical::SESSION_INVALID,
                false,
            ),
        );
        rpc_response(StatusCode::BAD_REQUEST, &output)
    })?;

    match state.sessions.lookup(session_id) {
        SessionLookup::Found(session) => {
            session.touch();
            Ok(session)
        }
        SessionLookup::NotFound | SessionLookup::Expired => {
            let output = failure_output(
                id,
                server_error(
                    "session is unknown or expired",
                    canonical::SESSION_INVALID,
                    false,
                ),
            );
            Err(rpc_response(StatusCode::BAD_REQUEST, &output))
        }
    }
}

async fn handle_tools_call(
    state: AppState,
    headers: HeaderMap,
    session: Arc<Session>,
    call: MethodCall,
) -> Response {
    let id = call.id.clone();
    let params_value = match call.params {
        Params::None => {
            let output = failure_output(
                id,
                invalid_request("params is required", canonical::MISSING_FIELD),
            );
            return rpc_response(StatusCode::BAD_REQUEST, &output);
        }
        Params::Map(map) => Value::Object(map),
        Params::Array(_) => {
            let output = failure_output(
                id,
                invalid_request("params must be an object", canonical::INVALID_FIELD),
            );
            return rpc_response(StatusCode::BAD_REQUEST, &output);
        }
    };

    match &state.gate {
        Some(gate) => {
            let params_bytes = serde_json::to_vec(&params_value).unwrap_or_default();
            let signature = headers
                .get(X_PAYMENT_HEADER)
                .and_then(|value| value.to_str().ok());
            let exec_state = state.clone();
            let exec_params = params_value.clone();
            let reply = gate
                .handle_tools_call(id, signature, &params_bytes, move || {
                    run_tools_call(exec_state, exec_params)
                })
                .await;
            gate_response(&session, reply, gate.challenge_header())
        }
        None => match run_tools_call(state.clone(), params_value).await {
            Ok(result) => {
                publish_tool_event(&session, &result);
                rpc_response(StatusCode::OK, &success_output(id, result))
            }
            Err((status, error)) => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
                rpc_response(status, &failure_output(id, error))
            }
        },
    }
}

/// Parse `{name, arguments}` and dispatch through the registry. Returns
/// the serialized tool result, or an RPC-level error for envelope
/// problems.
async fn run_tools_call(
    state: AppState,
    params: Value,
) -> Result<Value, (u16, RpcError)> {
    let params = match params {
        Value::Object(map) => map,
        _ => {
            return Err((
                400,
                invalid_request("params must be an object", canonical::INVALID_FIELD),
            ))
        }
    };
    let name = match params.get("name") {
        Some(Value::String(name)) => name.clone(),
        Some(_) => {
            return Err((
                400,
                invalid_request("'name' must be a string", canonical::INVALID_FIELD),
            ))
        }
        None => {
            return Err((
                400,
                invalid_request("'name' is required", canonical::MISSING_FIELD),
            ))
        }
    };
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or(Value::Object(Map::new()));

    let start = Instant::now();
    let result = state.registry.dispatch(&name, arguments).await;
    state.events.info(
        "tool_call",
        json!({
            "tool": name,
            "duration_ms": start.elapsed().as_millis() as u64,
            "is_error": result.is_error,
        }),
    );
    Ok(result.to_value())
}

fn publish_tool_event(session: &Session, result: &Value) {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    session.publish("tool_result", json!({"is_error": is_error}));
}

fn gate_response(session: &Session, reply: GateReply, challenge_header: String) -> Response {
    if reply.challenge {
        session.publish("payment_required", json!({}));
    } else if let Output::Success(success) = &reply.output {
        publish_tool_event(session, &success.result);
    }

    let status = StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::OK);
    let mut response = rpc_response(status, &reply.output);
    if reply.challenge {
        if let Ok(value) = HeaderValue::from_str(&challenge_header) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
    }
    if let Some(payment_response) = reply.payment_response {
        if let Ok(value) = HeaderValue::from_str(&payment_response) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(X_PAYMENT_RESPONSE_HEADER), value);
        }
    }
    response
}

/// GET: SSE stream of session events with periodic heartbeats.
async fn handle_get(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = guard_request(&state, &headers, remote) {
        return response;
    }
    if !accept_includes_event_stream(&headers) {
        return TransportError::new(
            StatusCode::NOT_ACCEPTABLE,
            "not_acceptable",
            "Accept header must include text/event-stream",
        )
        .into_response();
    }

    let session = match resolve_session(&state, &headers, Id::Null) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let session_id = session.id.clone();
    let receiver = session.subscribe();
    // Only the receiver is kept: the stream must observe channel closure
    // when the registry drops the session.
    drop(session);

    enum Item {
        Event(crate::session::SessionEvent),
        Lagged(u64),
        Heartbeat,
        Closed,
    }

    let events = BroadcastStream::new(receiver)
        .map(|result| match result {
            Ok(event) => Item::Event(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => Item::Lagged(skipped),
        })
        .chain(stream::once(future::ready(Item::Closed)));

    let interval = state.config.health_check_interval;
    let heartbeats = IntervalStream::new(tokio::time::interval_at(
        tokio::time::Instant::now() + interval,
        interval,
    ))
    .map(|_| Item::Heartbeat);

    let ready = stream::once(future::ready(Item::Event(crate::session::SessionEvent {
        kind: "ready".to_string(),
        data: json!({"session": session_id}),
    })));

    let merged = ready
        .chain(stream::select(events, heartbeats))
        .take_while(|item| future::ready(!matches!(item, Item::Closed)))
        .map(|item| {
            let event = match item {
                Item::Event(event) => Event::default()
                    .event(event.kind)
                    .data(event.data.to_string()),
                Item::Lagged(skipped) => Event::default()
                    .event("warning")
                    .data(json!({"dropped_events": skipped}).to_string()),
                Item::Heartbeat => Event::default()
                    .event("heartbeat")
                    .data(json!({"ts": chrono::Utc::now().to_rfc3339()}).to_string()),
                Item::Closed => unreachable!("filtered by take_while"),
            };
            Ok::<_, Infallible>(event)
        });

    Sse::new(merged).into_response()
}

fn accept_includes_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| {
            accept
                .split(',')
                .any(|part| {
                    let part = part.trim();
                    part.starts_with("text/event-stream") || part.starts_with("*/*")
                })
        })
        .unwrap_or(false)
}

/// DELETE: explicit session termination.
async fn handle_delete(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = guard_request(&state, &headers, remote) {
        return response;
    }

    let raw = match headers.get(MCP_SESSION_ID_HEADER) {
        Some(raw) => raw.to_str().ok(),
        None => None,
    };
    let session_id = match raw {
        Some(session_id) => session_id,
        None => {
            let output = failure_output(
                Id::Null,
                server_error(
                    "MCP-Session-Id header is required",
                    canonical::SESSION_REQUIRED,
                    false,
                ),
            );
            return rpc_response(StatusCode::BAD_REQUEST, &output);
        }
    };

    if state.sessions.delete(session_id) {
        state
            .events
            .info("session_terminated", json!({"session": session_id, "reason": "delete"}));
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::NO_CONTENT.into_response())
    } else {
        let output = failure_output(
            Id::Null,
            server_error(
                "session is unknown or expired",
                canonical::SESSION_INVALID,
                false,
            ),
        );
        rpc_response(StatusCode::BAD_REQUEST, &output)
    }
}
