//! Internal REST surface under `/_gateway-api`.
//!
//! Served on the same listener as proxied traffic but exempt from the
//! routing guard and from capture. Sessions, stub rules, and recorded
//! traffic are managed here; the route table is a plain match over the
//! method and path segments.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::gateway::{GatewayEngine, InboundRequest};
use crate::session::Session;
use crate::stub::types::CreateStubRequest;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    ttl_ms: Option<i64>,
}

pub async fn route(engine: &Arc<GatewayEngine>, request: &InboundRequest) -> Response<Full<Bytes>> {
    let path = request.path.trim_end_matches('/');
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match (request.method.as_str(), &segments[1..]) {
        ("GET", ["health"]) => json_response(StatusCode::OK, &json!({"status": "ok"})),
        ("POST", ["sessions"]) => create_session(engine, request),
        ("GET", ["sessions", id]) => get_session(engine, id),
        ("DELETE", ["sessions", id]) => close_session(engine, id),
        ("POST", ["stubs"]) => create_stub(engine, request),
        ("GET", ["stubs"]) => list_stubs(engine, request),
        ("POST", ["stubs", "prune"]) => prune_stubs(engine),
        ("DELETE", ["stubs", id]) => delete_stub(engine, id),
        ("GET", ["traffic"]) => list_traffic(engine, request),
        ("DELETE", ["traffic"]) => clear_traffic(engine),
        ("GET", ["traffic", id]) => get_traffic(engine, id),
        _ => error_response(StatusCode::NOT_FOUND, "no such endpoint"),
    }
}

fn create_session(engine: &Arc<GatewayEngine>, request: &InboundRequest) -> Response<Full<Bytes>> {
    let payload: CreateSessionRequest = match request.body_text().as_deref() {
        None | Some("") => CreateSessionRequest::default(),
        Some(body) => match serde_json::from_str(body) {
            Ok(payload) => payload,
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid session payload: {err}"),
                )
            }
        },
    };
    let session = Session::new(payload.id, payload.name, payload.owner, payload.ttl_ms);
    let session_id = session.id.clone();
    if !engine.sessions.create(session.clone()) {
        return error_response(
            StatusCode::CONFLICT,
            &format!("session '{session_id}' already exists"),
        );
    }
    info!(session_id, "session created");
    json_response(StatusCode::CREATED, &session)
}

fn get_session(engine: &Arc<GatewayEngine>, id: &str) -> Response<Full<Bytes>> {
    match engine.sessions.get(id) {
        Some(mut session) => {
            session.status = session.effective_status(Utc::now().timestamp_millis());
            json_response(StatusCode::OK, &session)
        }
        None => error_response(StatusCode::NOT_FOUND, &format!("session '{id}' not found")),
    }
}

fn close_session(engine: &Arc<GatewayEngine>, id: &str) -> Response<Full<Bytes>> {
    if engine.sessions.close(id) {
        info!(session_id = id, "session closed");
        json_response(StatusCode::OK, &json!({"id": id, "status": "CLOSED"}))
    } else {
        error_response(StatusCode::NOT_FOUND, &format!("session '{id}' not found"))
    }
}

fn create_stub(engine: &Arc<GatewayEngine>, request: &InboundRequest) -> Response<Full<Bytes>> {
    let Some(body) = request.body_text() else {
        return error_response(StatusCode::BAD_REQUEST, "request body is required");
    };
    let payload: CreateStubRequest = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid stub payload: {err}"),
            )
        }
    };
    // Without a session header the rule is global and visible to all
    // sessions; that is how system rules are installed.
    let session_id = request.session_id().map(str::to_string);
    match engine.create_stub(payload, session_id) {
        Ok(rule) => json_response(StatusCode::CREATED, &rule),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

fn list_stubs(engine: &Arc<GatewayEngine>, request: &InboundRequest) -> Response<Full<Bytes>> {
    let query = request.query_map();
    let rules = engine.store.list(query.get("sessionId").map(String::as_str));
    json_response(
        StatusCode::OK,
        &json!({"count": rules.len(), "stubs": rules}),
    )
}

fn delete_stub(engine: &Arc<GatewayEngine>, id: &str) -> Response<Full<Bytes>> {
    if engine.delete_stub(id) {
        info!(rule_id = id, "stub rule deleted");
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(Bytes::new()))
            .unwrap_or_else(|_| empty_response())
    } else {
        error_response(StatusCode::NOT_FOUND, &format!("stub '{id}' not found"))
    }
}

fn prune_stubs(engine: &Arc<GatewayEngine>) -> Response<Full<Bytes>> {
    let removed = engine.prune_ephemeral();
    json_response(StatusCode::OK, &json!({"removed": removed}))
}

fn list_traffic(engine: &Arc<GatewayEngine>, request: &InboundRequest) -> Response<Full<Bytes>> {
    let query = request.query_map();
    // Traffic listing is strictly session-scoped.
    let Some(session_id) = query.get("sessionId").filter(|id| !id.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "query parameter 'sessionId' is required");
    };
    let limit = query
        .get("limit")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(100);
    let events = engine.traffic_repository.list_by_session(session_id, limit);
    json_response(
        StatusCode::OK,
        &json!({"count": events.len(), "events": events}),
    )
}

fn get_traffic(engine: &Arc<GatewayEngine>, id: &str) -> Response<Full<Bytes>> {
    match engine.traffic_repository.get(id) {
        Some(event) => json_response(StatusCode::OK, &event),
        None => error_response(StatusCode::NOT_FOUND, &format!("traffic event '{id}' not found")),
    }
}

fn clear_traffic(engine: &Arc<GatewayEngine>) -> Response<Full<Bytes>> {
    let cleared = engine.traffic_repository.clear();
    info!(cleared, "traffic events cleared");
    json_response(StatusCode::OK, &json!({"cleared": cleared}))
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let payload = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(payload)))
        .unwrap_or_else(|_| empty_response())
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({"error": message}))
}

fn empty_response() -> Response<Full<Bytes>> {
    Response::new(Full::new(Bytes::new()))
}
