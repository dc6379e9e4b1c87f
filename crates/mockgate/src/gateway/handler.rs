//! Per-request pipeline: buffer the request, route internal API calls,
//! run admission filters, match a stub or fall back to the real upstream,
//! then run the post-serve hooks with the finished exchange.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::admin_api;
use crate::gateway::{FilterDecision, GatewayEngine, InboundRequest, MatchedRule, ServedEvent};
use crate::guard::{Rejection, ResolvedTarget};
use crate::names;
use crate::stub::store::StoredRule;
use crate::stub::types::ResponseMode;

/// One buffered response on its way out, paired with the rule that
/// produced it, if any.
struct Produced {
    status: u16,
    headers: HashMap<String, String>,
    body: Bytes,
    matched: Option<MatchedRule>,
}

pub async fn handle_request(
    engine: Arc<GatewayEngine>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(error = %err, "failed to read request body");
            return Ok(plain_response(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
            ));
        }
    };
    let inbound = to_inbound(&parts, &body_bytes);

    // The gateway's own API surface bypasses admission and capture.
    if names::is_internal_path(&inbound.path) {
        return Ok(admin_api::route(&engine, &inbound).await);
    }

    let mut target: Option<ResolvedTarget> = None;
    for filter in engine.filters() {
        match filter.filter(&inbound) {
            FilterDecision::Proceed(resolved) => {
                if let Some(resolved) = resolved {
                    target = Some(resolved);
                }
            }
            FilterDecision::Reject(rejection) => {
                debug!(
                    method = %inbound.method,
                    path = %inbound.path,
                    reason = rejection.reason,
                    "request rejected by admission filter"
                );
                let produced = rejection_response(&rejection);
                let response = build_response(&produced);
                run_hooks(&engine, &inbound, &produced, started);
                return Ok(response);
            }
        }
    }

    let now = Utc::now().timestamp_millis();
    let produced = match engine.store.match_request(&inbound, now) {
        Some(stored) => {
            debug!(
                method = %inbound.method,
                path = %inbound.path,
                rule_id = stored.id(),
                "stub rule matched"
            );
            serve_stub(&engine, &stored, &inbound, target.as_ref()).await
        }
        None => {
            let Some(target) = target.as_ref() else {
                warn!(path = %inbound.path, "no upstream resolved for unmatched request");
                return Ok(plain_response(
                    StatusCode::BAD_GATEWAY,
                    "no upstream resolved",
                ));
            };
            let upstream = engine.fallback.forward(&target.origin, &inbound).await;
            Produced {
                status: upstream.status,
                headers: upstream.headers,
                body: upstream.body,
                matched: None,
            }
        }
    };

    let response = build_response(&produced);
    run_hooks(&engine, &inbound, &produced, started);
    Ok(response)
}

fn to_inbound(parts: &hyper::http::request::Parts, body: &Bytes) -> InboundRequest {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in &parts.headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        headers
            .entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    InboundRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers,
        body: if body.is_empty() {
            None
        } else {
            Some(body.clone())
        },
    }
}

async fn serve_stub(
    engine: &Arc<GatewayEngine>,
    stored: &StoredRule,
    inbound: &InboundRequest,
    target: Option<&ResolvedTarget>,
) -> Produced {
    let rule = stored.rule();
    let matched = MatchedRule {
        id: rule.id.clone(),
        session_id: rule.session_id.clone(),
        priority: rule.priority,
    };
    match rule.response.mode {
        ResponseMode::Static => static_response(stored, matched),
        ResponseMode::PatchUpstream => patch_upstream(engine, stored, inbound, target, matched).await,
    }
}

fn static_response(stored: &StoredRule, matched: MatchedRule) -> Produced {
    let spec = &stored.rule().response;
    let mut headers: HashMap<String, String> = spec
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect();
    let body = if let Some(json) = &spec.body_json {
        headers
            .entry("content-type".to_string())
            .or_insert_with(|| "application/json".to_string());
        Bytes::from(serde_json::to_vec(json).unwrap_or_default())
    } else if let Some(text) = &spec.body_text {
        Bytes::from(text.clone())
    } else {
        Bytes::new()
    };
    Produced {
        status: spec.status,
        headers,
        body,
        matched: Some(matched),
    }
}

/// Proxies like the fallback would, then rewrites a JSON body with the
/// rule's merge document and overlays the rule's headers.
async fn patch_upstream(
    engine: &Arc<GatewayEngine>,
    stored: &StoredRule,
    inbound: &InboundRequest,
    target: Option<&ResolvedTarget>,
    matched: MatchedRule,
) -> Produced {
    let spec = &stored.rule().response;
    let Some(target) = target else {
        warn!(rule_id = stored.id(), "patch-upstream rule has no resolved origin");
        return Produced {
            status: 502,
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: Bytes::from(
                serde_json::json!({
                    "error": "bad-gateway",
                    "message": "no upstream resolved for patch rule"
                })
                .to_string(),
            ),
            matched: Some(matched),
        };
    };

    let upstream = engine.fallback.forward(&target.origin, inbound).await;
    let mut headers = upstream.headers;
    let mut body = upstream.body;
    if let Some(patch) = &spec.patch {
        if patch.ops.is_some() {
            warn!(rule_id = stored.id(), "json-patch op lists are not supported, ignoring");
        }
        if let Some(merge) = &patch.merge {
            match serde_json::from_slice::<Value>(&body) {
                Ok(mut document) => {
                    merge_patch(&mut document, merge);
                    body = Bytes::from(document.to_string());
                    headers.insert("content-type".to_string(), "application/json".to_string());
                }
                Err(err) => {
                    warn!(rule_id = stored.id(), error = %err, "upstream body is not JSON, merge skipped");
                }
            }
        }
    }
    for (name, value) in &spec.headers {
        headers.insert(name.to_ascii_lowercase(), value.clone());
    }
    Produced {
        status: upstream.status,
        headers,
        body,
        matched: Some(matched),
    }
}

/// RFC 7386 merge-patch: null removes a member, objects merge recursively,
/// everything else replaces the target wholesale.
fn merge_patch(target: &mut Value, patch: &Value) {
    if let Value::Object(patch_map) = patch {
        if !matches!(target, Value::Object(_)) {
            *target = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(target_map) = target {
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
    } else {
        *target = patch.clone();
    }
}

fn rejection_response(rejection: &Rejection) -> Produced {
    Produced {
        status: rejection.status.as_u16(),
        headers: HashMap::from([(
            "content-type".to_string(),
            "application/json".to_string(),
        )]),
        body: Bytes::from(rejection.body().to_string()),
        matched: None,
    }
}

fn build_response(produced: &Produced) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(produced.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &produced.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Full::new(produced.body.clone()))
        .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
}

fn run_hooks(
    engine: &Arc<GatewayEngine>,
    inbound: &InboundRequest,
    produced: &Produced,
    started: Instant,
) {
    let body_text = if produced.body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&produced.body))
    };
    let event = ServedEvent {
        request: inbound,
        matched: produced.matched.as_ref(),
        response_status: produced.status,
        response_headers: &produced.headers,
        response_body: body_text.as_deref(),
        target_service: inbound.target_service(),
        duration_ms: started.elapsed().as_millis() as u64,
    };
    for hook in engine.post_serve_hooks() {
        hook.after_serve(&event);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn merge_patch_follows_rfc_7386() {
        let mut document = json!({
            "title": "Hello",
            "author": {"givenName": "John", "familyName": "Doe"},
            "tags": ["example", "sample"]
        });
        let patch = json!({
            "title": "Hello!",
            "author": {"familyName": null},
            "tags": ["example"],
            "phoneNumber": "+01-123-456-7890"
        });
        merge_patch(&mut document, &patch);
        assert_eq!(
            document,
            json!({
                "title": "Hello!",
                "author": {"givenName": "John"},
                "tags": ["example"],
                "phoneNumber": "+01-123-456-7890"
            })
        );
    }

    #[test]
    fn merge_patch_replaces_non_objects() {
        let mut document = json!([1, 2, 3]);
        merge_patch(&mut document, &json!({"a": 1}));
        assert_eq!(document, json!({"a": 1}));

        let mut document = json!({"a": {"b": 1}});
        merge_patch(&mut document, &json!({"a": 7}));
        assert_eq!(document, json!({"a": 7}));
    }

    #[test]
    fn inbound_conversion_lowercases_headers_and_splits_query() {
        let request = Request::builder()
            .method("POST")
            .uri("http://gateway/api/orders?limit=5&flag")
            .header("X-Mock-Session-Id", "s1")
            .header("Accept", "text/plain")
            .header("Accept", "application/json")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();
        let inbound = to_inbound(&parts, &Bytes::from_static(b"payload"));

        assert_eq!(inbound.method, "POST");
        assert_eq!(inbound.path, "/api/orders");
        assert_eq!(inbound.path_and_query(), "/api/orders?limit=5&flag");
        assert_eq!(inbound.session_id(), Some("s1"));
        assert_eq!(inbound.header("accept"), Some("text/plain, application/json"));
        assert_eq!(inbound.body_text().as_deref(), Some("payload"));
        assert_eq!(inbound.query_map()["limit"], "5");
    }
}
