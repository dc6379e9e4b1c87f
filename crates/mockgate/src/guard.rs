//! Routing guard: per-request admission control.
//!
//! Runs before any stub matching, validating the routing headers, the
//! session they name, and the resolved upstream origin. Checks run in a
//! fixed order and the first failure wins, so callers always see the most
//! fundamental problem first. Requests to the gateway's own API paths
//! never reach the guard.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use hyper::{StatusCode, Uri};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::gateway::{FilterDecision, InboundRequest, IncomingRequestFilter};
use crate::names::headers;
use crate::session::{SessionStatus, SessionStore};

/// Static name -> origin mapping plus the origin port allowlist.
pub struct ServiceMap {
    origins: HashMap<String, Uri>,
    allowed_ports: HashSet<u16>,
}

impl ServiceMap {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut origins = HashMap::with_capacity(config.services.len());
        for (name, raw) in &config.services {
            let uri: Uri = raw.parse()?;
            origins.insert(name.clone(), uri);
        }
        Ok(ServiceMap {
            origins,
            allowed_ports: config.allowed_ports.iter().copied().collect(),
        })
    }

    pub fn resolve_origin(&self, service: &str) -> Option<&Uri> {
        self.origins.get(service)
    }

    pub fn allows_port(&self, port: u16) -> bool {
        self.allowed_ports.contains(&port)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.origins.keys().cloned().collect()
    }
}

/// Explicit port, or the scheme default.
pub fn effective_port(origin: &Uri) -> Option<u16> {
    origin.port_u16().or(match origin.scheme_str() {
        Some("http") => Some(80),
        Some("https") => Some(443),
        _ => None,
    })
}

/// A guard-approved request: the service name and its resolved origin,
/// carried forward for the proxy fallback.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub service: String,
    pub origin: Uri,
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub status: StatusCode,
    pub reason: &'static str,
    pub message: String,
}

impl Rejection {
    fn new(status: StatusCode, reason: &'static str, message: impl Into<String>) -> Self {
        Rejection {
            status,
            reason,
            message: message.into(),
        }
    }

    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": "dynamic-routing-denied",
            "reason": self.reason,
            "message": self.message,
        })
    }
}

pub struct RoutingGuard {
    services: Arc<ServiceMap>,
    sessions: Arc<dyn SessionStore>,
}

impl RoutingGuard {
    pub fn new(services: Arc<ServiceMap>, sessions: Arc<dyn SessionStore>) -> Self {
        RoutingGuard { services, sessions }
    }

    /// The ordered admission checks. First failure returns immediately.
    pub fn admit(
        &self,
        request: &InboundRequest,
        now_ms: i64,
    ) -> Result<ResolvedTarget, Rejection> {
        let Some(service) = request.target_service() else {
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                "missing-service",
                format!("header '{}' is required", headers::TARGET_SERVICE),
            ));
        };
        let Some(session_id) = request.session_id() else {
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                "missing-session",
                format!("header '{}' is required", headers::SESSION_ID),
            ));
        };
        let Some(session) = self.sessions.get(session_id) else {
            return Err(Rejection::new(
                StatusCode::FORBIDDEN,
                "invalid-session",
                format!("session '{}' does not exist", session_id),
            ));
        };
        if session.status != SessionStatus::Active {
            return Err(Rejection::new(
                StatusCode::FORBIDDEN,
                "session-closed",
                format!("session '{}' is closed", session_id),
            ));
        }
        if session.is_expired(now_ms) {
            return Err(Rejection::new(
                StatusCode::FORBIDDEN,
                "session-expired",
                format!("session '{}' has expired", session_id),
            ));
        }
        let Some(origin) = self.services.resolve_origin(service) else {
            return Err(Rejection::new(
                StatusCode::NOT_FOUND,
                "unknown-service",
                format!("no upstream configured for service '{}'", service),
            ));
        };
        if !matches!(origin.scheme_str(), Some("http") | Some("https")) {
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                "invalid-origin",
                format!("origin for service '{}' must be http or https", service),
            ));
        }
        let port = effective_port(origin).unwrap_or(0);
        if !self.services.allows_port(port) {
            return Err(Rejection::new(
                StatusCode::FORBIDDEN,
                "bad-port",
                format!("origin port {} for service '{}' is not allowed", port, service),
            ));
        }
        debug!(service, session_id, "request admitted");
        Ok(ResolvedTarget {
            service: service.to_string(),
            origin: origin.clone(),
        })
    }
}

impl IncomingRequestFilter for RoutingGuard {
    fn filter(&self, request: &InboundRequest) -> FilterDecision {
        match self.admit(request, Utc::now().timestamp_millis()) {
            Ok(target) => FilterDecision::Proceed(Some(target)),
            Err(rejection) => FilterDecision::Reject(rejection),
        }
    }
}
