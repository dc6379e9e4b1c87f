//! Gateway engine: the shared context every request handler works against,
//! plus the extension seams the request pipeline is composed from.
//!
//! The pipeline is an explicit ordered list of `IncomingRequestFilter`s
//! (today: the routing guard) followed by stub matching or the proxy
//! fallback, followed by an ordered list of `PostServeHook`s (ephemeral
//! bookkeeping, then traffic capture).

pub mod fallback;
pub mod handler;
pub mod server;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::guard::{Rejection, ResolvedTarget, RoutingGuard, ServiceMap};
use crate::names::{headers, priorities};
use crate::repository::{session_key, StubRepository, TrafficRepository};
use crate::session::SessionStore;
use crate::stub::predicates::CompileError;
use crate::stub::store::{ServeOutcome, StubStore};
use crate::stub::types::{CreateStubRequest, StubRule};
use crate::traffic::broadcaster::TrafficBroadcaster;
use crate::traffic::pipeline::TrafficPipeline;
use crate::traffic::types::{mask_sensitive, TrafficEvent};
use fallback::ReverseProxyFallback;

/// A buffered inbound request in the shape the matching and guard layers
/// consume. Header names are lowercased at construction. The body is kept
/// as raw bytes so forwarding stays byte-exact; matching and capture use
/// the lossy text view.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
}

impl InboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Text view of the body for matching and capture. Invalid UTF-8 is
    /// replaced, never an error.
    pub fn body_text(&self) -> Option<Cow<'_, str>> {
        self.body.as_ref().map(|bytes| String::from_utf8_lossy(bytes))
    }

    fn non_blank_header(&self, name: &str) -> Option<&str> {
        self.header(name).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn target_service(&self) -> Option<&str> {
        self.non_blank_header(headers::TARGET_SERVICE)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.non_blank_header(headers::SESSION_ID)
    }

    /// The match candidate: path plus the raw query string, if any.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Decoded query parameters. Repeated keys keep the last value.
    pub fn query_map(&self) -> HashMap<String, String> {
        let Some(query) = &self.query else {
            return HashMap::new();
        };
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (
                    urlencoding::decode(key).map(|c| c.into_owned()).unwrap_or_else(|_| key.to_string()),
                    urlencoding::decode(value).map(|c| c.into_owned()).unwrap_or_else(|_| value.to_string()),
                )
            })
            .collect()
    }
}

pub enum FilterDecision {
    /// Continue, optionally attaching the resolved proxy target.
    Proceed(Option<ResolvedTarget>),
    Reject(Rejection),
}

/// Pre-match admission step. Filters run in registration order; the first
/// rejection short-circuits the pipeline.
pub trait IncomingRequestFilter: Send + Sync {
    fn filter(&self, request: &InboundRequest) -> FilterDecision;
}

/// Identity of the rule that answered a request.
#[derive(Debug, Clone)]
pub struct MatchedRule {
    pub id: String,
    pub session_id: Option<String>,
    pub priority: i32,
}

/// Everything a post-serve hook may observe about one finished exchange.
pub struct ServedEvent<'a> {
    pub request: &'a InboundRequest,
    pub matched: Option<&'a MatchedRule>,
    pub response_status: u16,
    pub response_headers: &'a HashMap<String, String>,
    pub response_body: Option<&'a str>,
    pub target_service: Option<&'a str>,
    pub duration_ms: u64,
}

/// Runs after the response has been produced. Hooks must not fail the
/// request; anything that goes wrong is logged and swallowed.
pub trait PostServeHook: Send + Sync {
    fn after_serve(&self, event: &ServedEvent<'_>);
}

/// Applies the use/TTL budget of the matched rule and mirrors the result
/// into the stub repository.
pub struct EphemeralServeHook {
    store: Arc<StubStore>,
    repository: Arc<dyn StubRepository>,
}

impl PostServeHook for EphemeralServeHook {
    fn after_serve(&self, event: &ServedEvent<'_>) {
        let Some(matched) = event.matched else {
            return;
        };
        let now = Utc::now().timestamp_millis();
        match self.store.on_served(&matched.id, now) {
            ServeOutcome::Untouched | ServeOutcome::Missing => {}
            ServeOutcome::Decremented(remaining) => {
                if let Some(stored) = self.store.get(&matched.id) {
                    self.repository.save(&stored.snapshot());
                }
                debug!(rule_id = %matched.id, remaining, "ephemeral use consumed");
            }
            ServeOutcome::Exhausted => {
                let session = matched.session_id.as_deref().unwrap_or("");
                self.repository.delete(session, &matched.id);
                info!(rule_id = %matched.id, "ephemeral rule exhausted and removed");
            }
            ServeOutcome::Expired => {
                let session = matched.session_id.as_deref().unwrap_or("");
                self.repository.delete(session, &matched.id);
                info!(rule_id = %matched.id, "ephemeral rule expired and removed");
            }
        }
    }
}

/// Builds a TrafficEvent for session-scoped requests and hands it to the
/// capture pipeline. Requests without a session header are never captured.
pub struct TrafficCaptureHook {
    pipeline: Arc<TrafficPipeline>,
}

impl PostServeHook for TrafficCaptureHook {
    fn after_serve(&self, event: &ServedEvent<'_>) {
        let Some(session_id) = event.request.session_id() else {
            return;
        };
        let mut request_headers = event.request.headers.clone();
        mask_sensitive(&mut request_headers);
        let mut response_headers = event.response_headers.clone();
        mask_sensitive(&mut response_headers);
        let stubbed = event
            .matched
            .is_some_and(|m| m.priority != priorities::PROXY_FALLBACK);
        self.pipeline.capture(TrafficEvent {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            method: event.request.method.clone(),
            path: event.request.path.clone(),
            query: event.request.query_map(),
            request_headers,
            request_body: event.request.body_text().map(Cow::into_owned),
            response_status: event.response_status,
            response_headers,
            response_body: event.response_body.map(str::to_string),
            stubbed,
            matched_stub_id: event.matched.map(|m| m.id.clone()),
            duration_ms: event.duration_ms,
            target_service: event.target_service.map(str::to_string),
        });
    }
}

/// Shared per-process state: configuration, stores, the proxy client, and
/// the composed filter/hook pipeline.
pub struct GatewayEngine {
    config: Config,
    pub store: Arc<StubStore>,
    pub stub_repository: Arc<dyn StubRepository>,
    pub traffic_repository: Arc<dyn TrafficRepository>,
    pub sessions: Arc<dyn SessionStore>,
    pub services: Arc<ServiceMap>,
    pub fallback: ReverseProxyFallback,
    pub pipeline: Arc<TrafficPipeline>,
    pub broadcaster: Arc<TrafficBroadcaster>,
    filters: Vec<Arc<dyn IncomingRequestFilter>>,
    post_serve: Vec<Arc<dyn PostServeHook>>,
}

impl GatewayEngine {
    pub fn new(
        config: Config,
        stub_repository: Arc<dyn StubRepository>,
        traffic_repository: Arc<dyn TrafficRepository>,
        sessions: Arc<dyn SessionStore>,
    ) -> anyhow::Result<Arc<Self>> {
        let services = Arc::new(ServiceMap::from_config(&config)?);
        let store = Arc::new(StubStore::new());
        let broadcaster = Arc::new(TrafficBroadcaster::new());
        let pipeline = TrafficPipeline::start(
            Arc::clone(&traffic_repository),
            Arc::clone(&broadcaster),
            config.capture.buffer_capacity,
        );
        let fallback = ReverseProxyFallback::new(&config.upstream)?;
        let guard = Arc::new(RoutingGuard::new(
            Arc::clone(&services),
            Arc::clone(&sessions),
        ));
        let filters: Vec<Arc<dyn IncomingRequestFilter>> = vec![guard];
        let post_serve: Vec<Arc<dyn PostServeHook>> = vec![
            Arc::new(EphemeralServeHook {
                store: Arc::clone(&store),
                repository: Arc::clone(&stub_repository),
            }),
            Arc::new(TrafficCaptureHook {
                pipeline: Arc::clone(&pipeline),
            }),
        ];
        let engine = Arc::new(GatewayEngine {
            config,
            store,
            stub_repository,
            traffic_repository,
            sessions,
            services,
            fallback,
            pipeline,
            broadcaster,
            filters,
            post_serve,
        });
        engine.reload_from_repository();
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn filters(&self) -> &[Arc<dyn IncomingRequestFilter>] {
        &self.filters
    }

    pub fn post_serve_hooks(&self) -> &[Arc<dyn PostServeHook>] {
        &self.post_serve
    }

    /// Replays persisted active rules into the in-memory store. Rules that
    /// no longer compile are skipped, not fatal.
    pub fn reload_from_repository(&self) -> usize {
        let mut loaded = 0;
        for rule in self.stub_repository.get_all_active() {
            let rule_id = rule.id.clone();
            match self.store.insert(rule) {
                Ok(_) => loaded += 1,
                Err(err) => {
                    warn!(rule_id, error = %err, "skipping persisted rule that fails to compile")
                }
            }
        }
        if loaded > 0 {
            info!(loaded, "reloaded stub rules from repository");
        }
        loaded
    }

    /// Compiles, stores, and persists a new rule.
    pub fn create_stub(
        &self,
        create: CreateStubRequest,
        session_id: Option<String>,
    ) -> Result<StubRule, CompileError> {
        let rule = StubRule::from_create(create, session_id);
        let stored = self.store.insert(rule)?;
        let snapshot = stored.snapshot();
        self.stub_repository.save(&snapshot);
        info!(
            rule_id = %snapshot.id,
            session_id = snapshot.session_id.as_deref().unwrap_or("-"),
            priority = snapshot.priority,
            "stub rule created"
        );
        Ok(snapshot)
    }

    /// Removes a rule from the store and from persistence. Deletion has no
    /// session context, so the owning session comes from a cross-session
    /// lookup first.
    pub fn delete_stub(&self, rule_id: &str) -> bool {
        let in_store = self.store.remove(rule_id);
        let in_repository = match self.stub_repository.find_by_rule_id(rule_id) {
            Some(rule) => self.stub_repository.delete(session_key(&rule), rule_id),
            None => false,
        };
        in_store || in_repository
    }

    /// Drops every exhausted or TTL-expired rule right now.
    pub fn prune_ephemeral(&self) -> usize {
        let removed = self.store.prune_now(Utc::now().timestamp_millis());
        for rule_id in &removed {
            if let Some(rule) = self.stub_repository.find_by_rule_id(rule_id) {
                self.stub_repository.delete(session_key(&rule), rule_id);
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "pruned dead ephemeral rules");
        }
        removed.len()
    }

    /// Stops the capture pipeline; in-flight events still drain.
    pub fn shutdown(&self) {
        self.pipeline.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::repository::{InMemoryStubRepository, InMemoryTrafficRepository};

    fn headers_with_session(session: Option<&str>) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(id) = session {
            map.insert(headers::SESSION_ID.to_string(), id.to_string());
        }
        map.insert("authorization".to_string(), "Bearer token".to_string());
        map
    }

    fn served<'a>(
        request: &'a InboundRequest,
        matched: Option<&'a MatchedRule>,
        response_headers: &'a HashMap<String, String>,
    ) -> ServedEvent<'a> {
        ServedEvent {
            request,
            matched,
            response_status: 200,
            response_headers,
            response_body: Some("ok"),
            target_service: Some("orders"),
            duration_ms: 3,
        }
    }

    #[tokio::test]
    async fn capture_hook_skips_requests_without_a_session() {
        let repository = Arc::new(InMemoryTrafficRepository::new());
        let broadcaster = Arc::new(TrafficBroadcaster::new());
        let pipeline = TrafficPipeline::start(
            Arc::clone(&repository) as Arc<dyn TrafficRepository>,
            broadcaster,
            8,
        );
        let hook = TrafficCaptureHook {
            pipeline: Arc::clone(&pipeline),
        };

        let response_headers = HashMap::new();
        let anonymous = InboundRequest {
            method: "GET".to_string(),
            path: "/x".to_string(),
            query: None,
            headers: headers_with_session(None),
            body: None,
        };
        hook.after_serve(&served(&anonymous, None, &response_headers));

        let scoped = InboundRequest {
            method: "GET".to_string(),
            path: "/x".to_string(),
            query: Some("a=1&b=two%20words".to_string()),
            headers: headers_with_session(Some("s1")),
            body: None,
        };
        hook.after_serve(&served(&scoped, None, &response_headers));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = repository.list_by_session("s1", 10);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(!event.stubbed);
        assert_eq!(event.query["b"], "two words");
        assert_eq!(event.request_headers["authorization"], "*****");
    }

    #[tokio::test]
    async fn fallback_priority_hits_are_not_stubbed() {
        let repository = Arc::new(InMemoryTrafficRepository::new());
        let pipeline = TrafficPipeline::start(
            Arc::clone(&repository) as Arc<dyn TrafficRepository>,
            Arc::new(TrafficBroadcaster::new()),
            8,
        );
        let hook = TrafficCaptureHook { pipeline };

        let request = InboundRequest {
            method: "GET".to_string(),
            path: "/x".to_string(),
            query: None,
            headers: headers_with_session(Some("s1")),
            body: None,
        };
        let response_headers = HashMap::new();
        let fallback_rule = MatchedRule {
            id: "r1".to_string(),
            session_id: Some("s1".to_string()),
            priority: priorities::PROXY_FALLBACK,
        };
        let stub_rule = MatchedRule {
            id: "r2".to_string(),
            session_id: Some("s1".to_string()),
            priority: priorities::DEFAULT,
        };
        hook.after_serve(&served(&request, Some(&fallback_rule), &response_headers));
        hook.after_serve(&served(&request, Some(&stub_rule), &response_headers));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = repository.list_by_session("s1", 10);
        assert_eq!(events.len(), 2);
        let stubbed: Vec<bool> = events.iter().map(|e| e.stubbed).collect();
        assert!(stubbed.contains(&true) && stubbed.contains(&false));
    }

    #[test]
    fn ephemeral_hook_mirrors_lifecycle_into_the_repository() {
        use crate::stub::types::{
            EphemeralSpec, MatchMethod, RequestMatcher, ResponseSpec, UrlMatch, UrlMatchKind,
        };

        let store = Arc::new(StubStore::new());
        let repository = Arc::new(InMemoryStubRepository::new());
        let hook = EphemeralServeHook {
            store: Arc::clone(&store),
            repository: Arc::clone(&repository) as Arc<dyn StubRepository>,
        };

        let create = CreateStubRequest {
            request: RequestMatcher {
                method: MatchMethod::Any,
                url: UrlMatch {
                    kind: UrlMatchKind::Exact,
                    value: "/x".to_string(),
                },
                headers: HashMap::new(),
                body: None,
            },
            response: ResponseSpec {
                mode: Default::default(),
                status: 200,
                headers: HashMap::new(),
                body_json: None,
                body_text: Some("ok".to_string()),
                patch: None,
            },
            priority: None,
            ephemeral: Some(EphemeralSpec {
                uses: Some(2),
                ttl_ms: None,
            }),
        };
        let rule = StubRule::from_create(create, Some("s1".to_string()));
        let rule_id = rule.id.clone();
        store.insert(rule.clone()).unwrap();
        repository.save(&rule);

        let request = InboundRequest {
            method: "GET".to_string(),
            path: "/x".to_string(),
            query: None,
            headers: HashMap::new(),
            body: None,
        };
        let response_headers = HashMap::new();
        let matched = MatchedRule {
            id: rule_id.clone(),
            session_id: Some("s1".to_string()),
            priority: priorities::DEFAULT,
        };

        hook.after_serve(&served(&request, Some(&matched), &response_headers));
        let persisted = repository.get("s1", &rule_id).unwrap();
        assert_eq!(persisted.ephemeral.unwrap().uses_remaining, Some(1));

        hook.after_serve(&served(&request, Some(&matched), &response_headers));
        assert!(repository.find_by_rule_id(&rule_id).is_none());
        assert!(store.get(&rule_id).is_none());
    }
}
