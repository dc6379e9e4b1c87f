//! Persistence traits for stub rules and traffic events, with in-memory
//! implementations.
//!
//! The gateway core only talks to these traits; a durable backend slots in
//! behind them without touching the engine. The in-memory variants are the
//! default and what the tests run against.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::stub::types::StubRule;
use crate::traffic::types::TrafficEvent;

/// Rules are filed per session; global rules live under the empty
/// session key so backends keyed by (session, rule) can hold them too.
pub trait StubRepository: Send + Sync {
    /// Inserts or overwrites by rule id.
    fn save(&self, rule: &StubRule);
    fn get(&self, session_id: &str, rule_id: &str) -> Option<StubRule>;
    fn list_by_session(&self, session_id: &str) -> Vec<StubRule>;
    fn delete(&self, session_id: &str, rule_id: &str) -> bool;
    /// Cross-session lookup, for deletion without session context.
    fn find_by_rule_id(&self, rule_id: &str) -> Option<StubRule>;
    /// Rules still worth reloading into the store: not exhausted, not past
    /// their TTL deadline.
    fn get_all_active(&self) -> Vec<StubRule>;
}

/// The session key a rule is filed under.
pub fn session_key(rule: &StubRule) -> &str {
    rule.session_id.as_deref().unwrap_or("")
}

pub trait TrafficRepository: Send + Sync {
    /// Returns `false` when the backend could not persist the event.
    fn save(&self, event: &TrafficEvent) -> bool;
    fn get(&self, event_id: &str) -> Option<TrafficEvent>;
    /// Newest first, capped at `limit`.
    fn list_by_session(&self, session_id: &str, limit: usize) -> Vec<TrafficEvent>;
    fn clear(&self) -> usize;
}

#[derive(Default)]
pub struct InMemoryStubRepository {
    rules: RwLock<HashMap<String, StubRule>>,
}

impl InMemoryStubRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StubRepository for InMemoryStubRepository {
    fn save(&self, rule: &StubRule) {
        self.rules.write().insert(rule.id.clone(), rule.clone());
    }

    fn get(&self, session_id: &str, rule_id: &str) -> Option<StubRule> {
        self.rules
            .read()
            .get(rule_id)
            .filter(|rule| session_key(rule) == session_id)
            .cloned()
    }

    fn list_by_session(&self, session_id: &str) -> Vec<StubRule> {
        self.rules
            .read()
            .values()
            .filter(|rule| rule.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect()
    }

    fn delete(&self, session_id: &str, rule_id: &str) -> bool {
        let mut rules = self.rules.write();
        if rules
            .get(rule_id)
            .is_some_and(|rule| session_key(rule) == session_id)
        {
            rules.remove(rule_id).is_some()
        } else {
            false
        }
    }

    fn find_by_rule_id(&self, rule_id: &str) -> Option<StubRule> {
        self.rules.read().get(rule_id).cloned()
    }

    fn get_all_active(&self) -> Vec<StubRule> {
        let now = Utc::now().timestamp_millis();
        self.rules
            .read()
            .values()
            .filter(|rule| match &rule.ephemeral {
                None => true,
                Some(ephemeral) => {
                    ephemeral.uses_remaining != Some(0)
                        && !matches!(ephemeral.expires_at, Some(at) if at < now)
                }
            })
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct InMemoryTrafficRepository {
    events: RwLock<Vec<TrafficEvent>>,
}

impl InMemoryTrafficRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrafficRepository for InMemoryTrafficRepository {
    fn save(&self, event: &TrafficEvent) -> bool {
        self.events.write().push(event.clone());
        true
    }

    fn get(&self, event_id: &str) -> Option<TrafficEvent> {
        self.events
            .read()
            .iter()
            .find(|event| event.id == event_id)
            .cloned()
    }

    fn list_by_session(&self, session_id: &str, limit: usize) -> Vec<TrafficEvent> {
        self.events
            .read()
            .iter()
            .rev()
            .filter(|event| event.session_id == session_id)
            .take(limit)
            .cloned()
            .collect()
    }

    fn clear(&self) -> usize {
        let mut events = self.events.write();
        let count = events.len();
        events.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use super::*;
    use crate::stub::types::{
        CreateStubRequest, EphemeralSpec, MatchMethod, RequestMatcher, ResponseSpec, UrlMatch,
        UrlMatchKind,
    };

    fn rule(session: &str, ephemeral: Option<EphemeralSpec>) -> StubRule {
        let create = CreateStubRequest {
            request: RequestMatcher {
                method: MatchMethod::Any,
                url: UrlMatch {
                    kind: UrlMatchKind::Exact,
                    value: "/x".to_string(),
                },
                headers: StdHashMap::new(),
                body: None,
            },
            response: ResponseSpec {
                mode: Default::default(),
                status: 200,
                headers: StdHashMap::new(),
                body_json: None,
                body_text: Some("ok".to_string()),
                patch: None,
            },
            priority: None,
            ephemeral,
        };
        StubRule::from_create(create, Some(session.to_string()))
    }

    fn event(id: &str, session: &str) -> TrafficEvent {
        TrafficEvent {
            id: id.to_string(),
            session_id: session.to_string(),
            timestamp: 0,
            method: "GET".to_string(),
            path: "/x".to_string(),
            query: StdHashMap::new(),
            request_headers: StdHashMap::new(),
            request_body: None,
            response_status: 200,
            response_headers: StdHashMap::new(),
            response_body: None,
            stubbed: false,
            matched_stub_id: None,
            duration_ms: 1,
            target_service: Some("orders".to_string()),
        }
    }

    #[test]
    fn active_listing_skips_spent_and_expired_rules() {
        let repo = InMemoryStubRepository::new();
        repo.save(&rule("s1", None));
        let mut spent = rule("s1", Some(EphemeralSpec { uses: Some(1), ttl_ms: None }));
        spent.ephemeral.as_mut().unwrap().uses_remaining = Some(0);
        repo.save(&spent);
        repo.save(&rule("s1", Some(EphemeralSpec { uses: None, ttl_ms: Some(-10) })));

        assert_eq!(repo.list_by_session("s1").len(), 3);
        assert_eq!(repo.get_all_active().len(), 1);
    }

    #[test]
    fn stub_lookups_are_session_scoped() {
        let repo = InMemoryStubRepository::new();
        let scoped = rule("s1", None);
        repo.save(&scoped);
        let global = StubRule::from_create(
            CreateStubRequest {
                request: scoped.request.clone(),
                response: scoped.response.clone(),
                priority: None,
                ephemeral: None,
            },
            None,
        );
        repo.save(&global);

        assert!(repo.get("s1", &scoped.id).is_some());
        assert!(repo.get("s2", &scoped.id).is_none());
        assert!(!repo.delete("s2", &scoped.id));
        assert!(repo.delete("s1", &scoped.id));
        assert!(repo.find_by_rule_id(&scoped.id).is_none());

        // Global rules are filed under the empty session key.
        let found = repo.find_by_rule_id(&global.id).unwrap();
        assert_eq!(found.session_id, None);
        assert!(repo.delete(session_key(&found), &global.id));
    }

    #[test]
    fn traffic_listing_is_newest_first_and_capped() {
        let repo = InMemoryTrafficRepository::new();
        for i in 0..5 {
            repo.save(&event(&format!("e{i}"), "s1"));
        }
        repo.save(&event("other", "s2"));

        let listed = repo.list_by_session("s1", 3);
        let ids: Vec<&str> = listed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e4", "e3", "e2"]);
        assert_eq!(repo.clear(), 6);
        assert!(repo.get("e4").is_none());
    }
}
