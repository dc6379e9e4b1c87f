//! Data model for stub rules: the request matcher, the response spec, and
//! the optional ephemeral lifecycle attached to a rule.
//!
//! All wire types serialize camelCase. Matcher discriminators ride in a
//! `type` field so the JSON reads `{"type": "EXACT", "value": "/orders"}`.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::names::priorities;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StubRule {
    pub id: String,
    /// Owning session. `None` marks a system/global rule visible to all
    /// sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Lower value wins; ties break on insertion order.
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub request: RequestMatcher,
    pub response: ResponseSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<Ephemeral>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn default_priority() -> i32 {
    priorities::DEFAULT
}

/// Use/TTL budget of a rule. A rule with neither limit set is permanent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ephemeral {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses_remaining: Option<u32>,
    /// Epoch milliseconds. The rule stops matching strictly after this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMatcher {
    #[serde(default)]
    pub method: MatchMethod,
    pub url: UrlMatch,
    /// Header name -> matcher. Names are matched case-insensitively.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, ValueMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BodyMatch>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    #[default]
    Any,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::Get => "GET",
            MatchMethod::Post => "POST",
            MatchMethod::Put => "PUT",
            MatchMethod::Patch => "PATCH",
            MatchMethod::Delete => "DELETE",
            MatchMethod::Head => "HEAD",
            MatchMethod::Options => "OPTIONS",
            MatchMethod::Any => "ANY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlMatch {
    #[serde(rename = "type")]
    pub kind: UrlMatchKind,
    /// Exact path-and-query, or a regex for `LOOSENED`.
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrlMatchKind {
    Exact,
    /// Regex, anchored over the full path-and-query.
    Loosened,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueMatch {
    #[serde(rename = "type")]
    pub kind: ValueMatchKind,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueMatchKind {
    EqualTo,
    /// Regex over the full header value.
    Matches,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyMatch {
    #[serde(default)]
    pub mode: BodyMode,
    /// All predicates must hold for the body to match.
    #[serde(default)]
    pub matchers: Vec<BodyPredicate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BodyMode {
    #[default]
    Json,
    Text,
}

/// One body predicate. `EQUAL_TO_JSON` carries its document in `value`;
/// the other kinds carry a JSONPath / regex / substring in `expr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyPredicate {
    #[serde(rename = "type")]
    pub kind: BodyPredicateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_array_order: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_extra_elements: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BodyPredicateKind {
    EqualToJson,
    JsonPath,
    Matches,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSpec {
    #[serde(default)]
    pub mode: ResponseMode,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
    /// Only meaningful in `PATCH_UPSTREAM` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<PatchSpec>,
}

fn default_status() -> u16 {
    200
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseMode {
    #[default]
    Static,
    /// Proxy to the resolved origin, then rewrite the JSON body.
    PatchUpstream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSpec {
    /// RFC 7386 merge-patch document applied to a JSON upstream body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<Value>,
    /// JSON-Patch operation list. Accepted but not executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ops: Option<Vec<Value>>,
}

/// Payload for stub creation through the admin surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStubRequest {
    pub request: RequestMatcher,
    pub response: ResponseSpec,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub ephemeral: Option<EphemeralSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralSpec {
    #[serde(default)]
    pub uses: Option<u32>,
    /// Lifetime relative to creation; converted to an absolute deadline.
    #[serde(default)]
    pub ttl_ms: Option<i64>,
}

impl StubRule {
    pub fn from_create(create: CreateStubRequest, session_id: Option<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        let ephemeral = create.ephemeral.map(|spec| Ephemeral {
            uses_remaining: spec.uses,
            expires_at: spec.ttl_ms.map(|ttl| now + ttl),
        });
        StubRule {
            id: Uuid::new_v4().to_string(),
            session_id,
            priority: create.priority.unwrap_or(priorities::DEFAULT),
            request: create.request,
            response: create.response,
            ephemeral,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_rule() {
        let json = r#"{
            "request": {
                "method": "GET",
                "url": {"type": "EXACT", "value": "/orders/42"},
                "headers": {"Accept": {"type": "CONTAINS", "value": "json"}}
            },
            "response": {"status": 201, "bodyJson": {"ok": true}},
            "ephemeral": {"uses": 3, "ttlMs": 60000}
        }"#;
        let create: CreateStubRequest = serde_json::from_str(json).unwrap();
        assert_eq!(create.request.method, MatchMethod::Get);
        assert_eq!(create.request.url.kind, UrlMatchKind::Exact);
        assert_eq!(create.response.status, 201);
        assert_eq!(create.ephemeral.as_ref().unwrap().uses, Some(3));

        let rule = StubRule::from_create(create, Some("s1".into()));
        assert_eq!(rule.priority, priorities::DEFAULT);
        let ephemeral = rule.ephemeral.unwrap();
        assert_eq!(ephemeral.uses_remaining, Some(3));
        assert!(ephemeral.expires_at.unwrap() > rule.created_at);
    }

    #[test]
    fn defaults_apply_when_fields_are_omitted() {
        let json = r#"{
            "request": {"url": {"type": "LOOSENED", "value": "/orders/.*"}},
            "response": {}
        }"#;
        let create: CreateStubRequest = serde_json::from_str(json).unwrap();
        assert_eq!(create.request.method, MatchMethod::Any);
        assert_eq!(create.response.status, 200);
        assert_eq!(create.response.mode, ResponseMode::Static);

        let rule = StubRule::from_create(create, None);
        assert!(rule.session_id.is_none());
        assert!(rule.ephemeral.is_none());
    }

    #[test]
    fn rule_round_trips_through_json() {
        let json = r#"{
            "request": {"url": {"type": "EXACT", "value": "/a"}},
            "response": {"mode": "PATCH_UPSTREAM", "patch": {"merge": {"flag": true}}}
        }"#;
        let create: CreateStubRequest = serde_json::from_str(json).unwrap();
        let rule = StubRule::from_create(create, Some("s1".into()));
        let encoded = serde_json::to_string(&rule).unwrap();
        let decoded: StubRule = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, rule.id);
        assert_eq!(decoded.response.mode, ResponseMode::PatchUpstream);
        assert!(encoded.contains("\"sessionId\":\"s1\""));
    }
}
