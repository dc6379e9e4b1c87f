//! Captured traffic events and sensitive-header masking.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Header names whose values are replaced before an event leaves the
/// handler. Lowercase; request header maps are lowercased at ingress.
pub const MASKED_HEADERS: [&str; 4] = ["authorization", "cookie", "set-cookie", "x-api-key"];

const MASK: &str = "*****";

/// One proxied exchange, recorded after the response was produced.
/// Only requests carrying a session header produce events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficEvent {
    pub id: String,
    pub session_id: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub request_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    pub response_status: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub response_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// True when a stub rule answered. A hit on the proxy-fallback
    /// priority does not count as stubbed.
    pub stubbed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_stub_id: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_service: Option<String>,
}

/// Replaces credential-bearing header values in place.
pub fn mask_sensitive(headers: &mut HashMap<String, String>) {
    for (name, value) in headers.iter_mut() {
        if MASKED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            *value = MASK.to_string();
        }
    }
}
