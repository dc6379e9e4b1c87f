//! Test sessions: the unit of isolation for stub rules and captured traffic.
//!
//! A session is created before a test run, referenced by every proxied
//! request through the session header, and closed (or left to expire) when
//! the run ends. The store keeps sessions in memory behind a `RwLock`;
//! persistent backends implement the same trait.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Closed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub status: SessionStatus,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds; `None` means the session never expires on its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl Session {
    pub fn new(id: Option<String>, name: Option<String>, owner: Option<String>, ttl_ms: Option<i64>) -> Self {
        let now = Utc::now().timestamp_millis();
        Session {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name,
            owner,
            status: SessionStatus::Active,
            created_at: now,
            expires_at: ttl_ms.map(|ttl| now + ttl),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(at) if at < now_ms)
    }

    /// Status with expiry folded in. A stored `Active` session whose
    /// deadline has passed reports `Expired` without a separate sweeper.
    pub fn effective_status(&self, now_ms: i64) -> SessionStatus {
        if self.status == SessionStatus::Active && self.is_expired(now_ms) {
            SessionStatus::Expired
        } else {
            self.status
        }
    }
}

pub trait SessionStore: Send + Sync {
    /// Inserts the session. Returns `false` if the id is already taken.
    fn create(&self, session: Session) -> bool;
    fn get(&self, id: &str) -> Option<Session>;
    /// Transitions an active session to `Closed`. Returns `false` if the
    /// session does not exist.
    fn close(&self, id: &str) -> bool;
    fn list(&self) -> Vec<Session>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn create(&self, session: Session) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return false;
        }
        sessions.insert(session.id.clone(), session);
        true
    }

    fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().get(id).cloned()
    }

    fn close(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(id) {
            Some(session) => {
                if session.status == SessionStatus::Active {
                    session.status = SessionStatus::Closed;
                }
                true
            }
            None => false,
        }
    }

    fn list(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }
}
