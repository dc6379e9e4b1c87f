//! In-memory stub store: priority-ordered matching plus the ephemeral
//! use/TTL lifecycle.
//!
//! Each rule is stored as an immutable snapshot with its compiled matcher;
//! the only mutable piece is the remaining-use counter, an atomic updated
//! by compare-and-swap so concurrent serves never double-decrement and the
//! rule is removed from the store exactly once.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::gateway::InboundRequest;
use crate::stub::predicates::{CompileError, CompiledRequestMatcher};
use crate::stub::types::{Ephemeral, StubRule};

/// Sentinel for "no use limit" in the atomic counter.
const USES_UNSET: i64 = -1;

pub struct StoredRule {
    rule: StubRule,
    compiled: CompiledRequestMatcher,
    /// Remaining uses, or [`USES_UNSET`].
    uses: AtomicI64,
    /// Insertion sequence, the priority tie-breaker.
    seq: u64,
}

impl StoredRule {
    pub fn id(&self) -> &str {
        &self.rule.id
    }

    pub fn rule(&self) -> &StubRule {
        &self.rule
    }

    pub fn uses_remaining(&self) -> Option<u32> {
        match self.uses.load(Ordering::SeqCst) {
            USES_UNSET => None,
            n => Some(n.max(0) as u32),
        }
    }

    /// The stored rule with the live use counter folded back in.
    pub fn snapshot(&self) -> StubRule {
        let mut rule = self.rule.clone();
        let uses = self.uses_remaining();
        if uses.is_some() || rule.ephemeral.is_some() {
            let ephemeral = rule.ephemeral.get_or_insert_with(Ephemeral::default);
            ephemeral.uses_remaining = uses;
        }
        rule
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        matches!(
            self.rule.ephemeral.as_ref().and_then(|e| e.expires_at),
            Some(at) if at < now_ms
        )
    }

    /// A dead rule never matches, even while still physically present.
    fn is_alive(&self, now_ms: i64) -> bool {
        self.uses.load(Ordering::SeqCst) != 0 && !self.is_expired(now_ms)
    }

    fn visible_to(&self, session_id: Option<&str>) -> bool {
        match &self.rule.session_id {
            None => true,
            Some(owner) => session_id == Some(owner.as_str()),
        }
    }
}

/// Outcome of the post-serve lifecycle update for a matched rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// No use limit on the rule; nothing changed.
    Untouched,
    /// Use counter decremented; this many uses remain.
    Decremented(u32),
    /// Counter reached zero; the rule has been removed.
    Exhausted,
    /// TTL deadline passed; the rule has been removed.
    Expired,
    /// The rule was already gone.
    Missing,
}

#[derive(Default)]
pub struct StubStore {
    rules: RwLock<Vec<Arc<StoredRule>>>,
    next_seq: AtomicU64,
}

impl StubStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and appends the rule. No dedup by content, only by id:
    /// inserting an id that already exists replaces the old entry.
    pub fn insert(&self, rule: StubRule) -> Result<Arc<StoredRule>, CompileError> {
        let compiled = CompiledRequestMatcher::compile(&rule.request)?;
        let uses = rule
            .ephemeral
            .as_ref()
            .and_then(|e| e.uses_remaining)
            .map_or(USES_UNSET, i64::from);
        let stored = Arc::new(StoredRule {
            rule,
            compiled,
            uses: AtomicI64::new(uses),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        });
        let mut rules = self.rules.write();
        rules.retain(|existing| existing.rule.id != stored.rule.id);
        rules.push(Arc::clone(&stored));
        Ok(stored)
    }

    /// Lowest priority wins; ties break on insertion order. Rules scoped
    /// to another session and rules past their use/TTL budget are skipped.
    pub fn match_request(&self, request: &InboundRequest, now_ms: i64) -> Option<Arc<StoredRule>> {
        let session_id = request.session_id();
        self.rules
            .read()
            .iter()
            .filter(|stored| stored.visible_to(session_id) && stored.is_alive(now_ms))
            .filter(|stored| stored.compiled.matches(request))
            .min_by_key(|stored| (stored.rule.priority, stored.seq))
            .cloned()
    }

    /// Post-serve lifecycle step for a rule that just answered a request.
    /// TTL is checked before the use counter, mirroring the match-side
    /// validity order.
    pub fn on_served(&self, rule_id: &str, now_ms: i64) -> ServeOutcome {
        let Some(stored) = self.get(rule_id) else {
            return ServeOutcome::Missing;
        };
        if stored.is_expired(now_ms) {
            self.remove(rule_id);
            return ServeOutcome::Expired;
        }
        let updated = stored
            .uses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |uses| {
                if uses > 0 {
                    Some(uses - 1)
                } else {
                    None
                }
            });
        match updated {
            Ok(previous) if previous == 1 => {
                // This caller performed the 1 -> 0 transition and owns removal.
                self.remove(rule_id);
                debug!(rule_id, "ephemeral rule exhausted");
                ServeOutcome::Exhausted
            }
            Ok(previous) => ServeOutcome::Decremented((previous - 1) as u32),
            Err(USES_UNSET) => ServeOutcome::Untouched,
            Err(_) => ServeOutcome::Exhausted,
        }
    }

    pub fn get(&self, rule_id: &str) -> Option<Arc<StoredRule>> {
        self.rules
            .read()
            .iter()
            .find(|stored| stored.rule.id == rule_id)
            .cloned()
    }

    pub fn remove(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|stored| stored.rule.id != rule_id);
        rules.len() != before
    }

    /// Snapshots, optionally restricted to one session's rules.
    pub fn list(&self, session_id: Option<&str>) -> Vec<StubRule> {
        self.rules
            .read()
            .iter()
            .filter(|stored| match session_id {
                Some(id) => stored.rule.session_id.as_deref() == Some(id),
                None => true,
            })
            .map(|stored| stored.snapshot())
            .collect()
    }

    /// Bulk removal of dead rules. Returns the ids that were dropped so
    /// callers can mirror the deletion into persistence.
    pub fn prune_now(&self, now_ms: i64) -> Vec<String> {
        let mut rules = self.rules.write();
        let mut removed = Vec::new();
        rules.retain(|stored| {
            if stored.is_alive(now_ms) {
                true
            } else {
                removed.push(stored.rule.id.clone());
                false
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}
