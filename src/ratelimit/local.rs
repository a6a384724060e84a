//! In-process sliding-window counter.
//!
//! Serves as the fallback when the shared store is unreachable, and as the
//! only counter when no shared store is configured. State is process-private:
//! in a multi-instance deployment each instance counts independently, which
//! is an accepted approximation surfaced through the result's degraded flag.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use uuid::Uuid;

use super::backend::{assemble_result, RateLimitBackend, WindowCheck};
use super::backoff::{BackoffPolicy, VIOLATION_DECAY_SECS};
use super::rules::RateLimitRule;
use crate::error::Result;

/// Observed outcome of a counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Success,
    Failure,
}

/// One counted request inside the window.
#[derive(Debug, Clone)]
struct WindowEntry {
    ts_ms: i64,
    token: String,
    outcome: Outcome,
}

/// Per-client window state, owned exclusively by [`LocalSlidingWindow`] and
/// created lazily on first request from a key.
#[derive(Debug)]
struct ClientState {
    entries: VecDeque<WindowEntry>,
    violation_count: u32,
    last_violation_at: Option<i64>,
    last_seen: i64,
}

impl ClientState {
    fn new(now_ms: i64) -> Self {
        Self {
            entries: VecDeque::new(),
            violation_count: 0,
            last_violation_at: None,
            last_seen: now_ms,
        }
    }

    /// Reset the violation count once the last violation has aged out.
    fn decay_violations(&mut self, now_ms: i64) {
        if let Some(last) = self.last_violation_at {
            if now_ms - last > VIOLATION_DECAY_SECS * 1000 {
                self.violation_count = 0;
                self.last_violation_at = None;
            }
        }
    }
}

/// In-process sliding-window counter keyed by client.
///
/// The map's entry guard serializes concurrent mutation of the same key
/// within this process.
pub struct LocalSlidingWindow {
    clients: DashMap<String, ClientState>,
    policy: BackoffPolicy,
    degraded: bool,
}

impl LocalSlidingWindow {
    /// Create a local counter.
    ///
    /// `degraded` marks results from this counter as a per-instance
    /// approximation; set when a shared store is configured and this counter
    /// stands in for it.
    pub fn new(policy: BackoffPolicy, degraded: bool) -> Self {
        Self {
            clients: DashMap::new(),
            policy,
            degraded,
        }
    }

    /// Evaluate and update the window for `key`, using a single clock
    /// reading for pruning and insertion.
    pub fn check_at(&self, key: &str, rule: &RateLimitRule, now: DateTime<Utc>) -> WindowCheck {
        let now_ms = now.timestamp_millis();
        let window_ms = rule.window_secs as i64 * 1000;

        let mut state = self
            .clients
            .entry(key.to_string())
            .or_insert_with(|| ClientState::new(now_ms));
        state.last_seen = now_ms;
        state.decay_violations(now_ms);

        while state
            .entries
            .front()
            .is_some_and(|e| e.ts_ms <= now_ms - window_ms)
        {
            state.entries.pop_front();
        }

        let count = state.entries.len() as u64;
        let violations = state.violation_count;
        let multiplier = self.policy.multiplier(violations);
        let effective = self.policy.effective_limit(rule.requests_per_window, violations);

        if count >= effective as u64 {
            state.violation_count += 1;
            state.last_violation_at = Some(now_ms);
            return WindowCheck {
                result: assemble_result(rule, false, count, multiplier, now, self.degraded),
                entry: None,
            };
        }

        let token = format!("{}:{}", now_ms, Uuid::new_v4());
        state.entries.push_back(WindowEntry {
            ts_ms: now_ms,
            token: token.clone(),
            outcome: Outcome::Pending,
        });
        if state.violation_count > 0 {
            state.violation_count = 0;
            state.last_violation_at = None;
        }

        WindowCheck {
            result: assemble_result(rule, true, count, multiplier, now, self.degraded),
            entry: Some(token),
        }
    }

    fn discard_entry(&self, key: &str, entry: &str) {
        if let Some(mut state) = self.clients.get_mut(key) {
            if let Some(pos) = state.entries.iter().position(|e| e.token == entry) {
                state.entries.remove(pos);
            }
        }
    }

    fn mark_entry(&self, key: &str, entry: &str, success: bool) {
        if let Some(mut state) = self.clients.get_mut(key) {
            if let Some(found) = state.entries.iter_mut().find(|e| e.token == entry) {
                found.outcome = if success {
                    Outcome::Success
                } else {
                    Outcome::Failure
                };
            }
        }
    }

    /// Purge client state idle beyond `retention_secs` with no remaining
    /// violation penalty. Returns the number of clients dropped.
    pub fn sweep(&self, now: DateTime<Utc>, retention_secs: u64) -> usize {
        let now_ms = now.timestamp_millis();
        let horizon = now_ms - retention_secs as i64 * 1000;
        let before = self.clients.len();

        self.clients.retain(|_, state| {
            state.decay_violations(now_ms);
            state.last_seen > horizon || state.violation_count > 0
        });

        before - self.clients.len()
    }

    /// Number of clients with live state.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Whether any state exists for a key.
    pub fn has_state(&self, key: &str) -> bool {
        self.clients.contains_key(key)
    }
}

#[async_trait]
impl RateLimitBackend for LocalSlidingWindow {
    async fn check(
        &self,
        key: &str,
        rule: &RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<WindowCheck> {
        Ok(self.check_at(key, rule, now))
    }

    async fn remove_entry(&self, key: &str, entry: &str) -> Result<()> {
        self.discard_entry(key, entry);
        Ok(())
    }

    async fn record_outcome(&self, key: &str, entry: &str, success: bool) -> Result<()> {
        self.mark_entry(key, entry, success);
        Ok(())
    }
}
