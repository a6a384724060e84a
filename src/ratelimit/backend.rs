//! Counter backend abstraction over the shared-store and in-process
//! implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::rules::RateLimitRule;
use crate::error::Result;

/// Outcome of a sliding-window check.
///
/// Carries no identity information and is safe to echo in response headers.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Effective limit for this window, after any backoff penalty
    pub limit: u32,
    /// Requests remaining in the window
    pub remaining: u32,
    /// Epoch seconds at which the window resets
    pub reset_at: i64,
    /// Seconds the client should wait before retrying, on denial
    pub retry_after_secs: Option<u64>,
    /// Active backoff multiplier, when a penalty is in effect
    pub backoff_multiplier: Option<u32>,
    /// True when the decision came from the per-instance fallback
    pub degraded: bool,
}

/// A window check plus the token of the entry it recorded, if any.
#[derive(Debug, Clone)]
pub struct WindowCheck {
    pub result: RateLimitResult,
    /// Token of the recorded entry; present only on allow
    pub entry: Option<String>,
}

/// Trait for sliding-window counter backends.
///
/// Abstracts over the shared-store counter and the in-process fallback so
/// the decision assembler can work with either.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Evaluate and update the sliding window for `key` under `rule`.
    ///
    /// The single `now` reading governs both window pruning and entry
    /// insertion.
    async fn check(
        &self,
        key: &str,
        rule: &RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<WindowCheck>;

    /// Discharge a previously counted entry, used when a rule skips
    /// successful or failed requests.
    async fn remove_entry(&self, key: &str, entry: &str) -> Result<()>;

    /// Record the observed outcome on a retained entry.
    ///
    /// Backends that keep entries as opaque placeholders may ignore this.
    async fn record_outcome(&self, _key: &str, _entry: &str, _success: bool) -> Result<()> {
        Ok(())
    }
}

/// Assemble a [`RateLimitResult`] from the raw window state.
///
/// `count` is the number of entries observed before this request was
/// recorded; `multiplier` is the backoff multiplier applied to the quota.
pub(crate) fn assemble_result(
    rule: &RateLimitRule,
    allowed: bool,
    count: u64,
    multiplier: u32,
    now: DateTime<Utc>,
    degraded: bool,
) -> RateLimitResult {
    let effective = (rule.requests_per_window / multiplier).max(1);
    let remaining = if allowed {
        effective.saturating_sub(count as u32 + 1)
    } else {
        0
    };

    RateLimitResult {
        allowed,
        limit: effective,
        remaining,
        reset_at: now.timestamp() + rule.window_secs as i64,
        retry_after_secs: (!allowed).then(|| rule.window_secs * multiplier as u64),
        backoff_multiplier: (multiplier > 1).then_some(multiplier),
        degraded,
    }
}
