//! Penalty escalation for repeat offenders.
//!
//! Each consecutive violation doubles the backoff multiplier, shrinking the
//! effective quota and lengthening the advertised retry delay, up to a
//! configured cap. Violations decay after a quiet period so offenders
//! self-heal without an external reset.

use crate::config::BackoffConfig;

/// Seconds without a new violation after which the count resets to zero.
pub const VIOLATION_DECAY_SECS: i64 = 300;

/// TTL on the shared-store violation counter, in seconds.
pub const VIOLATION_TTL_SECS: u64 = 3600;

/// Backoff policy shared by both counter backends.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Whether penalty escalation is applied at all
    pub enabled: bool,
    /// Cap on the exponential multiplier
    pub max_multiplier: u32,
}

impl BackoffPolicy {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_multiplier: config.max_multiplier.max(1),
        }
    }

    /// Multiplier for a given violation count: `min(2^violations, cap)`.
    pub fn multiplier(&self, violations: u32) -> u32 {
        if !self.enabled || violations == 0 {
            return 1;
        }
        1u32.checked_shl(violations)
            .map(|m| m.min(self.max_multiplier))
            .unwrap_or(self.max_multiplier)
    }

    /// Quota remaining once the multiplier is applied; never below one so a
    /// penalized client can still probe for recovery.
    pub fn effective_limit(&self, limit: u32, violations: u32) -> u32 {
        (limit / self.multiplier(violations)).max(1)
    }

    /// Advertised retry delay for a denial at the given violation count.
    pub fn retry_after_secs(&self, window_secs: u64, violations: u32) -> u64 {
        window_secs * self.multiplier(violations) as u64
    }
}
