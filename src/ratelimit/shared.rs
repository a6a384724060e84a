//! Shared-store sliding-window counter backed by Redis.
//!
//! Every check runs as one Lua script invocation, so pruning, counting,
//! violation lookup and the record-or-penalize branch are a single atomic
//! round trip. Concurrent requests for the same key therefore see
//! serializable read-modify-write semantics across all process instances.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{assemble_result, RateLimitBackend, WindowCheck};
use super::backoff::{BackoffPolicy, VIOLATION_TTL_SECS};
use super::rules::RateLimitRule;
use crate::config::StoreConfig;
use crate::error::{FloodgateError, Result};

/// Delay between recovery probes once the store is marked unavailable.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Atomic window check.
///
/// KEYS: entries zset, violations counter.
/// ARGV: now_ms, window_ms, limit, backoff_enabled, max_multiplier,
/// violation_ttl_secs, entry member.
/// Returns {allowed, count, multiplier}.
const CHECK_SCRIPT: &str = r#"
local entries_key = KEYS[1]
local violations_key = KEYS[2]
local now_ms = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local backoff_enabled = tonumber(ARGV[4])
local max_multiplier = tonumber(ARGV[5])
local violation_ttl = tonumber(ARGV[6])
local member = ARGV[7]

redis.call('ZREMRANGEBYSCORE', entries_key, 0, now_ms - window_ms)
local count = redis.call('ZCARD', entries_key)
local violations = tonumber(redis.call('GET', violations_key) or '0')

local multiplier = 1
if backoff_enabled == 1 and violations > 0 then
    multiplier = math.min(2 ^ violations, max_multiplier)
end
local effective = math.max(1, math.floor(limit / multiplier))

if count >= effective then
    redis.call('INCR', violations_key)
    redis.call('EXPIRE', violations_key, violation_ttl)
    return {0, count, multiplier}
end

redis.call('ZADD', entries_key, now_ms, member)
redis.call('PEXPIRE', entries_key, window_ms)
if violations > 0 then
    redis.call('DEL', violations_key)
end
return {1, count, multiplier}
"#;

/// Redis-backed sliding-window counter shared across process instances.
pub struct SharedSlidingWindow {
    client: redis::Client,
    conn: Arc<RwLock<MultiplexedConnection>>,
    script: Script,
    key_prefix: String,
    timeout: Duration,
    policy: BackoffPolicy,
    healthy: Arc<RwLock<bool>>,
    probe_gate: Arc<Semaphore>,
}

impl SharedSlidingWindow {
    /// Connect to the configured store and probe it.
    ///
    /// Returns `None` when no URL is configured or the store is unreachable,
    /// leaving the caller on the in-process counter.
    pub async fn connect(config: &StoreConfig, policy: BackoffPolicy) -> Option<Self> {
        let url = config.redis_url.as_deref()?;

        let client = match redis::Client::open(url) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Invalid store URL, using in-process counting");
                return None;
            }
        };

        match client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                info!(url = %url, "Connected to shared counter store");
                Some(Self {
                    client,
                    conn: Arc::new(RwLock::new(conn)),
                    script: Script::new(CHECK_SCRIPT),
                    key_prefix: config.key_prefix.clone(),
                    timeout: Duration::from_millis(config.timeout_ms),
                    policy,
                    healthy: Arc::new(RwLock::new(true)),
                    probe_gate: Arc::new(Semaphore::new(1)),
                })
            }
            Err(e) => {
                warn!(error = %e, "Shared store unreachable, using in-process counting");
                None
            }
        }
    }

    /// Whether the store is currently considered reachable.
    pub fn is_healthy(&self) -> bool {
        *self.healthy.read()
    }

    fn entries_key(&self, key: &str) -> String {
        format!("{}entries:{}", self.key_prefix, key)
    }

    fn violations_key(&self, key: &str) -> String {
        format!("{}violations:{}", self.key_prefix, key)
    }

    /// Mark the store unavailable and start a single recovery probe loop.
    fn mark_unhealthy(&self) {
        *self.healthy.write() = false;

        let Ok(permit) = self.probe_gate.clone().try_acquire_owned() else {
            return;
        };
        let client = self.client.clone();
        let conn = self.conn.clone();
        let healthy = self.healthy.clone();

        tokio::spawn(async move {
            let _permit = permit;
            loop {
                tokio::time::sleep(PROBE_INTERVAL).await;
                if let Ok(mut fresh) = client.get_multiplexed_async_connection().await {
                    let pong: std::result::Result<String, _> =
                        redis::cmd("PING").query_async(&mut fresh).await;
                    if pong.is_ok() {
                        *conn.write() = fresh;
                        *healthy.write() = true;
                        info!("Shared counter store recovered");
                        return;
                    }
                }
                debug!("Shared counter store still unavailable");
            }
        });
    }

    fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> impl std::future::Future<Output = Result<T>> {
        let timeout = self.timeout;
        async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(FloodgateError::StoreTimeout(timeout.as_millis() as u64)),
            }
        }
    }
}

/// Decode the script reply into (allowed, count, multiplier).
fn parse_reply(reply: (i64, i64, i64)) -> (bool, u64, u32) {
    let (allowed, count, multiplier) = reply;
    (allowed == 1, count.max(0) as u64, multiplier.max(1) as u32)
}

#[async_trait]
impl RateLimitBackend for SharedSlidingWindow {
    async fn check(
        &self,
        key: &str,
        rule: &RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<WindowCheck> {
        if !self.is_healthy() {
            return Err(FloodgateError::StoreUnavailable);
        }

        let now_ms = now.timestamp_millis();
        let member = format!("{}:{}", now_ms, Uuid::new_v4());
        let mut conn = self.conn.read().clone();

        let invocation = async {
            let reply: redis::RedisResult<(i64, i64, i64)> = self
                .script
                .key(self.entries_key(key))
                .key(self.violations_key(key))
                .arg(now_ms)
                .arg(rule.window_secs as i64 * 1000)
                .arg(rule.requests_per_window)
                .arg(if self.policy.enabled { 1 } else { 0 })
                .arg(self.policy.max_multiplier)
                .arg(VIOLATION_TTL_SECS)
                .arg(&member)
                .invoke_async(&mut conn)
                .await;
            reply
        };

        let reply = match self.bounded(invocation).await {
            Ok(reply) => reply,
            Err(e) => {
                self.mark_unhealthy();
                return Err(e);
            }
        };

        let (allowed, count, multiplier) = parse_reply(reply);
        Ok(WindowCheck {
            result: assemble_result(rule, allowed, count, multiplier, now, false),
            entry: allowed.then_some(member),
        })
    }

    async fn remove_entry(&self, key: &str, entry: &str) -> Result<()> {
        if !self.is_healthy() {
            return Err(FloodgateError::StoreUnavailable);
        }

        let mut conn = self.conn.read().clone();
        let entries_key = self.entries_key(key);
        let removal = async {
            let removed: redis::RedisResult<i64> = redis::cmd("ZREM")
                .arg(&entries_key)
                .arg(entry)
                .query_async(&mut conn)
                .await;
            removed
        };

        match self.bounded(removal).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.mark_unhealthy();
                Err(e)
            }
        }
    }
}
