//! The rate limiting engine: decision assembly over rules, identity,
//! exemption and the counter backends.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::backend::{RateLimitBackend, RateLimitResult, WindowCheck};
use super::backoff::BackoffPolicy;
use super::exempt::ExemptionChecker;
use super::identity::{client_address, user_agent, ClientIdentifier, KeyGenerator, RoleResolver};
use super::local::LocalSlidingWindow;
use super::rules::{RateLimitRule, RuleTable};
use super::shared::SharedSlidingWindow;
use crate::audit::{SecurityEvent, SecurityEventSink, TracingEventSink};
use crate::config::{EngineConfig, SweepConfig};
use crate::error::{FloodgateError, Result};

/// Which backend produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterSource {
    Shared,
    Local,
}

/// Everything needed to discharge or annotate a counted entry once the
/// response outcome is known.
#[derive(Debug, Clone)]
struct SettleTicket {
    key: String,
    entry: String,
    source: CounterSource,
    skip_successful: bool,
    skip_failed: bool,
}

/// Outcome of evaluating one request.
///
/// The public [`RateLimitResult`] is safe to echo in headers; the ticket is
/// engine-internal state for [`RateLimitEngine::settle`].
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub result: RateLimitResult,
    ticket: Option<SettleTicket>,
}

/// The adaptive rate limiting engine.
///
/// Thread-safe; shared across request handlers behind an `Arc`.
pub struct RateLimitEngine {
    api_prefix: String,
    rules: RuleTable,
    identifier: ClientIdentifier,
    exemptions: ExemptionChecker,
    shared: Option<Arc<dyn RateLimitBackend>>,
    local: Arc<LocalSlidingWindow>,
    audit: Arc<dyn SecurityEventSink>,
    sweep: SweepConfig,
}

/// Builder wiring the non-serializable collaborators into the engine.
pub struct RateLimitEngineBuilder {
    config: EngineConfig,
    key_generator: Option<KeyGenerator>,
    role_resolver: Option<Arc<dyn RoleResolver>>,
    audit_sink: Option<Arc<dyn SecurityEventSink>>,
    shared_backend: Option<Arc<dyn RateLimitBackend>>,
}

impl RateLimitEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            key_generator: None,
            role_resolver: None,
            audit_sink: None,
            shared_backend: None,
        }
    }

    /// Override the built-in client key derivation.
    pub fn key_generator(mut self, generator: KeyGenerator) -> Self {
        self.key_generator = Some(generator);
        self
    }

    /// Wire the identity collaborator used for exemption checks.
    pub fn role_resolver(mut self, resolver: Arc<dyn RoleResolver>) -> Self {
        self.role_resolver = Some(resolver);
        self
    }

    /// Wire the audit sink; defaults to the tracing log.
    pub fn audit_sink(mut self, sink: Arc<dyn SecurityEventSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Use a caller-provided shared backend instead of probing the
    /// configured store.
    pub fn shared_backend(mut self, backend: Arc<dyn RateLimitBackend>) -> Self {
        self.shared_backend = Some(backend);
        self
    }

    /// Probe the shared store and assemble the engine.
    pub async fn build(self) -> Result<RateLimitEngine> {
        let policy = BackoffPolicy::new(&self.config.backoff);
        let rules = RuleTable::new(self.config.rules)?;

        let store_configured =
            self.config.store.redis_url.is_some() || self.shared_backend.is_some();
        let shared = match self.shared_backend {
            Some(backend) => Some(backend),
            None => SharedSlidingWindow::connect(&self.config.store, policy)
                .await
                .map(|backend| Arc::new(backend) as Arc<dyn RateLimitBackend>),
        };
        let local = Arc::new(LocalSlidingWindow::new(policy, store_configured));

        let mut identifier = ClientIdentifier::new(self.config.session_cookie);
        if let Some(generator) = self.key_generator {
            identifier = identifier.with_key_generator(generator);
        }

        let mut exemptions =
            ExemptionChecker::new(self.config.exempt_addresses, self.config.exempt_roles);
        if let Some(resolver) = self.role_resolver {
            exemptions = exemptions.with_resolver(resolver);
        }

        Ok(RateLimitEngine {
            api_prefix: self.config.api_prefix,
            rules,
            identifier,
            exemptions,
            shared,
            local,
            audit: self
                .audit_sink
                .unwrap_or_else(|| Arc::new(TracingEventSink)),
            sweep: self.config.sweep,
        })
    }
}

impl RateLimitEngine {
    /// Start building an engine from configuration.
    pub fn builder(config: EngineConfig) -> RateLimitEngineBuilder {
        RateLimitEngineBuilder::new(config)
    }

    /// Build an engine with default collaborators.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Evaluate one request.
    ///
    /// `None` means the request bypasses limiting entirely: the path is
    /// outside the API prefix, no rule matches and no default exists, or
    /// the caller is exempt.
    pub async fn evaluate(&self, path: &str, headers: &HeaderMap) -> Option<Evaluation> {
        self.evaluate_at(path, headers, Utc::now()).await
    }

    /// Evaluate with an explicit clock reading; the same reading governs
    /// window pruning and entry insertion.
    pub async fn evaluate_at(
        &self,
        path: &str,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Option<Evaluation> {
        if !path.starts_with(&self.api_prefix) {
            return None;
        }

        let rule = self.rules.resolve(path)?;

        let address = client_address(headers);
        if self
            .exemptions
            .is_exempt(&self.identifier, headers, &address)
            .await
        {
            trace!(path = %path, "Caller exempt from rate limiting");
            return None;
        }

        let key = self.identifier.identify(headers, path);
        let (check, source) = self.check_window(&key, &rule, now).await;

        counter!(
            "rate_limit_checks_total",
            "allowed" => if check.result.allowed { "true" } else { "false" },
            "backend" => match source {
                CounterSource::Shared => "shared",
                CounterSource::Local => "local",
            }
        )
        .increment(1);

        if !check.result.allowed {
            debug!(
                key = %key,
                path = %path,
                limit = check.result.limit,
                multiplier = check.result.backoff_multiplier.unwrap_or(1),
                "Rate limit exceeded"
            );
            counter!("rate_limit_denied_total", "path" => path.to_string()).increment(1);
            self.emit_denial(path, &rule, &check.result, &address, headers)
                .await;
        }

        let ticket = check.entry.map(|entry| SettleTicket {
            key,
            entry,
            source,
            skip_successful: rule.skip_successful,
            skip_failed: rule.skip_failed,
        });

        Some(Evaluation {
            result: check.result,
            ticket,
        })
    }

    /// Check the window against the shared backend, falling back to the
    /// in-process counter on any store failure.
    async fn check_window(
        &self,
        key: &str,
        rule: &RateLimitRule,
        now: DateTime<Utc>,
    ) -> (WindowCheck, CounterSource) {
        if let Some(shared) = &self.shared {
            match shared.check(key, rule, now).await {
                Ok(check) => return (check, CounterSource::Shared),
                Err(FloodgateError::StoreUnavailable) => {
                    trace!("Shared store marked unavailable, counting in-process");
                }
                Err(e) => {
                    warn!(error = %e, "Shared store check failed, counting in-process");
                }
            }
        }
        (self.local.check_at(key, rule, now), CounterSource::Local)
    }

    /// Settle a previously returned evaluation with the response outcome.
    ///
    /// Discharges the counted entry when the rule skips this outcome class;
    /// otherwise records the outcome on the entry.
    pub async fn settle(&self, evaluation: &Evaluation, success: bool) {
        let Some(ticket) = &evaluation.ticket else {
            return;
        };

        let backend: &dyn RateLimitBackend = match ticket.source {
            CounterSource::Shared => match &self.shared {
                Some(shared) => shared.as_ref(),
                None => return,
            },
            CounterSource::Local => self.local.as_ref(),
        };

        let discharge =
            (success && ticket.skip_successful) || (!success && ticket.skip_failed);
        let outcome = if discharge {
            backend.remove_entry(&ticket.key, &ticket.entry).await
        } else {
            backend
                .record_outcome(&ticket.key, &ticket.entry, success)
                .await
        };

        if let Err(e) = outcome {
            debug!(error = %e, "Failed to settle window entry");
        }
    }

    async fn emit_denial(
        &self,
        path: &str,
        rule: &RateLimitRule,
        result: &RateLimitResult,
        address: &str,
        headers: &HeaderMap,
    ) {
        let event = SecurityEvent::new(
            "rate_limit_exceeded",
            address,
            user_agent(headers),
            serde_json::json!({
                "endpoint": path,
                "limit": rule.requests_per_window,
                "window_secs": rule.window_secs,
                "backoff_multiplier": result.backoff_multiplier.unwrap_or(1),
            }),
        );

        if let Err(e) = self.audit.append(event).await {
            warn!(error = %e, "Failed to append security event");
        }
    }

    /// The in-process counter, for the housekeeping sweeper.
    pub fn local_store(&self) -> Arc<LocalSlidingWindow> {
        self.local.clone()
    }

    /// Sweeper configuration.
    pub fn sweep_config(&self) -> &SweepConfig {
        &self.sweep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::RuleTableConfig;
    use axum::http::HeaderValue;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    struct CollectingSink {
        events: Mutex<Vec<SecurityEvent>>,
    }

    impl CollectingSink {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl SecurityEventSink for CollectingSink {
        async fn append(&self, event: SecurityEvent) -> Result<()> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    fn rule(path: &str, requests: u32, window: u64) -> RateLimitRule {
        RateLimitRule {
            path: path.to_string(),
            requests_per_window: requests,
            window_secs: window,
            skip_successful: false,
            skip_failed: false,
        }
    }

    fn config_with_rules(routes: Vec<RateLimitRule>) -> EngineConfig {
        EngineConfig {
            rules: RuleTableConfig {
                routes,
                default_rule: None,
            },
            ..EngineConfig::default()
        }
    }

    fn anon_headers(addr: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_str(addr).unwrap());
        headers
    }

    fn at(epoch: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(epoch, 0).unwrap()
    }

    #[tokio::test]
    async fn test_window_scenario_end_to_end() {
        let engine = RateLimitEngine::new(config_with_rules(vec![rule("/api/items", 5, 60)]))
            .await
            .unwrap();
        let headers = anon_headers("10.1.1.1");

        for (t, expected_remaining) in [(0, 4), (1, 3), (2, 2), (3, 1), (4, 0)] {
            let eval = engine
                .evaluate_at("/api/items", &headers, at(t))
                .await
                .unwrap();
            assert!(eval.result.allowed);
            assert_eq!(eval.result.remaining, expected_remaining);
            assert_eq!(eval.result.reset_at, t + 60);
        }

        let denied = engine
            .evaluate_at("/api/items", &headers, at(5))
            .await
            .unwrap();
        assert!(!denied.result.allowed);
        assert_eq!(denied.result.retry_after_secs, Some(60));

        let denied = engine
            .evaluate_at("/api/items", &headers, at(6))
            .await
            .unwrap();
        assert_eq!(denied.result.retry_after_secs, Some(120));
    }

    #[tokio::test]
    async fn test_path_outside_prefix_bypasses() {
        let engine = RateLimitEngine::new(config_with_rules(vec![rule("/api/items", 1, 60)]))
            .await
            .unwrap();

        let headers = anon_headers("10.1.1.1");
        assert!(engine.evaluate_at("/health", &headers, at(0)).await.is_none());
        assert!(engine
            .evaluate_at("/dashboard", &headers, at(0))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_rule_miss_without_default_is_unlimited() {
        let engine = RateLimitEngine::new(config_with_rules(vec![rule("/api/items", 1, 60)]))
            .await
            .unwrap();

        let headers = anon_headers("10.1.1.1");
        for _ in 0..50 {
            assert!(engine
                .evaluate_at("/api/other", &headers, at(0))
                .await
                .is_none());
        }
    }

    #[tokio::test]
    async fn test_default_rule_applies() {
        let mut config = config_with_rules(vec![rule("/api/items", 100, 60)]);
        config.rules.default_rule = Some(rule("", 1, 60));
        let engine = RateLimitEngine::new(config).await.unwrap();

        let headers = anon_headers("10.1.1.1");
        assert!(
            engine
                .evaluate_at("/api/other", &headers, at(0))
                .await
                .unwrap()
                .result
                .allowed
        );
        assert!(
            !engine
                .evaluate_at("/api/other", &headers, at(1))
                .await
                .unwrap()
                .result
                .allowed
        );
    }

    #[tokio::test]
    async fn test_exempt_address_never_denied_and_no_state() {
        let mut config = config_with_rules(vec![rule("/api/items", 1, 60)]);
        config.exempt_addresses = vec!["203.0.113.5".parse().unwrap()];
        let engine = RateLimitEngine::new(config).await.unwrap();

        let headers = anon_headers("203.0.113.5");
        for _ in 0..100 {
            assert!(engine
                .evaluate_at("/api/items", &headers, at(0))
                .await
                .is_none());
        }
        assert_eq!(engine.local_store().client_count(), 0);
    }

    #[tokio::test]
    async fn test_separate_keys_for_separate_callers() {
        let engine = RateLimitEngine::new(config_with_rules(vec![rule("/api/items", 1, 60)]))
            .await
            .unwrap();

        let first = anon_headers("10.1.1.1");
        let second = anon_headers("10.1.1.2");

        assert!(
            engine
                .evaluate_at("/api/items", &first, at(0))
                .await
                .unwrap()
                .result
                .allowed
        );
        assert!(
            engine
                .evaluate_at("/api/items", &second, at(0))
                .await
                .unwrap()
                .result
                .allowed
        );
        assert!(
            !engine
                .evaluate_at("/api/items", &first, at(1))
                .await
                .unwrap()
                .result
                .allowed
        );
    }

    #[tokio::test]
    async fn test_denial_emits_one_audit_event() {
        let sink = Arc::new(CollectingSink::new());
        let engine = RateLimitEngine::builder(config_with_rules(vec![rule("/api/items", 1, 60)]))
            .audit_sink(sink.clone())
            .build()
            .await
            .unwrap();

        let mut headers = anon_headers("10.1.1.1");
        headers.insert("user-agent", HeaderValue::from_static("curl/8.0"));

        let _ = engine.evaluate_at("/api/items", &headers, at(0)).await;
        assert!(sink.events.lock().is_empty());

        let _ = engine.evaluate_at("/api/items", &headers, at(1)).await;
        let events = sink.events.lock();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event_type, "rate_limit_exceeded");
        assert_eq!(event.ip_address, "10.1.1.1");
        assert_eq!(event.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(event.details["endpoint"], "/api/items");
        assert_eq!(event.details["limit"], 1);
        assert_eq!(event.details["window_secs"], 60);
    }

    #[tokio::test]
    async fn test_settle_discharges_skipped_outcome() {
        let mut skip_rule = rule("/api/uploads", 1, 60);
        skip_rule.skip_successful = true;
        let engine = RateLimitEngine::new(config_with_rules(vec![skip_rule]))
            .await
            .unwrap();

        let headers = anon_headers("10.1.1.1");

        let eval = engine
            .evaluate_at("/api/uploads", &headers, at(0))
            .await
            .unwrap();
        assert!(eval.result.allowed);
        engine.settle(&eval, true).await;

        // The successful request was discharged, so the single slot is free
        let eval = engine
            .evaluate_at("/api/uploads", &headers, at(1))
            .await
            .unwrap();
        assert!(eval.result.allowed);
    }

    #[tokio::test]
    async fn test_settle_retains_counted_outcome() {
        let mut skip_rule = rule("/api/uploads", 1, 60);
        skip_rule.skip_successful = true;
        let engine = RateLimitEngine::new(config_with_rules(vec![skip_rule]))
            .await
            .unwrap();

        let headers = anon_headers("10.1.1.1");

        let eval = engine
            .evaluate_at("/api/uploads", &headers, at(0))
            .await
            .unwrap();
        // A failed response is still counted under skip_successful
        engine.settle(&eval, false).await;

        let eval = engine
            .evaluate_at("/api/uploads", &headers, at(1))
            .await
            .unwrap();
        assert!(!eval.result.allowed);
    }

    struct FailingBackend;

    #[async_trait::async_trait]
    impl RateLimitBackend for FailingBackend {
        async fn check(
            &self,
            _key: &str,
            _rule: &RateLimitRule,
            _now: DateTime<Utc>,
        ) -> Result<WindowCheck> {
            Err(FloodgateError::StoreUnavailable)
        }

        async fn remove_entry(&self, _key: &str, _entry: &str) -> Result<()> {
            Err(FloodgateError::StoreUnavailable)
        }
    }

    #[tokio::test]
    async fn test_store_failure_falls_back_to_local_counting() {
        let engine = RateLimitEngine::builder(config_with_rules(vec![rule("/api/items", 2, 60)]))
            .shared_backend(Arc::new(FailingBackend))
            .build()
            .await
            .unwrap();

        let headers = anon_headers("10.1.1.1");

        // The local fallback starts counting from zero for this key and
        // enforces the rule on its own
        let eval = engine
            .evaluate_at("/api/items", &headers, at(0))
            .await
            .unwrap();
        assert!(eval.result.allowed);
        assert!(eval.result.degraded);

        assert!(
            engine
                .evaluate_at("/api/items", &headers, at(1))
                .await
                .unwrap()
                .result
                .allowed
        );
        assert!(
            !engine
                .evaluate_at("/api/items", &headers, at(2))
                .await
                .unwrap()
                .result
                .allowed
        );
    }

    #[tokio::test]
    async fn test_local_results_not_degraded_without_store() {
        let engine = RateLimitEngine::new(config_with_rules(vec![rule("/api/items", 5, 60)]))
            .await
            .unwrap();

        let headers = anon_headers("10.1.1.1");
        let eval = engine
            .evaluate_at("/api/items", &headers, at(0))
            .await
            .unwrap();
        assert!(!eval.result.degraded);
    }
}
