//! Periodic purge of stale in-process client state.
//!
//! A long-lived process seeing many distinct anonymous callers would grow
//! its local client map without bound; the sweeper drops state idle beyond
//! the retention horizon on a fixed interval.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use super::local::LocalSlidingWindow;
use crate::config::SweepConfig;

/// Owns the housekeeping timer for the in-process counter.
///
/// The timer runs independently of request handling. Dropping the sweeper
/// or calling [`Sweeper::shutdown`] stops it.
pub struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the sweep task against the given store.
    pub fn start(store: Arc<LocalSlidingWindow>, config: SweepConfig) -> Self {
        let interval = Duration::from_secs(config.interval_secs.max(1));
        let retention = config.retention_secs;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so sweeps start one
            // full interval after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let dropped = store.sweep(Utc::now(), retention);
                if dropped > 0 {
                    debug!(dropped = dropped, "Swept idle client state");
                }
            }
        });

        Self { handle }
    }

    /// Stop the sweep timer.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::ratelimit::backoff::BackoffPolicy;
    use crate::ratelimit::rules::RateLimitRule;
    use chrono::TimeZone;

    fn store_with_stale_client() -> Arc<LocalSlidingWindow> {
        let store = Arc::new(LocalSlidingWindow::new(
            BackoffPolicy::new(&BackoffConfig::default()),
            false,
        ));
        let rule = RateLimitRule {
            path: "/api/test".to_string(),
            requests_per_window: 5,
            window_secs: 60,
            skip_successful: false,
            skip_failed: false,
        };
        // Recorded at the epoch, far past any retention horizon
        store.check_at("stale", &rule, Utc.timestamp_opt(0, 0).unwrap());
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_on_interval() {
        let store = store_with_stale_client();
        assert_eq!(store.client_count(), 1);

        let sweeper = Sweeper::start(
            store.clone(),
            SweepConfig {
                interval_secs: 1,
                retention_secs: 86_400,
            },
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.client_count(), 0);

        sweeper.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_timer() {
        let store = store_with_stale_client();
        let sweeper = Sweeper::start(
            store,
            SweepConfig {
                interval_secs: 1,
                retention_secs: 86_400,
            },
        );

        sweeper.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sweeper.handle.is_finished());
    }
}
