//! Security event emission.
//!
//! The engine appends one event per denial. Appending is fire-and-forget:
//! a sink failure is logged internally and never affects the request.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;

/// A security-relevant event.
///
/// The payload never carries raw credentials; callers are identified by
/// address and user agent only.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    /// Unique event id
    pub id: Uuid,
    /// Event type, e.g. `rate_limit_exceeded`
    pub event_type: String,
    /// Client network address
    pub ip_address: String,
    /// Client user agent, when present
    pub user_agent: Option<String>,
    /// Event-specific payload
    pub details: serde_json::Value,
}

impl SecurityEvent {
    pub fn new(
        event_type: impl Into<String>,
        ip_address: impl Into<String>,
        user_agent: Option<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            ip_address: ip_address.into(),
            user_agent,
            details,
        }
    }
}

/// Sink for security events.
#[async_trait]
pub trait SecurityEventSink: Send + Sync {
    /// Append one event. Failures must not affect request handling.
    async fn append(&self, event: SecurityEvent) -> Result<()>;
}

/// Default sink that writes events to the tracing log.
pub struct TracingEventSink;

#[async_trait]
impl SecurityEventSink for TracingEventSink {
    async fn append(&self, event: SecurityEvent) -> Result<()> {
        tracing::warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            ip_address = %event.ip_address,
            user_agent = event.user_agent.as_deref().unwrap_or("-"),
            details = %event.details,
            "Security event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracing_sink_accepts_events() {
        let sink = TracingEventSink;
        let event = SecurityEvent::new(
            "rate_limit_exceeded",
            "198.51.100.7",
            Some("curl/8.0".to_string()),
            serde_json::json!({ "endpoint": "/api/items" }),
        );
        assert!(sink.append(event).await.is_ok());
    }

    #[test]
    fn test_event_serializes_without_credentials() {
        let event = SecurityEvent::new(
            "rate_limit_exceeded",
            "198.51.100.7",
            None,
            serde_json::json!({ "limit": 5 }),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("rate_limit_exceeded"));
        assert!(json.contains("198.51.100.7"));
    }
}
