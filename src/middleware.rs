//! Tower middleware wiring the engine into an HTTP router.
//!
//! Allowed requests are forwarded and annotated with the standard
//! `X-RateLimit-*` headers; denied requests are answered with a `429` and
//! `Retry-After` without reaching the inner service.

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::ratelimit::{Evaluation, RateLimitEngine, RateLimitResult};

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
static X_RATELIMIT_DEGRADED: HeaderName = HeaderName::from_static("x-ratelimit-degraded");

/// Rate limiting layer.
#[derive(Clone)]
pub struct RateLimitLayer {
    engine: Arc<RateLimitEngine>,
}

impl RateLimitLayer {
    pub fn new(engine: Arc<RateLimitEngine>) -> Self {
        Self { engine }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            engine: self.engine.clone(),
        }
    }
}

/// Rate limiting service.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    engine: Arc<RateLimitEngine>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let engine = self.engine.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let path = request.uri().path().to_string();
            let evaluation = engine.evaluate(&path, request.headers()).await;

            match evaluation {
                None => inner.call(request).await,
                Some(eval) if eval.result.allowed => {
                    let mut response = inner.call(request).await?;
                    let success = response.status().as_u16() < 400;
                    attach_headers(response.headers_mut(), &eval.result);
                    engine.settle(&eval, success).await;
                    Ok(response)
                }
                Some(eval) => Ok(denial_response(&eval)),
            }
        })
    }
}

fn attach_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(result.limit));
    headers.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(result.remaining),
    );
    headers.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(result.reset_at));
    if result.degraded {
        headers.insert(X_RATELIMIT_DEGRADED.clone(), HeaderValue::from_static("true"));
    }
}

fn denial_response(eval: &Evaluation) -> Response<Body> {
    let retry_after = eval.result.retry_after_secs.unwrap_or(1);
    let body = serde_json::json!({
        "error": "Rate limit exceeded",
        "message": format!("Too many requests. Retry in {} seconds.", retry_after),
        "retryAfter": retry_after,
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    attach_headers(headers, &eval.result);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ratelimit::rules::{RateLimitRule, RuleTableConfig};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn engine_with_rule(requests: u32) -> Arc<RateLimitEngine> {
        let config = EngineConfig {
            rules: RuleTableConfig {
                routes: vec![RateLimitRule {
                    path: "/api/items".to_string(),
                    requests_per_window: requests,
                    window_secs: 60,
                    skip_successful: false,
                    skip_failed: false,
                }],
                default_rule: None,
            },
            ..EngineConfig::default()
        };
        Arc::new(RateLimitEngine::new(config).await.unwrap())
    }

    fn app(engine: Arc<RateLimitEngine>) -> Router {
        Router::new()
            .route("/api/items", get(|| async { "ok" }))
            .route("/health", get(|| async { "ok" }))
            .layer(RateLimitLayer::new(engine))
    }

    fn request(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("x-forwarded-for", "10.0.0.1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_allowed_response_carries_headers() {
        let app = app(engine_with_rule(5).await);

        let response = app.oneshot(request("/api/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "4");
        assert!(response.headers().contains_key("x-ratelimit-reset"));
        assert!(!response.headers().contains_key("x-ratelimit-degraded"));
    }

    #[tokio::test]
    async fn test_denial_is_429_with_json_body() {
        let app = app(engine_with_rule(1).await);

        let response = app.clone().oneshot(request("/api/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(request("/api/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "60");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(
            response.headers()["content-type"],
            "application/json"
        );

        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Rate limit exceeded");
        assert_eq!(body["retryAfter"], 60);
        assert!(body["message"].as_str().unwrap().contains("60"));
    }

    #[tokio::test]
    async fn test_paths_outside_prefix_are_untouched() {
        let app = app(engine_with_rule(1).await);

        for _ in 0..3 {
            let response = app.clone().oneshot(request("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key("x-ratelimit-limit"));
        }
    }

    #[tokio::test]
    async fn test_remaining_decreases_per_request() {
        let app = app(engine_with_rule(3).await);

        for expected in ["2", "1", "0"] {
            let response = app.clone().oneshot(request("/api/items")).await.unwrap();
            assert_eq!(response.headers()["x-ratelimit-remaining"], expected);
        }

        let response = app.oneshot(request("/api/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
