//! Client identification for quota tracking.
//!
//! Authenticated callers are keyed by a one-way hash of their credential so
//! quotas stay fair behind shared NAT or proxy addresses; anonymous callers
//! fall back to per-address keys. Raw credentials never appear in a key.

use async_trait::async_trait;
use axum::http::header::{AUTHORIZATION, COOKIE, USER_AGENT};
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Session identifier header checked after the bearer credential.
const SESSION_HEADER: &str = "x-session-id";

/// Hex length the credential hash is truncated to, keeping store keys a
/// predictable size.
const HASHED_KEY_LEN: usize = 16;

/// Caller-supplied key derivation override.
pub type KeyGenerator = Arc<dyn Fn(&HeaderMap, &str) -> Option<String> + Send + Sync>;

/// A credential extracted from the request, in keying precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// Session identifier header
    SessionHeader(String),
    /// Session cookie value
    SessionCookie(String),
}

impl Credential {
    /// The raw credential value.
    pub fn raw(&self) -> &str {
        match self {
            Credential::Bearer(v) => v,
            Credential::SessionHeader(v) => v,
            Credential::SessionCookie(v) => v,
        }
    }
}

/// A resolved caller identity.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Stable caller id
    pub id: String,
    /// Caller role name
    pub role: String,
}

/// Collaborator contract for resolving a credential to a caller.
///
/// Resolution failures of any kind are represented as `None`; the engine
/// treats an unresolved caller as anonymous and never exempt.
#[async_trait]
pub trait RoleResolver: Send + Sync {
    async fn resolve_role(&self, credential: &Credential) -> Option<Caller>;
}

/// Derives a stable quota key for the calling client.
pub struct ClientIdentifier {
    key_generator: Option<KeyGenerator>,
    session_cookie: String,
}

impl ClientIdentifier {
    /// Create an identifier using the given session cookie name.
    pub fn new(session_cookie: impl Into<String>) -> Self {
        Self {
            key_generator: None,
            session_cookie: session_cookie.into(),
        }
    }

    /// Install a caller-supplied key generator checked before the built-in
    /// derivation chain.
    pub fn with_key_generator(mut self, generator: KeyGenerator) -> Self {
        self.key_generator = Some(generator);
        self
    }

    /// Derive the client key for a request.
    pub fn identify(&self, headers: &HeaderMap, path: &str) -> String {
        if let Some(generator) = &self.key_generator {
            if let Some(key) = generator(headers, path) {
                return key;
            }
        }

        if let Some(credential) = self.credential(headers) {
            return format!("user:{}", hashed_key(credential.raw()));
        }

        format!("ip:{}", client_address(headers))
    }

    /// Extract the caller's credential, if any, in precedence order.
    pub fn credential(&self, headers: &HeaderMap) -> Option<Credential> {
        if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if !token.is_empty() {
                    return Some(Credential::Bearer(token.to_string()));
                }
            }
        }

        if let Some(value) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(Credential::SessionHeader(value.to_string()));
            }
        }

        if let Some(value) = self.session_cookie_value(headers) {
            return Some(Credential::SessionCookie(value));
        }

        None
    }

    fn session_cookie_value(&self, headers: &HeaderMap) -> Option<String> {
        let cookies = headers.get(COOKIE)?.to_str().ok()?;
        for pair in cookies.split(';') {
            let pair = pair.trim();
            if let Some(value) = pair.strip_prefix(&format!("{}=", self.session_cookie)) {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
        None
    }
}

/// Extract the client network address from forwarding headers.
///
/// Takes the first `x-forwarded-for` hop, then `x-real-ip`, then the
/// literal `unknown`.
pub fn client_address(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    "unknown".to_string()
}

/// Extract the user agent, for audit events.
pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// One-way, fixed-length encoding of a raw credential.
fn hashed_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..HASHED_KEY_LEN].to_string()
}
