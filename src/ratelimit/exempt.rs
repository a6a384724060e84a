//! Exemption checks that bypass limiting entirely.
//!
//! Allow-listed addresses and privileged roles skip the counters. Identity
//! resolution failures are never exempt: exemption fails closed while
//! enforcement stays fail-open.

use axum::http::HeaderMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::trace;

use super::identity::{ClientIdentifier, RoleResolver};

/// Decides whether a caller bypasses rate limiting.
pub struct ExemptionChecker {
    allowlist: HashSet<IpAddr>,
    exempt_roles: HashSet<String>,
    resolver: Option<Arc<dyn RoleResolver>>,
}

impl ExemptionChecker {
    /// Create a checker from the configured allow-list and role set.
    pub fn new(addresses: Vec<IpAddr>, roles: Vec<String>) -> Self {
        Self {
            allowlist: addresses.into_iter().collect(),
            exempt_roles: roles.into_iter().collect(),
            resolver: None,
        }
    }

    /// Wire the identity collaborator used for role resolution.
    pub fn with_resolver(mut self, resolver: Arc<dyn RoleResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Check whether the caller is exempt.
    ///
    /// Never touches counter state.
    pub async fn is_exempt(
        &self,
        identifier: &ClientIdentifier,
        headers: &HeaderMap,
        address: &str,
    ) -> bool {
        if let Ok(ip) = address.parse::<IpAddr>() {
            if self.allowlist.contains(&ip) {
                trace!(address = %address, "Caller address is allow-listed");
                return true;
            }
        }

        let Some(resolver) = &self.resolver else {
            return false;
        };
        let Some(credential) = identifier.credential(headers) else {
            return false;
        };

        match resolver.resolve_role(&credential).await {
            Some(caller) => {
                let exempt = self.exempt_roles.contains(&caller.role);
                if exempt {
                    trace!(role = %caller.role, "Caller role is exempt");
                }
                exempt
            }
            None => false,
        }
    }
}
