//! The Access Gate.
//!
//! Extracts the bearer token at the transport boundary, resolves the
//! authenticated subject to a tenant scope (strictly server-side; any
//! tenant named in a request body is ignored), and applies per-tenant rate
//! limits. No handler reaches the ledger or the task store without a scope
//! produced here.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::Utc;
use dashmap::DashMap;
use docket_core::{Error, Result, TenantAccess, TenantScope};

#[derive(Clone)]
pub struct Gate {
    access: TenantAccess,
    limiter: Option<RateLimiter>,
}

impl Gate {
    /// `rate_limit_per_minute == 0` disables the limiter.
    pub fn new(access: TenantAccess, rate_limit_per_minute: u32) -> Self {
        let limiter = (rate_limit_per_minute > 0).then(|| RateLimiter::new(rate_limit_per_minute));
        Self { access, limiter }
    }

    /// Authenticate the request and resolve its tenant scope.
    pub fn require(&self, headers: &HeaderMap) -> Result<TenantScope> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(Error::Unauthenticated("missing bearer token"))?;

        let scope = self.access.verify(token)?;

        if let Some(limiter) = &self.limiter {
            if !limiter.allow(&scope.tenant_id) {
                tracing::warn!(
                    event = "docket.gate.rate_limited",
                    tenant_id = %scope.tenant_id,
                    "request rejected by rate limiter"
                );
                return Err(Error::RateLimited);
            }
        }

        Ok(scope)
    }
}

/// Fixed-window per-tenant counter. Coarse on purpose: tenant isolation is
/// structural, the limiter only bounds abusive request volume.
#[derive(Clone)]
struct RateLimiter {
    per_minute: u32,
    windows: std::sync::Arc<DashMap<String, Window>>,
}

#[derive(Clone, Copy)]
struct Window {
    minute: i64,
    count: u32,
}

impl RateLimiter {
    fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            windows: std::sync::Arc::new(DashMap::new()),
        }
    }

    fn allow(&self, tenant_id: &str) -> bool {
        let minute = Utc::now().timestamp() / 60;
        let mut entry = self
            .windows
            .entry(tenant_id.to_string())
            .or_insert(Window { minute, count: 0 });

        if entry.minute != minute {
            entry.minute = minute;
            entry.count = 0;
        }
        if entry.count >= self.per_minute {
            return false;
        }
        entry.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::auth::TenantAccessConfig;
    use std::time::Duration;

    fn gate(per_minute: u32) -> (Gate, TenantAccess) {
        let access = TenantAccess::from_hs256_config(TenantAccessConfig {
            issuer: "docket".into(),
            audience: "docket-api".into(),
            current_kid: "current".into(),
            current_secret: "secret".into(),
            next_kid: None,
            next_secret: None,
            ttl: Duration::from_secs(60),
        })
        .unwrap();
        (Gate::new(access.clone(), per_minute), access)
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        headers
    }

    #[test]
    fn resolves_tenant_from_token() {
        let (gate, access) = gate(0);
        let token = access.issue("planner.core", "acme").unwrap();
        let scope = gate.require(&bearer(&token)).unwrap();
        assert_eq!(scope.tenant_id, "acme");
    }

    #[test]
    fn missing_header_is_unauthenticated() {
        let (gate, _) = gate(0);
        assert!(matches!(
            gate.require(&HeaderMap::new()),
            Err(Error::Unauthenticated(_))
        ));
    }

    #[test]
    fn window_limits_per_tenant() {
        let (gate, access) = gate(2);
        let acme = access.issue("a", "acme").unwrap();
        let globex = access.issue("b", "globex").unwrap();

        assert!(gate.require(&bearer(&acme)).is_ok());
        assert!(gate.require(&bearer(&acme)).is_ok());
        assert!(matches!(
            gate.require(&bearer(&acme)),
            Err(Error::RateLimited)
        ));
        // A different tenant owns a different window.
        assert!(gate.require(&bearer(&globex)).is_ok());
    }
}
