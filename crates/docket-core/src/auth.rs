//! Tenant access tokens.
//!
//! The Access Gate authenticates callers with HS256 bearer tokens and maps
//! the subject to a tenant scope strictly server-side. Key rotation follows
//! the current/next kid overlap scheme: tokens signed with either key verify
//! during the overlap window.

use crate::error::{Error, Result};
use anyhow::Context;
use chrono::Utc;
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone)]
pub struct TenantAccessConfig {
    pub issuer: String,
    pub audience: String,
    pub current_kid: String,
    pub current_secret: String,
    pub next_kid: Option<String>,
    pub next_secret: Option<String>,
    pub ttl: Duration,
}

impl std::fmt::Debug for TenantAccessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let next_secret = self.next_secret.as_deref().map(|_| "<redacted>");
        f.debug_struct("TenantAccessConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("current_kid", &self.current_kid)
            .field("current_secret", &"<redacted>")
            .field("next_kid", &self.next_kid)
            .field("next_secret", &next_secret)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub exp: usize,
    pub iat: usize,

    pub tenant_id: String,
}

/// The resolved caller identity threaded through every ledger and engine
/// call. Constructed only by token verification; the client body never
/// contributes to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    pub tenant_id: String,
    pub subject: String,
}

#[derive(Clone)]
pub struct TenantAccess {
    issuer: String,
    audience: String,
    current_kid: String,
    next_kid: Option<String>,
    ttl: Duration,
    current_encoding_key: EncodingKey,
    current_decoding_key: DecodingKey,
    next_decoding_key: Option<DecodingKey>,
}

impl std::fmt::Debug for TenantAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantAccess")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("current_kid", &self.current_kid)
            .field("next_kid", &self.next_kid)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TenantAccess {
    pub fn from_hs256_config(cfg: TenantAccessConfig) -> Result<Self> {
        if cfg.next_kid.is_some() != cfg.next_secret.is_some() {
            return Err(Error::Internal(anyhow::anyhow!(
                "next_kid and next_secret must be set together"
            )));
        }

        let secret = cfg.current_secret.as_bytes();
        Ok(Self {
            issuer: cfg.issuer,
            audience: cfg.audience,
            current_kid: cfg.current_kid,
            next_kid: cfg.next_kid,
            ttl: cfg.ttl,
            current_encoding_key: EncodingKey::from_secret(secret),
            current_decoding_key: DecodingKey::from_secret(secret),
            next_decoding_key: cfg
                .next_secret
                .as_deref()
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
        })
    }

    /// Issue a tenant-scoped access token for `subject`.
    pub fn issue(&self, subject: &str, tenant_id: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        let iat: usize = now.try_into().unwrap_or(0);
        let exp: usize = (now + self.ttl.as_secs().try_into().unwrap_or(i64::MAX))
            .try_into()
            .unwrap_or(usize::MAX);

        let claims = AccessClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: subject.to_string(),
            exp,
            iat,
            tenant_id: tenant_id.to_string(),
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.current_kid.clone());
        encode(&header, &claims, &self.current_encoding_key)
            .context("encode tenant access token")
            .map_err(Error::Internal)
    }

    /// Verify a bearer token and resolve the caller's tenant scope.
    pub fn verify(&self, token: &str) -> Result<TenantScope> {
        let header =
            decode_header(token).map_err(|_| Error::Unauthenticated("malformed token"))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or(Error::Unauthenticated("missing token kid"))?;

        let decoding_key = if kid == self.current_kid {
            &self.current_decoding_key
        } else if self.next_kid.as_deref() == Some(kid) {
            self.next_decoding_key
                .as_ref()
                .ok_or(Error::Unauthenticated("next signing key not configured"))?
        } else {
            return Err(Error::Unauthenticated("unknown token kid"));
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_audience(std::slice::from_ref(&self.audience));

        let data = decode::<AccessClaims>(token, decoding_key, &validation)
            .map_err(|_| Error::Unauthenticated("token verification failed"))?;

        if data.claims.tenant_id.is_empty() {
            return Err(Error::TenantUnresolved);
        }

        Ok(TenantScope {
            tenant_id: data.claims.tenant_id,
            subject: data.claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access() -> TenantAccess {
        TenantAccess::from_hs256_config(TenantAccessConfig {
            issuer: "docket".into(),
            audience: "docket-api".into(),
            current_kid: "current".into(),
            current_secret: "current-secret".into(),
            next_kid: Some("next".into()),
            next_secret: Some("next-secret".into()),
            ttl: Duration::from_secs(60),
        })
        .unwrap()
    }

    #[test]
    fn issue_verify_roundtrip() {
        let access = access();
        let token = access.issue("planner.core", "acme").unwrap();
        let scope = access.verify(&token).unwrap();
        assert_eq!(scope.tenant_id, "acme");
        assert_eq!(scope.subject, "planner.core");
    }

    #[test]
    fn rejects_garbage_and_wrong_key() {
        let access = access();
        assert!(matches!(
            access.verify("not-a-token"),
            Err(Error::Unauthenticated(_))
        ));

        let other = TenantAccess::from_hs256_config(TenantAccessConfig {
            issuer: "docket".into(),
            audience: "docket-api".into(),
            current_kid: "current".into(),
            current_secret: "a-different-secret".into(),
            next_kid: None,
            next_secret: None,
            ttl: Duration::from_secs(60),
        })
        .unwrap();
        let token = other.issue("planner.core", "acme").unwrap();
        assert!(matches!(
            access.verify(&token),
            Err(Error::Unauthenticated(_))
        ));
    }

    #[test]
    fn accepts_next_key_during_overlap() {
        let next_signer = TenantAccess::from_hs256_config(TenantAccessConfig {
            issuer: "docket".into(),
            audience: "docket-api".into(),
            current_kid: "next".into(),
            current_secret: "next-secret".into(),
            next_kid: None,
            next_secret: None,
            ttl: Duration::from_secs(60),
        })
        .unwrap();
        let token = next_signer.issue("planner.core", "acme").unwrap();
        let scope = access().verify(&token).unwrap();
        assert_eq!(scope.tenant_id, "acme");
    }

    #[test]
    fn rejects_empty_tenant_claim() {
        let access = access();
        let token = access.issue("planner.core", "").unwrap();
        assert!(matches!(access.verify(&token), Err(Error::TenantUnresolved)));
    }
}
