//! Error taxonomy shared by the ledger, the engine, and the transport edge.
//!
//! Validation and authentication failures surface directly to the caller;
//! store failures fold into `StoreUnavailable` so callers can retry with
//! backoff without matching on driver internals.

use crate::validate::Fault;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("receipt validation failed ({} fault(s))", .0.len())]
    Validation(Vec<Fault>),

    #[error("receipt {receipt_id} already exists with a different payload")]
    Duplicate { receipt_id: Uuid },

    #[error("not found")]
    NotFound,

    #[error("lease expired")]
    LeaseExpired,

    #[error("lease not owned by caller")]
    LeaseNotOwned,

    #[error("lease already released")]
    LeaseReleased,

    #[error("unauthenticated: {0}")]
    Unauthenticated(&'static str),

    #[error("no tenant resolvable for the authenticated subject")]
    TenantUnresolved,

    #[error("payload exceeds the size cap at {0}")]
    SizeLimitExceeded(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("store unavailable")]
    StoreUnavailable(#[source] sqlx::Error),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Stable machine-matchable code for the transport edge.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION-FAILED",
            Error::Duplicate { .. } => "DUPLICATE-RECEIPT-ID",
            Error::NotFound => "NOT-FOUND",
            Error::LeaseExpired => "LEASE-EXPIRED",
            Error::LeaseNotOwned => "LEASE-NOT-OWNED",
            Error::LeaseReleased => "LEASE-RELEASED",
            Error::Unauthenticated(_) => "UNAUTHENTICATED",
            Error::TenantUnresolved => "TENANT-UNRESOLVED",
            Error::SizeLimitExceeded(_) => "SIZE-LIMIT-EXCEEDED",
            Error::RateLimited => "RATE-LIMITED",
            Error::StoreUnavailable(_) => "STORE-UNAVAILABLE",
            Error::Conflict(_) => "CONFLICT",
            Error::Internal(_) => "INTERNAL",
        }
    }

    /// Fold a validation fault list, promoting size-cap faults so the edge
    /// can answer with a 413-equivalent.
    pub fn from_faults(faults: Vec<Fault>) -> Self {
        if let Some(size) = faults
            .iter()
            .find(|f| f.layer == crate::validate::FaultLayer::Size)
        {
            return Error::SizeLimitExceeded(size.path.clone());
        }
        Error::Validation(faults)
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::RowNotFound => Error::NotFound,
            other => Error::StoreUnavailable(other),
        }
    }
}
