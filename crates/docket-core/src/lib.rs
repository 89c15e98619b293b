//! Shared contracts for the docket coordination substrate.
//!
//! This crate defines the receipt and task data model, the receipt validation
//! pipeline, the error taxonomy shared by the ledger and the engine, and the
//! tenant access-token signer used at the transport boundary.
//!
//! # API notes
//! `docket-core` is an internal crate (`publish = false`). Its public API uses
//! a few third-party types (`uuid::Uuid`, `chrono::DateTime<Utc>`,
//! `serde_json::Value`) as part of the docket contract.

pub mod auth;
pub mod error;
pub mod receipt;
pub mod task;
pub mod validate;

pub use auth::{TenantAccess, TenantScope};
pub use error::{Error, Result};
pub use receipt::{
    EscalationClass, OutcomeKind, Phase, Receipt, ReceiptDraft, ReceiptStatus, NA, TBD,
};
pub use task::{DerivedStatus, TaskRecord, TaskStatus, TaskSubmission};
pub use validate::{Fault, FaultLayer, SizeLimits};
