//! Task queue contracts.
//!
//! Tasks are the mutable side of the substrate: a durable queue row that
//! workers lease, heartbeat, and resolve. Receipts are emitted at the
//! obligation boundaries; task rows never appear in the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Queue lifecycle of a task row.
///
/// `expired` is transient: the reaper moves an expired lease back to `queued`
/// (attempts remaining) or to `failed` (exhausted) within one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Leased,
    Completed,
    Failed,
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Leased => "leased",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "leased" => Some(TaskStatus::Leased),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "expired" => Some(TaskStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A task as submitted by a client (usually the planner).
///
/// Task bodies follow the same sentinel rules as receipts; `tenant_id` is
/// stamped from the authenticated scope and never read from the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSubmission {
    pub task_type: String,
    pub task_summary: String,
    pub task_body: String,
    pub inputs: Value,
    pub expected_outcome_kind: String,
    pub expected_artifact_mime: String,

    pub recipient_ai: String,
    pub from_principal: String,
    pub for_principal: String,
    pub trust_domain: String,

    /// Principal escalations are routed to when a lease expires. Falls back
    /// to the tenant default configured at the gate.
    pub retry_principal: Option<String>,

    /// Capabilities a worker must advertise to lease this task.
    pub required_capabilities: Vec<String>,

    /// Scheduling hint, clamped to 0..=10.
    pub priority: i16,

    /// Earliest dispensing time; absent means immediately eligible.
    pub not_before: Option<DateTime<Utc>>,

    pub max_attempts: Option<i64>,

    /// Per-task lease TTL override in seconds.
    pub lease_ttl_seconds: Option<i64>,

    pub metadata: Value,
}

impl Default for TaskSubmission {
    fn default() -> Self {
        Self {
            task_type: String::new(),
            task_summary: String::new(),
            task_body: String::new(),
            inputs: empty_object(),
            expected_outcome_kind: crate::receipt::NA.to_string(),
            expected_artifact_mime: crate::receipt::NA.to_string(),
            recipient_ai: String::new(),
            from_principal: String::new(),
            for_principal: String::new(),
            trust_domain: String::new(),
            retry_principal: None,
            required_capabilities: Vec::new(),
            priority: 0,
            not_before: None,
            max_attempts: None,
            lease_ttl_seconds: None,
            metadata: empty_object(),
        }
    }
}

/// A task row as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub tenant_id: String,

    pub task_type: String,
    pub task_summary: String,
    pub task_body: String,
    pub inputs: Value,
    pub expected_outcome_kind: String,
    pub expected_artifact_mime: String,

    pub recipient_ai: String,
    pub from_principal: String,
    pub for_principal: String,
    pub trust_domain: String,
    pub retry_principal: Option<String>,
    pub required_capabilities: Vec<String>,

    pub status: TaskStatus,
    pub priority: i16,
    pub not_before: Option<DateTime<Utc>>,

    pub lease_id: Option<Uuid>,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub attempt: i64,
    pub max_attempts: i64,
    pub lease_ttl_seconds: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub metadata: Value,
}

/// Task status derived from receipt history. Always computed, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedStatus {
    Resolved,
    Escalated,
    Open,
    Unknown,
}

impl DerivedStatus {
    /// Existence-based derivation: a `complete` wins outright, then an
    /// `escalate`, then an `accepted`. Tolerates receipts appended out of
    /// order because it never consults sequence.
    pub fn from_phase_presence(any_complete: bool, any_escalate: bool, any_accepted: bool) -> Self {
        if any_complete {
            DerivedStatus::Resolved
        } else if any_escalate {
            DerivedStatus::Escalated
        } else if any_accepted {
            DerivedStatus::Open
        } else {
            DerivedStatus::Unknown
        }
    }
}
