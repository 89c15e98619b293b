//! The receipt data model.
//!
//! A receipt is an immutable, tenant-scoped record of an obligation event:
//! acceptance, completion, or transfer. Task state, inboxes, and provenance
//! are all derived from receipts; nothing here is ever updated in place apart
//! from the archive marker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Sentinel for "not applicable". Stored verbatim in sentinel-bearing fields.
pub const NA: &str = "NA";

/// Placeholder sentinel. Never valid in identity, routing, or summary fields.
pub const TBD: &str = "TBD";

/// The kind of obligation event a receipt records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Creates an obligation on `recipient_ai`.
    Accepted,
    /// Resolves the obligation.
    Complete,
    /// Transfers the obligation to `escalation_to`.
    Escalate,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Accepted => "accepted",
            Phase::Complete => "complete",
            Phase::Escalate => "escalate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(Phase::Accepted),
            "complete" => Some(Phase::Complete),
            "escalate" => Some(Phase::Escalate),
            _ => None,
        }
    }
}

/// Terminal disposition carried by `complete` receipts; `NA` elsewhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    #[default]
    #[serde(rename = "NA")]
    Na,
    Success,
    Failure,
    Canceled,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Na => NA,
            ReceiptStatus::Success => "success",
            ReceiptStatus::Failure => "failure",
            ReceiptStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            NA => Some(ReceiptStatus::Na),
            "success" => Some(ReceiptStatus::Success),
            "failure" => Some(ReceiptStatus::Failure),
            "canceled" => Some(ReceiptStatus::Canceled),
            _ => None,
        }
    }
}

/// Shape of the outcome attached to a `complete` receipt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    #[default]
    #[serde(rename = "NA")]
    Na,
    None,
    ResponseText,
    ArtifactPointer,
    Mixed,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Na => NA,
            OutcomeKind::None => "none",
            OutcomeKind::ResponseText => "response_text",
            OutcomeKind::ArtifactPointer => "artifact_pointer",
            OutcomeKind::Mixed => "mixed",
        }
    }

    /// True for the kinds that require all artifact fields to be populated.
    pub fn carries_artifact(&self) -> bool {
        matches!(self, OutcomeKind::ArtifactPointer | OutcomeKind::Mixed)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            NA => Some(OutcomeKind::Na),
            "none" => Some(OutcomeKind::None),
            "response_text" => Some(OutcomeKind::ResponseText),
            "artifact_pointer" => Some(OutcomeKind::ArtifactPointer),
            "mixed" => Some(OutcomeKind::Mixed),
            _ => None,
        }
    }
}

/// Why an obligation is being transferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationClass {
    #[default]
    #[serde(rename = "NA")]
    Na,
    Owner,
    Capability,
    Trust,
    Policy,
    Scope,
    Other,
}

impl EscalationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationClass::Na => NA,
            EscalationClass::Owner => "owner",
            EscalationClass::Capability => "capability",
            EscalationClass::Trust => "trust",
            EscalationClass::Policy => "policy",
            EscalationClass::Scope => "scope",
            EscalationClass::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            NA => Some(EscalationClass::Na),
            "owner" => Some(EscalationClass::Owner),
            "capability" => Some(EscalationClass::Capability),
            "trust" => Some(EscalationClass::Trust),
            "policy" => Some(EscalationClass::Policy),
            "scope" => Some(EscalationClass::Scope),
            "other" => Some(EscalationClass::Other),
            _ => None,
        }
    }
}

fn na() -> String {
    NA.to_string()
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A candidate receipt as submitted by a client.
///
/// `tenant_id` is never part of the draft: the Access Gate stamps it from the
/// authenticated principal. `receipt_id` may be supplied for idempotent
/// replays; the ledger assigns a UUIDv7 when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptDraft {
    pub receipt_id: Option<Uuid>,

    pub task_id: String,
    pub parent_task_id: String,
    pub caused_by_receipt_id: String,

    pub from_principal: String,
    pub for_principal: String,
    pub source_system: String,
    pub recipient_ai: String,
    pub trust_domain: String,

    pub phase: Option<Phase>,
    pub status: ReceiptStatus,

    pub task_type: String,
    pub task_summary: String,
    pub task_body: String,
    pub inputs: Value,
    pub expected_outcome_kind: String,
    pub expected_artifact_mime: String,

    pub outcome_kind: OutcomeKind,
    pub outcome_text: String,
    pub artifact_pointer: String,
    pub artifact_location: String,
    pub artifact_mime: String,
    pub artifact_checksum: String,
    pub artifact_size_bytes: Option<i64>,

    pub escalation_class: EscalationClass,
    pub escalation_reason: String,
    pub escalation_to: String,

    pub retry_requested: bool,
    pub attempt: i64,

    pub dedupe_key: Option<String>,

    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,

    pub metadata: Value,
}

impl Default for ReceiptDraft {
    fn default() -> Self {
        Self {
            receipt_id: None,
            task_id: String::new(),
            parent_task_id: na(),
            caused_by_receipt_id: na(),
            from_principal: String::new(),
            for_principal: String::new(),
            source_system: String::new(),
            recipient_ai: String::new(),
            trust_domain: String::new(),
            phase: None,
            status: ReceiptStatus::Na,
            task_type: String::new(),
            task_summary: String::new(),
            task_body: String::new(),
            inputs: empty_object(),
            expected_outcome_kind: na(),
            expected_artifact_mime: na(),
            outcome_kind: OutcomeKind::Na,
            outcome_text: na(),
            artifact_pointer: na(),
            artifact_location: na(),
            artifact_mime: na(),
            artifact_checksum: na(),
            artifact_size_bytes: None,
            escalation_class: EscalationClass::Na,
            escalation_reason: na(),
            escalation_to: na(),
            retry_requested: false,
            attempt: 0,
            dedupe_key: None,
            created_at: None,
            started_at: None,
            completed_at: None,
            read_at: None,
            metadata: empty_object(),
        }
    }
}

impl ReceiptDraft {
    /// Normalize absent delegation/provenance links to the `NA` sentinel.
    pub fn normalize(mut self) -> Self {
        if self.parent_task_id.is_empty() {
            self.parent_task_id = na();
        }
        if self.caused_by_receipt_id.is_empty() {
            self.caused_by_receipt_id = na();
        }
        self
    }
}

/// A stored receipt as read back from the ledger.
///
/// Identical to the draft content plus the server-stamped fields: `tenant_id`,
/// the assigned `receipt_id`, the authoritative `stored_at`, and the archive
/// marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_id: Uuid,
    pub tenant_id: String,

    pub task_id: String,
    pub parent_task_id: String,
    pub caused_by_receipt_id: String,

    pub from_principal: String,
    pub for_principal: String,
    pub source_system: String,
    pub recipient_ai: String,
    pub trust_domain: String,

    pub phase: Phase,
    pub status: ReceiptStatus,

    pub task_type: String,
    pub task_summary: String,
    pub task_body: String,
    pub inputs: Value,
    pub expected_outcome_kind: String,
    pub expected_artifact_mime: String,

    pub outcome_kind: OutcomeKind,
    pub outcome_text: String,
    pub artifact_pointer: String,
    pub artifact_location: String,
    pub artifact_mime: String,
    pub artifact_checksum: String,
    pub artifact_size_bytes: Option<i64>,

    pub escalation_class: EscalationClass,
    pub escalation_reason: String,
    pub escalation_to: String,

    pub retry_requested: bool,
    pub attempt: i64,

    pub dedupe_key: Option<String>,

    pub created_at: Option<DateTime<Utc>>,
    pub stored_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,

    pub metadata: Value,
}

impl Receipt {
    /// Compare the client-controlled payload of a stored receipt against a
    /// draft, ignoring every server-stamped field. Used to distinguish an
    /// idempotent replay from a conflicting reuse of the same receipt id.
    pub fn same_payload(&self, draft: &ReceiptDraft) -> bool {
        self.task_id == draft.task_id
            && self.parent_task_id == draft.parent_task_id
            && self.caused_by_receipt_id == draft.caused_by_receipt_id
            && self.from_principal == draft.from_principal
            && self.for_principal == draft.for_principal
            && self.source_system == draft.source_system
            && self.recipient_ai == draft.recipient_ai
            && self.trust_domain == draft.trust_domain
            && Some(self.phase) == draft.phase
            && self.status == draft.status
            && self.task_type == draft.task_type
            && self.task_summary == draft.task_summary
            && self.task_body == draft.task_body
            && self.inputs == draft.inputs
            && self.expected_outcome_kind == draft.expected_outcome_kind
            && self.expected_artifact_mime == draft.expected_artifact_mime
            && self.outcome_kind == draft.outcome_kind
            && self.outcome_text == draft.outcome_text
            && self.artifact_pointer == draft.artifact_pointer
            && self.artifact_location == draft.artifact_location
            && self.artifact_mime == draft.artifact_mime
            && self.artifact_checksum == draft.artifact_checksum
            && self.artifact_size_bytes == draft.artifact_size_bytes
            && self.escalation_class == draft.escalation_class
            && self.escalation_reason == draft.escalation_reason
            && self.escalation_to == draft.escalation_to
            && self.retry_requested == draft.retry_requested
            && self.attempt == draft.attempt
            && self.dedupe_key == draft.dedupe_key
            && self.created_at == draft.created_at
            && self.started_at == draft.started_at
            && self.completed_at == draft.completed_at
            && self.read_at == draft.read_at
            && self.metadata == draft.metadata
    }
}

/// Time-prefixed, lexicographically sortable receipt id.
pub fn new_receipt_id() -> Uuid {
    Uuid::now_v7()
}
