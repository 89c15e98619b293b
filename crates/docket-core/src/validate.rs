//! Receipt and task validation.
//!
//! The pipeline runs class by class: structural shape and size caps, forbidden
//! sentinel values, phase invariants, the routing invariant, retry coherence.
//! The first class with faults short-circuits the pipeline, but every fault
//! inside that class is collected so a caller can fix a submission in one
//! round trip.
//!
//! This validator is intentionally fail-closed: a receipt that cannot be
//! proven storable is rejected with stable, matchable codes.

use crate::receipt::{
    new_receipt_id, EscalationClass, OutcomeKind, Phase, ReceiptDraft, ReceiptStatus, NA, TBD,
};
use crate::task::TaskSubmission;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-field payload caps. The defaults are the published contract; the
/// harness may narrow them, never widen past the transport body limit.
#[derive(Debug, Clone, Copy)]
pub struct SizeLimits {
    pub inputs_bytes: usize,
    pub metadata_bytes: usize,
    pub task_body_bytes: usize,
    pub outcome_text_bytes: usize,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            inputs_bytes: 64 * 1024,
            metadata_bytes: 16 * 1024,
            task_body_bytes: 100 * 1024,
            outcome_text_bytes: 100 * 1024,
        }
    }
}

/// Which stage of the pipeline (or which component) produced a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultLayer {
    Structural,
    Size,
    Sentinel,
    Phase,
    Routing,
    Retry,
    Gate,
    Store,
    Engine,
}

/// One violated invariant, with a stable code and the offending field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub code: String,
    pub layer: FaultLayer,
    pub path: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Fault {
    pub fn new(
        code: impl Into<String>,
        layer: FaultLayer,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            layer,
            path: path.into(),
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// A draft that passed the pipeline: normalized, with its id assigned.
/// The ledger stamps `tenant_id` and `stored_at` at append time.
#[derive(Debug, Clone)]
pub struct StorableReceipt {
    pub receipt_id: Uuid,
    pub phase: Phase,
    pub draft: ReceiptDraft,
}

/// Validate a candidate receipt, returning its normalized storable form or
/// the ordered list of violated invariants.
pub fn validate_receipt(
    draft: ReceiptDraft,
    limits: &SizeLimits,
) -> Result<StorableReceipt, Vec<Fault>> {
    let draft = draft.normalize();

    let faults = structural_faults(&draft, limits);
    if !faults.is_empty() {
        return Err(faults);
    }

    let faults = sentinel_faults(&draft);
    if !faults.is_empty() {
        return Err(faults);
    }

    // Presence of `phase` is a structural concern, checked above.
    let phase = draft.phase.expect("phase present after structural checks");

    let faults = phase_faults(&draft, phase);
    if !faults.is_empty() {
        return Err(faults);
    }

    if phase == Phase::Escalate && draft.recipient_ai != draft.escalation_to {
        return Err(vec![Fault::new(
            "RCP-ROUTE-001",
            FaultLayer::Routing,
            "recipient_ai",
            "escalate receipts must be routed to the escalation target",
        )
        .with_hint("set recipient_ai equal to escalation_to")]);
    }

    if draft.retry_requested && draft.attempt < 1 {
        return Err(vec![Fault::new(
            "RCP-RETRY-001",
            FaultLayer::Retry,
            "attempt",
            "retry_requested implies attempt >= 1",
        )]);
    }

    let receipt_id = draft.receipt_id.unwrap_or_else(new_receipt_id);
    Ok(StorableReceipt {
        receipt_id,
        phase,
        draft,
    })
}

fn structural_faults(draft: &ReceiptDraft, limits: &SizeLimits) -> Vec<Fault> {
    let mut faults = Vec::new();

    if draft.task_id.is_empty() {
        faults.push(Fault::new(
            "RCP-STRUCT-001",
            FaultLayer::Structural,
            "task_id",
            "task_id is required",
        ));
    }
    if draft.phase.is_none() {
        faults.push(Fault::new(
            "RCP-STRUCT-002",
            FaultLayer::Structural,
            "phase",
            "phase is required",
        ));
    }
    if draft.task_type.is_empty() {
        faults.push(Fault::new(
            "RCP-STRUCT-003",
            FaultLayer::Structural,
            "task_type",
            "task_type is required",
        ));
    }
    if draft.task_summary.is_empty() {
        faults.push(Fault::new(
            "RCP-STRUCT-004",
            FaultLayer::Structural,
            "task_summary",
            "task_summary is required",
        ));
    }
    if draft.expected_outcome_kind.is_empty() {
        faults.push(Fault::new(
            "RCP-STRUCT-005",
            FaultLayer::Structural,
            "expected_outcome_kind",
            "expected_outcome_kind is required",
        ));
    }
    if draft.expected_artifact_mime.is_empty() {
        faults.push(Fault::new(
            "RCP-STRUCT-006",
            FaultLayer::Structural,
            "expected_artifact_mime",
            "expected_artifact_mime is required",
        ));
    }
    if draft.attempt < 0 {
        faults.push(Fault::new(
            "RCP-STRUCT-007",
            FaultLayer::Structural,
            "attempt",
            "attempt must be >= 0",
        ));
    }
    if !draft.inputs.is_object() && !draft.inputs.is_array() {
        faults.push(Fault::new(
            "RCP-STRUCT-008",
            FaultLayer::Structural,
            "inputs",
            "inputs must be a structured value",
        ));
    }
    if !draft.metadata.is_object() {
        faults.push(Fault::new(
            "RCP-STRUCT-009",
            FaultLayer::Structural,
            "metadata",
            "metadata must be an object",
        ));
    }

    faults.extend(size_faults(draft, limits));
    faults
}

fn size_faults(draft: &ReceiptDraft, limits: &SizeLimits) -> Vec<Fault> {
    let mut faults = Vec::new();

    if json_size(&draft.inputs) > limits.inputs_bytes {
        faults.push(size_fault("RCP-SIZE-001", "inputs", limits.inputs_bytes));
    }
    if json_size(&draft.metadata) > limits.metadata_bytes {
        faults.push(size_fault("RCP-SIZE-002", "metadata", limits.metadata_bytes));
    }
    if draft.task_body.len() > limits.task_body_bytes {
        faults.push(size_fault("RCP-SIZE-003", "task_body", limits.task_body_bytes));
    }
    if draft.outcome_text.len() > limits.outcome_text_bytes {
        faults.push(size_fault(
            "RCP-SIZE-004",
            "outcome_text",
            limits.outcome_text_bytes,
        ));
    }

    faults
}

fn size_fault(code: &str, path: &str, cap: usize) -> Fault {
    Fault::new(
        code,
        FaultLayer::Size,
        path,
        format!("{path} exceeds the {cap}-byte cap"),
    )
}

fn json_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

const IDENTITY_FIELDS: &[(&str, &str)] = &[
    ("RCP-SENT-001", "from_principal"),
    ("RCP-SENT-002", "for_principal"),
    ("RCP-SENT-003", "source_system"),
    ("RCP-SENT-004", "recipient_ai"),
    ("RCP-SENT-005", "trust_domain"),
];

fn sentinel_faults(draft: &ReceiptDraft) -> Vec<Fault> {
    let mut faults = Vec::new();

    for (code, path) in IDENTITY_FIELDS {
        let value = match *path {
            "from_principal" => &draft.from_principal,
            "for_principal" => &draft.for_principal,
            "source_system" => &draft.source_system,
            "recipient_ai" => &draft.recipient_ai,
            "trust_domain" => &draft.trust_domain,
            _ => unreachable!(),
        };
        if value.is_empty() || value == NA || value == TBD {
            faults.push(Fault::new(
                *code,
                FaultLayer::Sentinel,
                *path,
                format!("{path} must be a concrete principal, not empty/NA/TBD"),
            ));
        }
    }

    faults
}

fn phase_faults(draft: &ReceiptDraft, phase: Phase) -> Vec<Fault> {
    match phase {
        Phase::Accepted => accepted_faults(draft),
        Phase::Complete => complete_faults(draft),
        Phase::Escalate => escalate_faults(draft),
    }
}

fn accepted_fault(path: &str, message: impl Into<String>) -> Fault {
    Fault::new("RCP-PHASE-accepted", FaultLayer::Phase, path, message)
}

fn accepted_faults(draft: &ReceiptDraft) -> Vec<Fault> {
    let mut faults = Vec::new();

    if draft.status != ReceiptStatus::Na {
        faults.push(accepted_fault("status", "accepted receipts carry status NA"));
    }
    if draft.completed_at.is_some() {
        faults.push(accepted_fault(
            "completed_at",
            "accepted receipts must not carry completed_at",
        ));
    }
    if draft.task_summary == TBD {
        faults.push(accepted_fault(
            "task_summary",
            "task_summary must be concrete before acceptance",
        ));
    }
    for (path, value) in artifact_fields(draft) {
        if value != NA {
            faults.push(accepted_fault(path, "artifact fields must be NA at acceptance"));
        }
    }
    if draft.artifact_size_bytes.is_some() {
        faults.push(accepted_fault(
            "artifact_size_bytes",
            "artifact fields must be NA at acceptance",
        ));
    }
    if draft.escalation_class != EscalationClass::Na {
        faults.push(accepted_fault(
            "escalation_class",
            "accepted receipts carry no escalation",
        ));
    }
    if draft.escalation_to != NA {
        faults.push(accepted_fault(
            "escalation_to",
            "accepted receipts carry no escalation target",
        ));
    }
    if draft.retry_requested {
        faults.push(accepted_fault(
            "retry_requested",
            "accepted receipts never request a retry",
        ));
    }

    faults
}

fn complete_fault(path: &str, message: impl Into<String>) -> Fault {
    Fault::new("RCP-PHASE-complete", FaultLayer::Phase, path, message)
}

fn complete_faults(draft: &ReceiptDraft) -> Vec<Fault> {
    let mut faults = Vec::new();

    if draft.status == ReceiptStatus::Na {
        faults.push(complete_fault(
            "status",
            "complete receipts carry success, failure, or canceled",
        ));
    }
    if draft.completed_at.is_none() {
        faults.push(complete_fault(
            "completed_at",
            "complete receipts carry a completion timestamp",
        ));
    }
    if draft.outcome_kind == OutcomeKind::Na {
        faults.push(complete_fault(
            "outcome_kind",
            "complete receipts declare an outcome kind",
        ));
    }
    if draft.escalation_class != EscalationClass::Na {
        faults.push(complete_fault(
            "escalation_class",
            "complete receipts carry no escalation",
        ));
    }
    if draft.outcome_kind.carries_artifact() {
        for (path, value) in artifact_fields(draft) {
            if value == NA || value.is_empty() {
                faults.push(
                    complete_fault(path, "artifact outcomes require all artifact fields")
                        .with_hint("populate the artifact pointer, location, mime, and checksum"),
                );
            }
        }
        if draft.artifact_size_bytes.is_none() {
            faults.push(complete_fault(
                "artifact_size_bytes",
                "artifact outcomes require artifact_size_bytes",
            ));
        }
    }

    faults
}

fn escalate_fault(path: &str, message: impl Into<String>) -> Fault {
    Fault::new("RCP-PHASE-escalate", FaultLayer::Phase, path, message)
}

fn escalate_faults(draft: &ReceiptDraft) -> Vec<Fault> {
    let mut faults = Vec::new();

    if draft.status != ReceiptStatus::Na {
        faults.push(escalate_fault("status", "escalate receipts carry status NA"));
    }
    if draft.escalation_class == EscalationClass::Na {
        faults.push(escalate_fault(
            "escalation_class",
            "escalate receipts declare an escalation class",
        ));
    }
    if draft.escalation_reason.is_empty()
        || draft.escalation_reason == NA
        || draft.escalation_reason == TBD
    {
        faults.push(escalate_fault(
            "escalation_reason",
            "escalation_reason must be concrete",
        ));
    }
    if draft.escalation_to.is_empty() || draft.escalation_to == NA || draft.escalation_to == TBD {
        faults.push(escalate_fault(
            "escalation_to",
            "escalation_to must name a principal",
        ));
    }

    faults
}

fn artifact_fields(draft: &ReceiptDraft) -> [(&'static str, &str); 4] {
    [
        ("artifact_pointer", draft.artifact_pointer.as_str()),
        ("artifact_location", draft.artifact_location.as_str()),
        ("artifact_mime", draft.artifact_mime.as_str()),
        ("artifact_checksum", draft.artifact_checksum.as_str()),
    ]
}

/// Validate a task submission. Task bodies adhere to the same sentinel rules
/// as receipts; the queue rejects placeholders before they can be leased.
pub fn validate_task(sub: &TaskSubmission, limits: &SizeLimits) -> Result<(), Vec<Fault>> {
    let mut faults = Vec::new();

    if sub.task_type.is_empty() {
        faults.push(Fault::new(
            "TSK-STRUCT-001",
            FaultLayer::Structural,
            "task_type",
            "task_type is required",
        ));
    }
    if sub.task_summary.is_empty() || sub.task_summary == TBD {
        faults.push(Fault::new(
            "TSK-STRUCT-002",
            FaultLayer::Structural,
            "task_summary",
            "task_summary must be concrete",
        ));
    }
    if !(0..=10).contains(&sub.priority) {
        faults.push(Fault::new(
            "TSK-STRUCT-003",
            FaultLayer::Structural,
            "priority",
            "priority must be within 0..=10",
        ));
    }
    if sub.max_attempts.is_some_and(|m| m < 1) {
        faults.push(Fault::new(
            "TSK-STRUCT-004",
            FaultLayer::Structural,
            "max_attempts",
            "max_attempts must be >= 1",
        ));
    }
    if sub.lease_ttl_seconds.is_some_and(|t| t < 1) {
        faults.push(Fault::new(
            "TSK-STRUCT-005",
            FaultLayer::Structural,
            "lease_ttl_seconds",
            "lease_ttl_seconds must be >= 1",
        ));
    }
    if !faults.is_empty() {
        return Err(faults);
    }

    if sub.task_body.len() > limits.task_body_bytes {
        faults.push(size_fault("TSK-SIZE-001", "task_body", limits.task_body_bytes));
    }
    if json_size(&sub.inputs) > limits.inputs_bytes {
        faults.push(size_fault("TSK-SIZE-002", "inputs", limits.inputs_bytes));
    }
    if json_size(&sub.metadata) > limits.metadata_bytes {
        faults.push(size_fault("TSK-SIZE-003", "metadata", limits.metadata_bytes));
    }
    if !faults.is_empty() {
        return Err(faults);
    }

    for (code, path, value) in [
        ("TSK-SENT-001", "recipient_ai", &sub.recipient_ai),
        ("TSK-SENT-002", "from_principal", &sub.from_principal),
        ("TSK-SENT-003", "for_principal", &sub.for_principal),
        ("TSK-SENT-004", "trust_domain", &sub.trust_domain),
    ] {
        if value.is_empty() || value == NA || value == TBD {
            faults.push(Fault::new(
                code,
                FaultLayer::Sentinel,
                path,
                format!("{path} must be a concrete principal, not empty/NA/TBD"),
            ));
        }
    }
    if let Some(rp) = &sub.retry_principal {
        if rp.is_empty() || rp == NA || rp == TBD {
            faults.push(Fault::new(
                "TSK-SENT-005",
                FaultLayer::Sentinel,
                "retry_principal",
                "retry_principal must be a concrete principal when present",
            ));
        }
    }

    if faults.is_empty() {
        Ok(())
    } else {
        Err(faults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn accepted_draft() -> ReceiptDraft {
        ReceiptDraft {
            task_id: "task-1".into(),
            from_principal: "planner.core".into(),
            for_principal: "user.alice".into(),
            source_system: "planner".into(),
            recipient_ai: "worker.x".into(),
            trust_domain: "prod".into(),
            phase: Some(Phase::Accepted),
            task_type: "summarize".into(),
            task_summary: "summarize the quarterly report".into(),
            task_body: "full instructions".into(),
            expected_outcome_kind: "response_text".into(),
            expected_artifact_mime: "text/plain".into(),
            ..ReceiptDraft::default()
        }
    }

    fn complete_draft() -> ReceiptDraft {
        ReceiptDraft {
            status: ReceiptStatus::Success,
            outcome_kind: OutcomeKind::ResponseText,
            outcome_text: "done".into(),
            completed_at: Some(Utc::now()),
            phase: Some(Phase::Complete),
            ..accepted_draft()
        }
    }

    fn escalate_draft() -> ReceiptDraft {
        ReceiptDraft {
            phase: Some(Phase::Escalate),
            escalation_class: EscalationClass::Capability,
            escalation_reason: "needs GPU".into(),
            escalation_to: "fallback.y".into(),
            recipient_ai: "fallback.y".into(),
            ..accepted_draft()
        }
    }

    fn codes(err: Vec<Fault>) -> Vec<String> {
        err.into_iter().map(|f| f.code).collect()
    }

    #[test]
    fn accepts_well_formed_phases() {
        let limits = SizeLimits::default();
        validate_receipt(accepted_draft(), &limits).unwrap();
        validate_receipt(complete_draft(), &limits).unwrap();
        validate_receipt(escalate_draft(), &limits).unwrap();
    }

    #[test]
    fn assigns_sortable_id_when_absent() {
        let limits = SizeLimits::default();
        let a = validate_receipt(accepted_draft(), &limits).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = validate_receipt(accepted_draft(), &limits).unwrap();
        assert!(a.receipt_id.to_string() < b.receipt_id.to_string());
    }

    #[test]
    fn keeps_supplied_id() {
        let limits = SizeLimits::default();
        let id = Uuid::new_v4();
        let mut draft = accepted_draft();
        draft.receipt_id = Some(id);
        let stored = validate_receipt(draft, &limits).unwrap();
        assert_eq!(stored.receipt_id, id);
    }

    #[test]
    fn collects_all_structural_faults() {
        let limits = SizeLimits::default();
        let draft = ReceiptDraft::default();
        let err = validate_receipt(draft, &limits).unwrap_err();
        let codes = codes(err);
        assert!(codes.contains(&"RCP-STRUCT-001".to_string()), "{codes:?}");
        assert!(codes.contains(&"RCP-STRUCT-002".to_string()), "{codes:?}");
        assert!(codes.iter().all(|c| c.starts_with("RCP-STRUCT")), "{codes:?}");
    }

    #[test]
    fn rejects_oversized_inputs() {
        let limits = SizeLimits::default();
        let mut draft = accepted_draft();
        draft.inputs = json!({ "blob": "x".repeat(64 * 1024) });
        let err = validate_receipt(draft, &limits).unwrap_err();
        assert!(err.iter().any(|f| f.code == "RCP-SIZE-001"));
        assert!(err.iter().all(|f| f.layer == FaultLayer::Structural || f.layer == FaultLayer::Size));
    }

    #[test]
    fn rejects_sentinel_identity_fields() {
        let limits = SizeLimits::default();
        for (field, expected) in [
            ("from_principal", "RCP-SENT-001"),
            ("recipient_ai", "RCP-SENT-004"),
        ] {
            for bad in ["", NA, TBD] {
                let mut draft = accepted_draft();
                match field {
                    "from_principal" => draft.from_principal = bad.into(),
                    "recipient_ai" => draft.recipient_ai = bad.into(),
                    _ => unreachable!(),
                }
                let err = validate_receipt(draft, &limits).unwrap_err();
                assert!(
                    err.iter().any(|f| f.code == expected),
                    "field={field} bad={bad:?}"
                );
            }
        }
    }

    #[test]
    fn rejects_tbd_summary_on_accepted() {
        let limits = SizeLimits::default();
        let mut draft = accepted_draft();
        draft.task_summary = TBD.into();
        let err = validate_receipt(draft, &limits).unwrap_err();
        assert!(err.iter().any(|f| f.code == "RCP-PHASE-accepted" && f.path == "task_summary"));
    }

    #[test]
    fn rejects_accepted_with_terminal_fields() {
        let limits = SizeLimits::default();
        let mut draft = accepted_draft();
        draft.status = ReceiptStatus::Success;
        draft.completed_at = Some(Utc::now());
        draft.artifact_pointer = "pointer://a/b".into();
        let err = validate_receipt(draft, &limits).unwrap_err();
        let paths: Vec<_> = err.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"status"));
        assert!(paths.contains(&"completed_at"));
        assert!(paths.contains(&"artifact_pointer"));
    }

    #[test]
    fn rejects_complete_without_timestamp_or_status() {
        let limits = SizeLimits::default();
        let mut draft = complete_draft();
        draft.status = ReceiptStatus::Na;
        draft.completed_at = None;
        let err = validate_receipt(draft, &limits).unwrap_err();
        assert!(err.iter().all(|f| f.code == "RCP-PHASE-complete"));
        assert!(err.len() >= 2);
    }

    #[test]
    fn rejects_artifact_outcome_with_na_pointer() {
        let limits = SizeLimits::default();
        let mut draft = complete_draft();
        draft.outcome_kind = OutcomeKind::ArtifactPointer;
        let err = validate_receipt(draft, &limits).unwrap_err();
        assert!(err
            .iter()
            .any(|f| f.code == "RCP-PHASE-complete" && f.path == "artifact_pointer"));
        assert!(err
            .iter()
            .any(|f| f.code == "RCP-PHASE-complete" && f.path == "artifact_size_bytes"));
    }

    #[test]
    fn accepts_artifact_outcome_with_all_fields() {
        let limits = SizeLimits::default();
        let mut draft = complete_draft();
        draft.outcome_kind = OutcomeKind::ArtifactPointer;
        draft.artifact_pointer = "pointer://a/b".into();
        draft.artifact_location = "store-1".into();
        draft.artifact_mime = "application/pdf".into();
        draft.artifact_checksum = "sha256:abc".into();
        draft.artifact_size_bytes = Some(1024);
        validate_receipt(draft, &limits).unwrap();
    }

    #[test]
    fn rejects_routing_mismatch() {
        let limits = SizeLimits::default();
        let mut draft = escalate_draft();
        draft.recipient_ai = "a".into();
        draft.escalation_to = "b".into();
        let err = validate_receipt(draft, &limits).unwrap_err();
        assert_eq!(codes(err), vec!["RCP-ROUTE-001".to_string()]);
    }

    #[test]
    fn rejects_escalate_without_class_or_reason() {
        let limits = SizeLimits::default();
        let mut draft = escalate_draft();
        draft.escalation_class = EscalationClass::Na;
        draft.escalation_reason = TBD.into();
        let err = validate_receipt(draft, &limits).unwrap_err();
        assert!(err.iter().all(|f| f.code == "RCP-PHASE-escalate"));
        assert_eq!(err.len(), 2);
    }

    #[test]
    fn rejects_retry_without_attempt() {
        let limits = SizeLimits::default();
        let mut draft = escalate_draft();
        draft.retry_requested = true;
        draft.attempt = 0;
        let err = validate_receipt(draft, &limits).unwrap_err();
        assert_eq!(codes(err), vec!["RCP-RETRY-001".to_string()]);
    }

    #[test]
    fn phase_faults_hide_later_layers() {
        // A routing violation behind a phase violation stays hidden until the
        // phase class passes: one class at a time.
        let limits = SizeLimits::default();
        let mut draft = escalate_draft();
        draft.escalation_class = EscalationClass::Na;
        draft.recipient_ai = "someone.else".into();
        let err = validate_receipt(draft, &limits).unwrap_err();
        assert!(err.iter().all(|f| f.layer == FaultLayer::Phase));
    }

    #[test]
    fn normalizes_empty_links_to_na() {
        let limits = SizeLimits::default();
        let mut draft = accepted_draft();
        draft.parent_task_id = String::new();
        draft.caused_by_receipt_id = String::new();
        let stored = validate_receipt(draft, &limits).unwrap();
        assert_eq!(stored.draft.parent_task_id, NA);
        assert_eq!(stored.draft.caused_by_receipt_id, NA);
    }

    fn task_submission() -> TaskSubmission {
        TaskSubmission {
            task_type: "summarize".into(),
            task_summary: "summarize the report".into(),
            task_body: "body".into(),
            recipient_ai: "worker.x".into(),
            from_principal: "planner.core".into(),
            for_principal: "user.alice".into(),
            trust_domain: "prod".into(),
            priority: 5,
            ..TaskSubmission::default()
        }
    }

    #[test]
    fn accepts_well_formed_task() {
        validate_task(&task_submission(), &SizeLimits::default()).unwrap();
    }

    #[test]
    fn rejects_task_with_sentinel_recipient() {
        let mut sub = task_submission();
        sub.recipient_ai = TBD.into();
        let err = validate_task(&sub, &SizeLimits::default()).unwrap_err();
        assert!(err.iter().any(|f| f.code == "TSK-SENT-001"));
    }

    #[test]
    fn rejects_task_priority_out_of_range() {
        let mut sub = task_submission();
        sub.priority = 11;
        let err = validate_task(&sub, &SizeLimits::default()).unwrap_err();
        assert!(err.iter().any(|f| f.code == "TSK-STRUCT-003"));
    }
}
