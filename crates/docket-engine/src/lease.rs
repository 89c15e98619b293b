//! The lease manager.
//!
//! A lease is a transient, exclusive claim on a queued task: granted here,
//! extended by heartbeats, resolved by `complete`/`fail`/`release`, reclaimed
//! by the reaper. Offers are ephemeral and never emit receipts; only the
//! obligation boundaries (`accepted`, `complete`, `escalate`) reach the
//! ledger, and those receipt appends commit in the same transaction as the
//! task-state change they describe.

use crate::tasks::{task_from_row, TASK_COLUMNS};
use crate::{ApiError, ApiResult, AppState};
use axum::{extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use docket_core::receipt::{EscalationClass, Phase, NA};
use docket_core::{Error, ReceiptDraft, TaskRecord, TaskStatus, TenantScope};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Row, Transaction};
use std::sync::Arc;
use uuid::Uuid;

/// Bounded retry for losing a grant race before answering "no work".
const GRANT_ATTEMPTS: usize = 3;

#[derive(Debug, Deserialize)]
pub struct LeaseNextRequest {
    pub worker_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub preferred_kinds: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct LeaseOffer {
    pub lease_id: Uuid,
    pub lease_expires_at: DateTime<Utc>,
    pub task: TaskRecord,
}

pub async fn next(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<LeaseNextRequest>,
) -> ApiResult<axum::response::Response> {
    let scope = state.gate.require(&headers)?;
    if req.worker_id.is_empty() {
        return Err(ApiError::conflict("CONFLICT", "worker_id is required"));
    }

    match grant_next(&state, &scope, &req).await? {
        Some(offer) => Ok(Json(offer).into_response()),
        // The queue is empty for this worker's filters. No receipt, no body.
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn grant_next(
    state: &AppState,
    scope: &TenantScope,
    req: &LeaseNextRequest,
) -> Result<Option<LeaseOffer>, Error> {
    let mut tx = state.pool.begin().await?;

    for _ in 0..GRANT_ATTEMPTS {
        let candidate = sqlx::query(
            r#"
            SELECT task_id, lease_ttl_seconds
            FROM state.tasks
            WHERE tenant_id = $1
              AND status = 'queued'
              AND (not_before IS NULL OR not_before <= now())
              AND (cardinality($2::text[]) = 0 OR task_type = ANY($2::text[]))
              AND required_capabilities <@ $3::text[]
            ORDER BY priority DESC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(&scope.tenant_id)
        .bind(&req.preferred_kinds)
        .bind(&req.capabilities)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let task_id: Uuid = candidate.try_get("task_id")?;
        let ttl_override: Option<i64> = candidate.try_get("lease_ttl_seconds")?;
        let ttl_seconds = ttl_override.unwrap_or(state.cfg.lease_ttl_seconds).max(1);
        let lease_id = Uuid::new_v4();

        // Conditional flip: only a still-queued row takes the lease. Losing
        // a race here means another grant committed first; pick again.
        let row = sqlx::query(&format!(
            r#"
            UPDATE state.tasks
            SET status = 'leased',
                lease_id = $3,
                worker_id = $4,
                lease_granted_at = now(),
                lease_expires_at = now() + make_interval(secs => $5),
                started_at = COALESCE(started_at, now())
            WHERE tenant_id = $1
              AND task_id = $2
              AND status = 'queued'
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(&scope.tenant_id)
        .bind(task_id)
        .bind(lease_id)
        .bind(&req.worker_id)
        .bind(ttl_seconds as f64)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            continue;
        };
        let task = task_from_row(&row)?;
        let lease_expires_at = task
            .lease_expires_at
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("granted lease without expiry")))?;

        sqlx::query(
            r#"
            INSERT INTO state.leases (lease_id, tenant_id, task_id, worker_id, granted_at, expires_at, status)
            VALUES ($1, $2, $3, $4, now(), $5, 'active')
            "#,
        )
        .bind(lease_id)
        .bind(&scope.tenant_id)
        .bind(task_id)
        .bind(&req.worker_id)
        .bind(lease_expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            event = "docket.lease.granted",
            tenant_id = %scope.tenant_id,
            task_id = %task_id,
            lease_id = %lease_id,
            worker_id = %req.worker_id,
            "lease granted"
        );

        return Ok(Some(LeaseOffer {
            lease_id,
            lease_expires_at,
            task,
        }));
    }

    Ok(None)
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub lease_id: Uuid,
    pub worker_id: String,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub lease_expires_at: DateTime<Utc>,
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let scope = state.gate.require(&headers)?;

    let mut tx = state.pool.begin().await.map_err(Error::from)?;

    // Extend from now by the task's TTL, never past the lifetime cap.
    let row = sqlx::query(
        r#"
        UPDATE state.tasks
        SET lease_expires_at = LEAST(
              now() + make_interval(secs => COALESCE(lease_ttl_seconds::double precision, $4)),
              lease_granted_at + make_interval(secs => $5))
        WHERE tenant_id = $1
          AND lease_id = $2
          AND worker_id = $3
          AND status = 'leased'
          AND lease_expires_at > now()
        RETURNING lease_expires_at
        "#,
    )
    .bind(&scope.tenant_id)
    .bind(req.lease_id)
    .bind(&req.worker_id)
    .bind(state.cfg.lease_ttl_seconds as f64)
    .bind(state.cfg.max_lease_lifetime_seconds as f64)
    .fetch_optional(&mut *tx)
    .await
    .map_err(Error::from)?;

    let Some(row) = row else {
        drop(tx);
        return Err(lease_refusal(&state, &scope, req.lease_id, &req.worker_id)
            .await
            .into());
    };
    let lease_expires_at: DateTime<Utc> = row.try_get("lease_expires_at").map_err(Error::from)?;

    sqlx::query(
        r#"
        UPDATE state.leases
        SET heartbeats = heartbeats + 1,
            expires_at = $3
        WHERE tenant_id = $1
          AND lease_id = $2
          AND status = 'active'
        "#,
    )
    .bind(&scope.tenant_id)
    .bind(req.lease_id)
    .bind(lease_expires_at)
    .execute(&mut *tx)
    .await
    .map_err(Error::from)?;

    tx.commit().await.map_err(Error::from)?;

    Ok(Json(HeartbeatResponse { lease_expires_at }))
}

/// Explain a refused lease operation: unknown, stolen, released, or expired.
async fn lease_refusal(
    state: &AppState,
    scope: &TenantScope,
    lease_id: Uuid,
    worker_id: &str,
) -> Error {
    let row = sqlx::query(
        r#"
        SELECT worker_id, status
        FROM state.leases
        WHERE tenant_id = $1
          AND lease_id = $2
        "#,
    )
    .bind(&scope.tenant_id)
    .bind(lease_id)
    .fetch_optional(&state.pool)
    .await;

    match row {
        Ok(None) => Error::NotFound,
        Ok(Some(row)) => {
            let owner: String = row.try_get("worker_id").unwrap_or_default();
            let status: String = row.try_get("status").unwrap_or_default();
            if owner != worker_id {
                Error::LeaseNotOwned
            } else if status == "released" {
                Error::LeaseReleased
            } else {
                Error::LeaseExpired
            }
        }
        Err(err) => Error::from(err),
    }
}

struct LockedLease {
    task: TaskRecord,
    /// Lease still active, unexpired, and bound to the task row.
    live: bool,
}

/// Lock the lease and its task row, verifying ownership. Both rows stay
/// locked until the caller's transaction resolves.
async fn lock_lease(
    tx: &mut Transaction<'_, Postgres>,
    scope: &TenantScope,
    lease_id: Uuid,
    worker_id: &str,
) -> Result<LockedLease, Error> {
    let lease = sqlx::query(
        r#"
        SELECT task_id, worker_id, status, expires_at > now() AS unexpired
        FROM state.leases
        WHERE tenant_id = $1
          AND lease_id = $2
        FOR UPDATE
        "#,
    )
    .bind(&scope.tenant_id)
    .bind(lease_id)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(lease) = lease else {
        return Err(Error::NotFound);
    };
    let owner: String = lease.try_get("worker_id")?;
    if owner != worker_id {
        return Err(Error::LeaseNotOwned);
    }
    let lease_status: String = lease.try_get("status")?;
    if lease_status == "released" {
        return Err(Error::LeaseReleased);
    }
    let unexpired: bool = lease.try_get("unexpired")?;
    let task_id: Uuid = lease.try_get("task_id")?;

    let row = sqlx::query(&format!(
        "SELECT {TASK_COLUMNS} FROM state.tasks WHERE tenant_id = $1 AND task_id = $2 FOR UPDATE"
    ))
    .bind(&scope.tenant_id)
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await?;
    let Some(row) = row else {
        return Err(Error::Internal(anyhow::anyhow!(
            "lease {lease_id} references missing task {task_id}"
        )));
    };
    let task = task_from_row(&row)?;

    let live = lease_status == "active"
        && unexpired
        && task.status == TaskStatus::Leased
        && task.lease_id == Some(lease_id);

    Ok(LockedLease { task, live })
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub lease_id: Uuid,
    pub worker_id: String,
    pub receipt: ReceiptDraft,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub receipt_id: Uuid,
    pub stored_at: DateTime<Utc>,
    pub task_id: Uuid,
    pub task_status: TaskStatus,
}

pub async fn complete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CompleteRequest>,
) -> ApiResult<Json<CompleteResponse>> {
    let scope = state.gate.require(&headers)?;

    let mut tx = state.pool.begin().await.map_err(Error::from)?;
    let locked = lock_lease(&mut tx, &scope, req.lease_id, &req.worker_id).await?;
    let task = locked.task;

    let mut draft = req.receipt;
    if draft.phase != Some(Phase::Complete) {
        return Err(ApiError::validation(vec![docket_core::Fault::new(
            "RCP-PHASE-complete",
            docket_core::FaultLayer::Phase,
            "phase",
            "the terminal call requires a complete receipt",
        )]));
    }
    let task_key = task.task_id.to_string();
    if draft.task_id.is_empty() {
        draft.task_id = task_key.clone();
    } else if draft.task_id != task_key {
        return Err(ApiError::conflict(
            "CONFLICT",
            "receipt task_id does not match the leased task",
        ));
    }

    if !locked.live {
        // Late completion: the ledger is append-only, so the receipt still
        // lands; the lease-bound state change is refused and the reaper's
        // escalation stands. Operators reconcile through the timeline.
        let outcome = state
            .ledger
            .append_in_tx(&mut tx, &scope.tenant_id, draft)
            .await?;
        tx.commit().await.map_err(Error::from)?;
        tracing::warn!(
            event = "docket.lease.late_completion",
            tenant_id = %scope.tenant_id,
            task_id = %task_key,
            lease_id = %req.lease_id,
            receipt_id = %outcome.receipt_id,
            "completion arrived after lease expiry; receipt stored, task state unchanged"
        );
        return Err(ApiError::from(Error::LeaseExpired)
            .with_hint("receipt stored; task state unchanged"));
    }

    let outcome = state
        .ledger
        .append_in_tx(&mut tx, &scope.tenant_id, draft)
        .await?;
    state
        .ledger
        .archive_accepted_in_tx(&mut tx, &scope.tenant_id, &task_key)
        .await?;

    sqlx::query(
        r#"
        UPDATE state.tasks
        SET status = 'completed',
            completed_at = now(),
            lease_id = NULL,
            worker_id = NULL,
            lease_granted_at = NULL,
            lease_expires_at = NULL
        WHERE tenant_id = $1
          AND task_id = $2
        "#,
    )
    .bind(&scope.tenant_id)
    .bind(task.task_id)
    .execute(&mut *tx)
    .await
    .map_err(Error::from)?;

    release_lease_row(&mut tx, &scope.tenant_id, req.lease_id).await?;
    tx.commit().await.map_err(Error::from)?;

    tracing::info!(
        event = "docket.lease.completed",
        tenant_id = %scope.tenant_id,
        task_id = %task.task_id,
        lease_id = %req.lease_id,
        receipt_id = %outcome.receipt_id,
        "task completed"
    );

    Ok(Json(CompleteResponse {
        receipt_id: outcome.receipt_id,
        stored_at: outcome.stored_at,
        task_id: task.task_id,
        task_status: TaskStatus::Completed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub lease_id: Uuid,
    pub worker_id: String,
    pub reason: String,
    pub retryable: bool,
    pub escalation_class: Option<EscalationClass>,
    pub escalation_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub lease_id: Uuid,
    pub worker_id: String,
}

#[derive(Debug, Serialize)]
pub struct FailResponse {
    pub receipt_id: Uuid,
    pub stored_at: DateTime<Utc>,
    pub task_id: Uuid,
    pub task_status: TaskStatus,
    pub attempt: i64,
}

pub async fn fail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<FailRequest>,
) -> ApiResult<Json<FailResponse>> {
    let scope = state.gate.require(&headers)?;
    terminal_escalate(&state, &scope, req).await
}

pub async fn release(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ReleaseRequest>,
) -> ApiResult<Json<FailResponse>> {
    let scope = state.gate.require(&headers)?;
    terminal_escalate(
        &state,
        &scope,
        FailRequest {
            lease_id: req.lease_id,
            worker_id: req.worker_id,
            reason: "voluntary_release".to_string(),
            retryable: true,
            escalation_class: None,
            escalation_to: None,
        },
    )
    .await
}

async fn terminal_escalate(
    state: &AppState,
    scope: &TenantScope,
    req: FailRequest,
) -> ApiResult<Json<FailResponse>> {
    let mut tx = state.pool.begin().await.map_err(Error::from)?;
    let locked = lock_lease(&mut tx, scope, req.lease_id, &req.worker_id).await?;
    if !locked.live {
        return Err(ApiError::from(Error::LeaseExpired));
    }
    let task = locked.task;

    let class = req
        .escalation_class
        .filter(|c| *c != EscalationClass::Na)
        .unwrap_or_else(|| derive_escalation_class(&req.reason));
    let escalation_to = req
        .escalation_to
        .or_else(|| task.retry_principal.clone())
        .unwrap_or_else(|| state.cfg.default_retry_principal.clone());

    let retrying = req.retryable && task.attempt + 1 < task.max_attempts;
    let from_principal = task
        .worker_id
        .clone()
        .unwrap_or_else(|| req.worker_id.clone());

    let caused_by = latest_accepted_receipt(&mut tx, &scope.tenant_id, &task.task_id.to_string())
        .await?;
    let draft = escalate_draft(
        &task,
        class,
        &req.reason,
        &escalation_to,
        &from_principal,
        retrying,
        caused_by,
    );

    let outcome = state
        .ledger
        .append_in_tx(&mut tx, &scope.tenant_id, draft)
        .await?;
    state
        .ledger
        .archive_accepted_in_tx(&mut tx, &scope.tenant_id, &task.task_id.to_string())
        .await?;

    let (task_status, attempt) = apply_retry_policy(&mut tx, scope, &task, retrying).await?;
    release_lease_row(&mut tx, &scope.tenant_id, req.lease_id).await?;
    tx.commit().await.map_err(Error::from)?;

    tracing::info!(
        event = "docket.lease.escalated",
        tenant_id = %scope.tenant_id,
        task_id = %task.task_id,
        lease_id = %req.lease_id,
        class = class.as_str(),
        reason = %req.reason,
        requeued = retrying,
        "obligation transferred"
    );

    Ok(Json(FailResponse {
        receipt_id: outcome.receipt_id,
        stored_at: outcome.stored_at,
        task_id: task.task_id,
        task_status,
        attempt,
    }))
}

/// Requeue with a bumped attempt, or park the task as failed once attempts
/// are exhausted. Shared verbatim by the worker-driven terminal calls and
/// the reaper.
pub(crate) async fn apply_retry_policy(
    tx: &mut Transaction<'_, Postgres>,
    scope: &TenantScope,
    task: &TaskRecord,
    retrying: bool,
) -> Result<(TaskStatus, i64), Error> {
    if retrying {
        sqlx::query(
            r#"
            UPDATE state.tasks
            SET status = 'queued',
                attempt = attempt + 1,
                lease_id = NULL,
                worker_id = NULL,
                lease_granted_at = NULL,
                lease_expires_at = NULL
            WHERE tenant_id = $1
              AND task_id = $2
            "#,
        )
        .bind(&scope.tenant_id)
        .bind(task.task_id)
        .execute(&mut **tx)
        .await?;
        Ok((TaskStatus::Queued, task.attempt + 1))
    } else {
        sqlx::query(
            r#"
            UPDATE state.tasks
            SET status = 'failed',
                lease_id = NULL,
                worker_id = NULL,
                lease_granted_at = NULL,
                lease_expires_at = NULL
            WHERE tenant_id = $1
              AND task_id = $2
            "#,
        )
        .bind(&scope.tenant_id)
        .bind(task.task_id)
        .execute(&mut **tx)
        .await?;
        Ok((TaskStatus::Failed, task.attempt))
    }
}

pub(crate) async fn release_lease_row(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    lease_id: Uuid,
) -> Result<(), Error> {
    sqlx::query(
        r#"
        UPDATE state.leases
        SET status = 'released'
        WHERE tenant_id = $1
          AND lease_id = $2
          AND status = 'active'
        "#,
    )
    .bind(tenant_id)
    .bind(lease_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) async fn latest_accepted_receipt(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    task_id: &str,
) -> Result<Option<Uuid>, Error> {
    let receipt_id: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT receipt_id
        FROM ledger.receipts
        WHERE tenant_id = $1
          AND task_id = $2
          AND phase = 'accepted'
        ORDER BY stored_at DESC, seq DESC
        LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(receipt_id)
}

/// Build the engine-emitted escalate receipt for a task. The routing
/// invariant holds by construction: the receipt is addressed to the
/// escalation target.
pub(crate) fn escalate_draft(
    task: &TaskRecord,
    class: EscalationClass,
    reason: &str,
    escalation_to: &str,
    from_principal: &str,
    retrying: bool,
    caused_by: Option<Uuid>,
) -> ReceiptDraft {
    ReceiptDraft {
        task_id: task.task_id.to_string(),
        caused_by_receipt_id: caused_by
            .map(|id| id.to_string())
            .unwrap_or_else(|| NA.to_string()),
        from_principal: from_principal.to_string(),
        for_principal: task.for_principal.clone(),
        source_system: "docket-engine".to_string(),
        recipient_ai: escalation_to.to_string(),
        trust_domain: task.trust_domain.clone(),
        phase: Some(Phase::Escalate),
        task_type: task.task_type.clone(),
        task_summary: task.task_summary.clone(),
        task_body: task.task_body.clone(),
        inputs: task.inputs.clone(),
        expected_outcome_kind: task.expected_outcome_kind.clone(),
        expected_artifact_mime: task.expected_artifact_mime.clone(),
        escalation_class: class,
        escalation_reason: reason.to_string(),
        escalation_to: escalation_to.to_string(),
        retry_requested: retrying,
        attempt: if retrying { task.attempt + 1 } else { task.attempt },
        ..ReceiptDraft::default()
    }
}

pub(crate) fn derive_escalation_class(reason: &str) -> EscalationClass {
    let head = reason
        .split(|c: char| c == ':' || c == '_' || c.is_whitespace())
        .next()
        .unwrap_or("");
    match head {
        "policy" | "lease" => EscalationClass::Policy,
        "capability" => EscalationClass::Capability,
        "trust" => EscalationClass::Trust,
        "scope" => EscalationClass::Scope,
        "owner" => EscalationClass::Owner,
        _ => EscalationClass::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::derive_escalation_class;
    use docket_core::receipt::EscalationClass;

    #[test]
    fn class_derivation_keys_off_the_reason_head() {
        assert_eq!(
            derive_escalation_class("policy: lease_expired"),
            EscalationClass::Policy
        );
        assert_eq!(
            derive_escalation_class("capability missing gpu"),
            EscalationClass::Capability
        );
        assert_eq!(derive_escalation_class("trust_boundary"), EscalationClass::Trust);
        assert_eq!(derive_escalation_class("scope: out of scope"), EscalationClass::Scope);
        assert_eq!(
            derive_escalation_class("voluntary_release"),
            EscalationClass::Other
        );
        assert_eq!(derive_escalation_class(""), EscalationClass::Other);
    }
}
