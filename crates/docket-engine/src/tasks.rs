//! Task intake and reads.
//!
//! Submission persists a `queued` row and emits no receipt; the submitting
//! planner appends its own receipt if it wants one. All reads are
//! tenant-scoped.

use crate::{ApiError, ApiResult, AppState};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use docket_core::validate::validate_task;
use docket_core::{Error, TaskRecord, TaskStatus, TaskSubmission, TenantScope};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

pub(crate) const TASK_COLUMNS: &str = "\
    task_id, tenant_id, task_type, task_summary, task_body, inputs, \
    expected_outcome_kind, expected_artifact_mime, recipient_ai, \
    from_principal, for_principal, trust_domain, retry_principal, \
    required_capabilities, status, priority, not_before, lease_id, worker_id, \
    lease_expires_at, attempt, max_attempts, lease_ttl_seconds, created_at, \
    started_at, completed_at, metadata";

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: Uuid,
}

pub async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(sub): Json<TaskSubmission>,
) -> ApiResult<Json<SubmitTaskResponse>> {
    let scope = state.gate.require(&headers)?;
    validate_task(&sub, &state.cfg.size_limits).map_err(|faults| {
        ApiError::from(Error::from_faults(faults))
    })?;

    let task_id = Uuid::new_v4();
    let max_attempts = sub.max_attempts.unwrap_or(state.cfg.default_max_attempts);

    sqlx::query(
        r#"
        INSERT INTO state.tasks (
          tenant_id, task_id, task_type, task_summary, task_body, inputs,
          expected_outcome_kind, expected_artifact_mime, recipient_ai,
          from_principal, for_principal, trust_domain, retry_principal,
          required_capabilities, status, priority, not_before, attempt,
          max_attempts, lease_ttl_seconds, metadata
        ) VALUES (
          $1, $2, $3, $4, $5, $6,
          $7, $8, $9,
          $10, $11, $12, $13,
          $14, 'queued', $15, $16, 0,
          $17, $18, $19
        )
        "#,
    )
    .bind(&scope.tenant_id)
    .bind(task_id)
    .bind(&sub.task_type)
    .bind(&sub.task_summary)
    .bind(&sub.task_body)
    .bind(&sub.inputs)
    .bind(&sub.expected_outcome_kind)
    .bind(&sub.expected_artifact_mime)
    .bind(&sub.recipient_ai)
    .bind(&sub.from_principal)
    .bind(&sub.for_principal)
    .bind(&sub.trust_domain)
    .bind(&sub.retry_principal)
    .bind(&sub.required_capabilities)
    .bind(sub.priority)
    .bind(sub.not_before)
    .bind(max_attempts)
    .bind(sub.lease_ttl_seconds)
    .bind(&sub.metadata)
    .execute(&state.pool)
    .await
    .map_err(Error::from)?;

    tracing::info!(
        event = "docket.tasks.submitted",
        tenant_id = %scope.tenant_id,
        task_id = %task_id,
        task_type = %sub.task_type,
        priority = sub.priority,
        "task queued"
    );

    Ok(Json(SubmitTaskResponse { task_id }))
}

pub async fn fetch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<TaskRecord>> {
    let scope = state.gate.require(&headers)?;
    let task = fetch_task(&state.pool, &scope, task_id).await?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub recipient_ai: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListTasksResponse {
    pub count: usize,
    pub tasks: Vec<TaskRecord>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<ListTasksResponse>> {
    let scope = state.gate.require(&headers)?;

    let status = params
        .status
        .as_deref()
        .map(|s| {
            TaskStatus::parse(s)
                .map(|s| s.as_str())
                .ok_or_else(|| ApiError::conflict("CONFLICT", format!("unknown status {s:?}")))
        })
        .transpose()?;
    let limit = params.limit.unwrap_or(100).clamp(1, 500);

    let rows = sqlx::query(&format!(
        r#"
        SELECT {TASK_COLUMNS}
        FROM state.tasks
        WHERE tenant_id = $1
          AND ($2::text IS NULL OR status = $2)
          AND ($3::text IS NULL OR recipient_ai = $3)
        ORDER BY created_at DESC
        LIMIT $4
        "#
    ))
    .bind(&scope.tenant_id)
    .bind(status)
    .bind(&params.recipient_ai)
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(Error::from)?;

    let tasks = rows
        .iter()
        .map(task_from_row)
        .collect::<Result<Vec<_>, Error>>()?;
    Ok(Json(ListTasksResponse {
        count: tasks.len(),
        tasks,
    }))
}

pub(crate) async fn fetch_task(
    pool: &PgPool,
    scope: &TenantScope,
    task_id: Uuid,
) -> Result<TaskRecord, Error> {
    let row = sqlx::query(&format!(
        "SELECT {TASK_COLUMNS} FROM state.tasks WHERE tenant_id = $1 AND task_id = $2"
    ))
    .bind(&scope.tenant_id)
    .bind(task_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => task_from_row(&row),
        None => Err(Error::NotFound),
    }
}

pub(crate) fn task_from_row(row: &PgRow) -> Result<TaskRecord, Error> {
    let status: String = row.try_get("status")?;

    Ok(TaskRecord {
        task_id: row.try_get("task_id")?,
        tenant_id: row.try_get("tenant_id")?,
        task_type: row.try_get("task_type")?,
        task_summary: row.try_get("task_summary")?,
        task_body: row.try_get("task_body")?,
        inputs: row.try_get("inputs")?,
        expected_outcome_kind: row.try_get("expected_outcome_kind")?,
        expected_artifact_mime: row.try_get("expected_artifact_mime")?,
        recipient_ai: row.try_get("recipient_ai")?,
        from_principal: row.try_get("from_principal")?,
        for_principal: row.try_get("for_principal")?,
        trust_domain: row.try_get("trust_domain")?,
        retry_principal: row.try_get("retry_principal")?,
        required_capabilities: row.try_get("required_capabilities")?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("stored status {status:?} unknown")))?,
        priority: row.try_get("priority")?,
        not_before: row.try_get("not_before")?,
        lease_id: row.try_get("lease_id")?,
        worker_id: row.try_get("worker_id")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        attempt: row.try_get("attempt")?,
        max_attempts: row.try_get("max_attempts")?,
        lease_ttl_seconds: row.try_get("lease_ttl_seconds")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        metadata: row.try_get("metadata")?,
    })
}
