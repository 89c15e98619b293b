//! Receipt endpoints: append, archive, and the derived-state queries.

use crate::{ApiResult, AppState};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use docket_core::{DerivedStatus, Receipt, ReceiptDraft};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct SubmitReceiptResponse {
    pub receipt_id: Uuid,
    pub stored_at: DateTime<Utc>,
    pub tenant_id: String,
    /// True when an identical receipt was already stored (idempotent replay).
    pub deduplicated: bool,
}

pub async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(draft): Json<ReceiptDraft>,
) -> ApiResult<Json<SubmitReceiptResponse>> {
    let scope = state.gate.require(&headers)?;
    let outcome = state.ledger.append(&scope, draft).await?;
    Ok(Json(SubmitReceiptResponse {
        receipt_id: outcome.receipt_id,
        stored_at: outcome.stored_at,
        tenant_id: outcome.tenant_id,
        deduplicated: outcome.deduplicated,
    }))
}

pub async fn fetch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(receipt_id): Path<Uuid>,
) -> ApiResult<Json<Receipt>> {
    let scope = state.gate.require(&headers)?;
    let receipt = state.ledger.get(&scope, receipt_id).await?;
    Ok(Json(receipt))
}

#[derive(Debug, Serialize)]
pub struct ArchiveResponse {
    pub status: &'static str,
    pub archived_at: DateTime<Utc>,
}

pub async fn archive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(receipt_id): Path<Uuid>,
) -> ApiResult<Json<ArchiveResponse>> {
    let scope = state.gate.require(&headers)?;
    let archived_at = state.ledger.archive(&scope, receipt_id).await?;
    Ok(Json(ArchiveResponse {
        status: "archived",
        archived_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChainParams {
    pub depth: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ChainResponse {
    pub chain: Vec<Receipt>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_from: Option<Uuid>,
}

pub async fn chain(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(receipt_id): Path<Uuid>,
    Query(params): Query<ChainParams>,
) -> ApiResult<Json<ChainResponse>> {
    let scope = state.gate.require(&headers)?;
    let cap = params
        .depth
        .unwrap_or(state.cfg.query_depth_cap)
        .clamp(1, state.cfg.query_depth_cap);
    let result = state.ledger.chain(&scope, receipt_id, cap).await?;
    Ok(Json(ChainResponse {
        chain: result.chain,
        truncated: result.truncated,
        continue_from: result.continue_from,
    }))
}

#[derive(Debug, Deserialize)]
pub struct InboxParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct InboxResponse {
    pub count: usize,
    pub receipts: Vec<Receipt>,
}

pub async fn inbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(recipient_ai): Path<String>,
    Query(params): Query<InboxParams>,
) -> ApiResult<Json<InboxResponse>> {
    let scope = state.gate.require(&headers)?;
    let page = state
        .ledger
        .list_inbox(&scope, &recipient_ai, params.limit)
        .await?;
    Ok(Json(InboxResponse {
        count: page.count,
        receipts: page.receipts,
    }))
}

#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub receipts: Vec<Receipt>,
}

pub async fn timeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TimelineResponse>> {
    let scope = state.gate.require(&headers)?;
    let receipts = state.ledger.task_timeline(&scope, &task_id).await?;
    Ok(Json(TimelineResponse { receipts }))
}

#[derive(Debug, Serialize)]
pub struct DerivedStatusResponse {
    pub task_id: String,
    pub status: DerivedStatus,
}

pub async fn derived_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult<Json<DerivedStatusResponse>> {
    let scope = state.gate.require(&headers)?;
    let status = state.ledger.task_status(&scope, &task_id).await?;
    Ok(Json(DerivedStatusResponse { task_id, status }))
}
