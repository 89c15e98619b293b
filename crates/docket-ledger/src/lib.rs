//! The receipt ledger.
//!
//! Single-writer, append-only store of receipts. Every mutation of receipt
//! rows funnels through this crate: `append` (validated, tenant-stamped,
//! ordered by the ledger clock) and `archive` (the sole mutable column).
//! Derived-state reads live in [`query`].
//!
//! Atomicity note: engine paths that must commit a receipt together with a
//! task-state change call [`Ledger::append_in_tx`] inside their own
//! transaction; `append` is the standalone form wrapping one of its own.

use chrono::{DateTime, Utc};
use docket_core::receipt::{EscalationClass, OutcomeKind, Phase, ReceiptStatus};
use docket_core::validate::{validate_receipt, SizeLimits, StorableReceipt};
use docket_core::{Error, Receipt, ReceiptDraft, Result, TenantScope};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

pub mod query;

pub use query::{ChainResult, InboxPage};

const RECEIPT_COLUMNS: &str = "\
    receipt_id, tenant_id, task_id, parent_task_id, caused_by_receipt_id, \
    from_principal, for_principal, source_system, recipient_ai, trust_domain, \
    phase, status, task_type, task_summary, task_body, inputs, \
    expected_outcome_kind, expected_artifact_mime, outcome_kind, outcome_text, \
    artifact_pointer, artifact_location, artifact_mime, artifact_checksum, \
    artifact_size_bytes, escalation_class, escalation_reason, escalation_to, \
    retry_requested, attempt, dedupe_key, created_at, stored_at, started_at, \
    completed_at, read_at, archived_at, metadata";

/// Result of a successful (or idempotently replayed) append.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub receipt_id: Uuid,
    pub stored_at: DateTime<Utc>,
    pub tenant_id: String,
    /// True when the append matched an existing identical record.
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    pool: PgPool,
    limits: SizeLimits,
}

impl Ledger {
    pub fn new(pool: PgPool, limits: SizeLimits) -> Self {
        Self { pool, limits }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn limits(&self) -> &SizeLimits {
        &self.limits
    }

    /// Validate and append a receipt under the caller's tenant scope.
    pub async fn append(&self, scope: &TenantScope, draft: ReceiptDraft) -> Result<AppendOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = self.append_in_tx(&mut tx, &scope.tenant_id, draft).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Append within a caller-owned transaction, so a receipt and a task
    /// state change commit together or not at all.
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        draft: ReceiptDraft,
    ) -> Result<AppendOutcome> {
        let storable = validate_receipt(draft, &self.limits).map_err(Error::from_faults)?;

        let stored_at = insert_receipt(tx, tenant_id, &storable).await?;
        if let Some(stored_at) = stored_at {
            tracing::info!(
                event = "docket.ledger.append",
                tenant_id = %tenant_id,
                receipt_id = %storable.receipt_id,
                phase = storable.phase.as_str(),
                "receipt appended"
            );
            return Ok(AppendOutcome {
                receipt_id: storable.receipt_id,
                stored_at,
                tenant_id: tenant_id.to_string(),
                deduplicated: false,
            });
        }

        // No row inserted: either the receipt id or the dedupe key collided.
        // Replays with an identical payload are idempotent successes;
        // divergent payloads are conflicts.
        if let Some(existing) = fetch_in_tx(tx, tenant_id, storable.receipt_id).await? {
            return if existing.same_payload(&storable.draft) {
                Ok(AppendOutcome {
                    receipt_id: existing.receipt_id,
                    stored_at: existing.stored_at,
                    tenant_id: tenant_id.to_string(),
                    deduplicated: true,
                })
            } else {
                Err(Error::Duplicate {
                    receipt_id: storable.receipt_id,
                })
            };
        }

        let Some(dedupe_key) = storable.draft.dedupe_key.as_deref() else {
            return Err(Error::Internal(anyhow::anyhow!(
                "append lost a conflict without a matching row"
            )));
        };
        let existing = fetch_by_dedupe_key_in_tx(tx, tenant_id, dedupe_key)
            .await?
            .ok_or_else(|| {
                Error::Internal(anyhow::anyhow!(
                    "append lost a dedupe conflict without a matching row"
                ))
            })?;
        if existing.same_payload(&storable.draft) {
            Ok(AppendOutcome {
                receipt_id: existing.receipt_id,
                stored_at: existing.stored_at,
                tenant_id: tenant_id.to_string(),
                deduplicated: true,
            })
        } else {
            Err(Error::Conflict(format!(
                "dedupe_key {dedupe_key:?} already bound to different side effects"
            )))
        }
    }

    /// Soft-hide a receipt from inbox queries. Idempotent; the record itself
    /// never changes.
    pub async fn archive(
        &self,
        scope: &TenantScope,
        receipt_id: Uuid,
    ) -> Result<DateTime<Utc>> {
        let archived_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE ledger.receipts
            SET archived_at = now()
            WHERE tenant_id = $1
              AND receipt_id = $2
              AND archived_at IS NULL
            RETURNING archived_at
            "#,
        )
        .bind(&scope.tenant_id)
        .bind(receipt_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(archived_at) = archived_at {
            tracing::info!(
                event = "docket.ledger.archive",
                tenant_id = %scope.tenant_id,
                receipt_id = %receipt_id,
                "receipt archived"
            );
            return Ok(archived_at);
        }

        // Already archived, or unknown within the tenant.
        let existing: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(
            r#"
            SELECT archived_at
            FROM ledger.receipts
            WHERE tenant_id = $1
              AND receipt_id = $2
            "#,
        )
        .bind(&scope.tenant_id)
        .bind(receipt_id)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(Some(archived_at)) => Ok(archived_at),
            Some(None) => Err(Error::Internal(anyhow::anyhow!(
                "archive update matched nothing for an unarchived row"
            ))),
            None => Err(Error::NotFound),
        }
    }

    /// Archive every open `accepted` receipt for a task, hiding the resolved
    /// or transferred obligation from inbox queries. Runs inside the
    /// caller's transaction so the terminal receipt and the inbox update
    /// commit together.
    pub async fn archive_accepted_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ledger.receipts
            SET archived_at = now()
            WHERE tenant_id = $1
              AND task_id = $2
              AND phase = 'accepted'
              AND archived_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(task_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get(&self, scope: &TenantScope, receipt_id: Uuid) -> Result<Receipt> {
        let row = sqlx::query(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM ledger.receipts WHERE tenant_id = $1 AND receipt_id = $2"
        ))
        .bind(&scope.tenant_id)
        .bind(receipt_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => receipt_from_row(&row),
            None => Err(Error::NotFound),
        }
    }
}

async fn insert_receipt(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    storable: &StorableReceipt,
) -> Result<Option<DateTime<Utc>>> {
    let d = &storable.draft;
    let stored_at: Option<DateTime<Utc>> = sqlx::query_scalar(
        r#"
        INSERT INTO ledger.receipts (
          tenant_id, receipt_id, task_id, parent_task_id, caused_by_receipt_id,
          from_principal, for_principal, source_system, recipient_ai, trust_domain,
          phase, status, task_type, task_summary, task_body, inputs,
          expected_outcome_kind, expected_artifact_mime, outcome_kind, outcome_text,
          artifact_pointer, artifact_location, artifact_mime, artifact_checksum,
          artifact_size_bytes, escalation_class, escalation_reason, escalation_to,
          retry_requested, attempt, dedupe_key, created_at, started_at,
          completed_at, read_at, metadata
        ) VALUES (
          $1, $2, $3, $4, $5,
          $6, $7, $8, $9, $10,
          $11, $12, $13, $14, $15, $16,
          $17, $18, $19, $20,
          $21, $22, $23, $24,
          $25, $26, $27, $28,
          $29, $30, $31, $32, $33,
          $34, $35, $36
        )
        ON CONFLICT DO NOTHING
        RETURNING stored_at
        "#,
    )
    .bind(tenant_id)
    .bind(storable.receipt_id)
    .bind(&d.task_id)
    .bind(&d.parent_task_id)
    .bind(&d.caused_by_receipt_id)
    .bind(&d.from_principal)
    .bind(&d.for_principal)
    .bind(&d.source_system)
    .bind(&d.recipient_ai)
    .bind(&d.trust_domain)
    .bind(storable.phase.as_str())
    .bind(d.status.as_str())
    .bind(&d.task_type)
    .bind(&d.task_summary)
    .bind(&d.task_body)
    .bind(&d.inputs)
    .bind(&d.expected_outcome_kind)
    .bind(&d.expected_artifact_mime)
    .bind(d.outcome_kind.as_str())
    .bind(&d.outcome_text)
    .bind(&d.artifact_pointer)
    .bind(&d.artifact_location)
    .bind(&d.artifact_mime)
    .bind(&d.artifact_checksum)
    .bind(d.artifact_size_bytes)
    .bind(d.escalation_class.as_str())
    .bind(&d.escalation_reason)
    .bind(&d.escalation_to)
    .bind(d.retry_requested)
    .bind(d.attempt)
    .bind(&d.dedupe_key)
    .bind(d.created_at)
    .bind(d.started_at)
    .bind(d.completed_at)
    .bind(d.read_at)
    .bind(&d.metadata)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(stored_at)
}

async fn fetch_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    receipt_id: Uuid,
) -> Result<Option<Receipt>> {
    let row = sqlx::query(&format!(
        "SELECT {RECEIPT_COLUMNS} FROM ledger.receipts WHERE tenant_id = $1 AND receipt_id = $2"
    ))
    .bind(tenant_id)
    .bind(receipt_id)
    .fetch_optional(&mut **tx)
    .await?;

    row.as_ref().map(receipt_from_row).transpose()
}

async fn fetch_by_dedupe_key_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    dedupe_key: &str,
) -> Result<Option<Receipt>> {
    let row = sqlx::query(&format!(
        "SELECT {RECEIPT_COLUMNS} FROM ledger.receipts WHERE tenant_id = $1 AND dedupe_key = $2"
    ))
    .bind(tenant_id)
    .bind(dedupe_key)
    .fetch_optional(&mut **tx)
    .await?;

    row.as_ref().map(receipt_from_row).transpose()
}

pub(crate) fn receipt_from_row(row: &PgRow) -> Result<Receipt> {
    let phase: String = row.try_get("phase")?;
    let status: String = row.try_get("status")?;
    let outcome_kind: String = row.try_get("outcome_kind")?;
    let escalation_class: String = row.try_get("escalation_class")?;

    Ok(Receipt {
        receipt_id: row.try_get("receipt_id")?,
        tenant_id: row.try_get("tenant_id")?,
        task_id: row.try_get("task_id")?,
        parent_task_id: row.try_get("parent_task_id")?,
        caused_by_receipt_id: row.try_get("caused_by_receipt_id")?,
        from_principal: row.try_get("from_principal")?,
        for_principal: row.try_get("for_principal")?,
        source_system: row.try_get("source_system")?,
        recipient_ai: row.try_get("recipient_ai")?,
        trust_domain: row.try_get("trust_domain")?,
        phase: Phase::parse(&phase)
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("stored phase {phase:?} unknown")))?,
        status: ReceiptStatus::parse(&status)
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("stored status {status:?} unknown")))?,
        task_type: row.try_get("task_type")?,
        task_summary: row.try_get("task_summary")?,
        task_body: row.try_get("task_body")?,
        inputs: row.try_get("inputs")?,
        expected_outcome_kind: row.try_get("expected_outcome_kind")?,
        expected_artifact_mime: row.try_get("expected_artifact_mime")?,
        outcome_kind: OutcomeKind::parse(&outcome_kind).ok_or_else(|| {
            Error::Internal(anyhow::anyhow!("stored outcome_kind {outcome_kind:?} unknown"))
        })?,
        outcome_text: row.try_get("outcome_text")?,
        artifact_pointer: row.try_get("artifact_pointer")?,
        artifact_location: row.try_get("artifact_location")?,
        artifact_mime: row.try_get("artifact_mime")?,
        artifact_checksum: row.try_get("artifact_checksum")?,
        artifact_size_bytes: row.try_get("artifact_size_bytes")?,
        escalation_class: EscalationClass::parse(&escalation_class).ok_or_else(|| {
            Error::Internal(anyhow::anyhow!(
                "stored escalation_class {escalation_class:?} unknown"
            ))
        })?,
        escalation_reason: row.try_get("escalation_reason")?,
        escalation_to: row.try_get("escalation_to")?,
        retry_requested: row.try_get("retry_requested")?,
        attempt: row.try_get("attempt")?,
        dedupe_key: row.try_get("dedupe_key")?,
        created_at: row.try_get("created_at")?,
        stored_at: row.try_get("stored_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        read_at: row.try_get("read_at")?,
        archived_at: row.try_get("archived_at")?,
        metadata: row.try_get("metadata")?,
    })
}
