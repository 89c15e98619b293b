//! The expiry reaper.
//!
//! A background sweep that reclaims tasks whose leases expired silently:
//! marks the lease expired, emits `escalate(policy, "lease_expired")` to the
//! task's retry principal, and applies the same retry policy as a retryable
//! `fail` — all inside one transaction per sweep batch, so a crash between
//! steps never loses or duplicates an escalation.
//!
//! Store failures pause the loop with exponential backoff; the sweep is
//! idempotent, so an interrupted batch is simply retried.

use crate::lease::{apply_retry_policy, escalate_draft, latest_accepted_receipt};
use crate::tasks::{task_from_row, TASK_COLUMNS};
use crate::AppState;
use docket_core::receipt::EscalationClass;
use docket_core::{Error, TaskRecord, TenantScope};
use sqlx::{Postgres, Transaction};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

const SWEEP_BATCH: i64 = 50;
const MAX_BACKOFF: Duration = Duration::from_secs(300);

pub async fn reaper_loop(
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let base = Duration::from_secs(state.cfg.reaper_interval_seconds.max(1));
    let mut delay = base;

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        match reap_expired_leases_once(&state).await {
            Ok(reaped) => {
                if reaped > 0 {
                    tracing::info!(
                        event = "docket.reaper.sweep",
                        reaped = reaped,
                        "expired leases reclaimed"
                    );
                }
                delay = base;
            }
            Err(err) => {
                tracing::warn!(
                    event = "docket.reaper.sweep.error",
                    error = %err,
                    backoff_secs = delay.as_secs(),
                    "reaper sweep failed; backing off"
                );
                delay = (delay * 2).min(MAX_BACKOFF.max(base));
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

/// One sweep over expired leases. Returns the number of tasks reclaimed.
pub async fn reap_expired_leases_once(state: &AppState) -> Result<usize, Error> {
    let mut tx = state.pool.begin().await?;

    let rows = sqlx::query(&format!(
        r#"
        SELECT {TASK_COLUMNS}
        FROM state.tasks
        WHERE status = 'leased'
          AND lease_expires_at IS NOT NULL
          AND lease_expires_at < now()
        ORDER BY lease_expires_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#
    ))
    .bind(SWEEP_BATCH)
    .fetch_all(&mut *tx)
    .await?;

    let mut reaped = 0usize;
    for row in rows {
        let task = task_from_row(&row)?;
        if reap_one(state, &mut tx, &task).await? {
            reaped += 1;
        }
    }

    tx.commit().await?;
    Ok(reaped)
}

async fn reap_one(
    state: &AppState,
    tx: &mut Transaction<'_, Postgres>,
    task: &TaskRecord,
) -> Result<bool, Error> {
    let scope = TenantScope {
        tenant_id: task.tenant_id.clone(),
        subject: "system.reaper".to_string(),
    };

    if let Some(lease_id) = task.lease_id {
        sqlx::query(
            r#"
            UPDATE state.leases
            SET status = 'expired'
            WHERE tenant_id = $1
              AND lease_id = $2
              AND status = 'active'
            "#,
        )
        .bind(&task.tenant_id)
        .bind(lease_id)
        .execute(&mut **tx)
        .await?;
    }

    let escalation_to = task
        .retry_principal
        .clone()
        .unwrap_or_else(|| state.cfg.default_retry_principal.clone());
    let retrying = task.attempt + 1 < task.max_attempts;
    let from_principal = task
        .worker_id
        .clone()
        .unwrap_or_else(|| "system.reaper".to_string());

    let caused_by =
        latest_accepted_receipt(tx, &task.tenant_id, &task.task_id.to_string()).await?;
    let draft = escalate_draft(
        task,
        EscalationClass::Policy,
        "lease_expired",
        &escalation_to,
        &from_principal,
        retrying,
        caused_by,
    );

    match state
        .ledger
        .append_in_tx(tx, &task.tenant_id, draft)
        .await
    {
        Ok(_) => {}
        // A task row whose stored principals cannot form a valid escalation
        // is quarantined rather than looping through the sweep forever.
        Err(Error::Validation(_)) | Err(Error::SizeLimitExceeded(_)) => {
            quarantine(state, tx, task, caused_by).await?;
            return Ok(true);
        }
        Err(err) => return Err(err),
    }
    state
        .ledger
        .archive_accepted_in_tx(tx, &task.tenant_id, &task.task_id.to_string())
        .await?;

    let (status, attempt) = apply_retry_policy(tx, &scope, task, retrying).await?;

    tracing::info!(
        event = "docket.reaper.escalated",
        tenant_id = %task.tenant_id,
        task_id = %task.task_id,
        escalation_to = %escalation_to,
        task_status = status.as_str(),
        attempt = attempt,
        "expired lease escalated"
    );

    Ok(true)
}

/// Park a malformed task as failed, leaving a specialized escalation in the
/// ledger when one can still be formed.
async fn quarantine(
    state: &AppState,
    tx: &mut Transaction<'_, Postgres>,
    task: &TaskRecord,
    caused_by: Option<uuid::Uuid>,
) -> Result<(), Error> {
    let scope = TenantScope {
        tenant_id: task.tenant_id.clone(),
        subject: "system.reaper".to_string(),
    };

    let draft = escalate_draft(
        task,
        EscalationClass::Other,
        "reaper_malformed",
        &state.cfg.default_retry_principal,
        "system.reaper",
        false,
        caused_by,
    );
    if let Err(err) = state.ledger.append_in_tx(tx, &task.tenant_id, draft).await {
        tracing::warn!(
            event = "docket.reaper.quarantine.receipt_failed",
            tenant_id = %task.tenant_id,
            task_id = %task.task_id,
            error = %err,
            "quarantine escalation could not be recorded"
        );
    }

    apply_retry_policy(tx, &scope, task, false).await?;

    tracing::warn!(
        event = "docket.reaper.quarantined",
        tenant_id = %task.tenant_id,
        task_id = %task.task_id,
        "malformed task row quarantined"
    );
    Ok(())
}
