//! Derived-state queries.
//!
//! Inbox, timeline, delegation tree, provenance chain, and derived task
//! status are all computed from receipt history at read time. No query here
//! mutates state, and every statement leads with `tenant_id`.

use crate::{receipt_from_row, Ledger, RECEIPT_COLUMNS};
use docket_core::{DerivedStatus, Error, Receipt, Result, TenantScope};
use sqlx::Row;
use std::collections::HashSet;
use uuid::Uuid;

const DEFAULT_INBOX_LIMIT: i64 = 100;
const MAX_INBOX_LIMIT: i64 = 500;

#[derive(Debug, Clone)]
pub struct InboxPage {
    pub count: usize,
    pub receipts: Vec<Receipt>,
}

/// A provenance traversal result. `truncated` is set when the depth cap cut
/// the walk short; `continue_from` carries the first unvisited link so a
/// caller can resume.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub chain: Vec<Receipt>,
    pub truncated: bool,
    pub continue_from: Option<Uuid>,
}

impl Ledger {
    /// Open obligations for a recipient: `accepted`, unarchived, newest
    /// first. Derived, not stored.
    pub async fn list_inbox(
        &self,
        scope: &TenantScope,
        recipient_ai: &str,
        limit: Option<i64>,
    ) -> Result<InboxPage> {
        let limit = limit.unwrap_or(DEFAULT_INBOX_LIMIT).clamp(1, MAX_INBOX_LIMIT);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECEIPT_COLUMNS}
            FROM ledger.receipts
            WHERE tenant_id = $1
              AND recipient_ai = $2
              AND phase = 'accepted'
              AND archived_at IS NULL
            ORDER BY stored_at DESC, seq DESC
            LIMIT $3
            "#
        ))
        .bind(&scope.tenant_id)
        .bind(recipient_ai)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        let receipts = rows
            .iter()
            .map(receipt_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(InboxPage {
            count: receipts.len(),
            receipts,
        })
    }

    /// All receipts for one obligation, in append order.
    pub async fn task_timeline(&self, scope: &TenantScope, task_id: &str) -> Result<Vec<Receipt>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECEIPT_COLUMNS}
            FROM ledger.receipts
            WHERE tenant_id = $1
              AND task_id = $2
            ORDER BY stored_at ASC, seq ASC
            "#
        ))
        .bind(&scope.tenant_id)
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(receipt_from_row).collect()
    }

    /// Receipts delegated under a parent task.
    pub async fn children(&self, scope: &TenantScope, parent_task_id: &str) -> Result<Vec<Receipt>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECEIPT_COLUMNS}
            FROM ledger.receipts
            WHERE tenant_id = $1
              AND parent_task_id = $2
            ORDER BY stored_at ASC, seq ASC
            "#
        ))
        .bind(&scope.tenant_id)
        .bind(parent_task_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(receipt_from_row).collect()
    }

    /// Walk the provenance graph up and down from one receipt.
    ///
    /// Bounded by `depth_cap` nodes. Cycles cannot be constructed through the
    /// engine (a receipt can only cite an already-stored cause) but the walk
    /// defends against adversarial rows with a visited set.
    pub async fn chain(
        &self,
        scope: &TenantScope,
        receipt_id: Uuid,
        depth_cap: usize,
    ) -> Result<ChainResult> {
        let start = self.get(scope, receipt_id).await?;

        let mut visited: HashSet<Uuid> = HashSet::new();
        visited.insert(start.receipt_id);

        let mut chain = vec![start.clone()];
        let mut truncated = false;
        let mut continue_from = None;

        // Ancestors: follow caused_by_receipt_id links toward the root.
        let mut cursor = start;
        loop {
            let Some(cause_id) = parse_link(&cursor.caused_by_receipt_id) else {
                break;
            };
            if visited.contains(&cause_id) {
                return Err(Error::Internal(anyhow::anyhow!(
                    "provenance cycle detected at receipt {cause_id}"
                )));
            }
            if chain.len() >= depth_cap {
                truncated = true;
                continue_from = Some(cause_id);
                break;
            }
            let cause = match self.get(scope, cause_id).await {
                Ok(receipt) => receipt,
                // A dangling link ends the walk; the chain up to here stands.
                Err(Error::NotFound) => break,
                Err(err) => return Err(err),
            };
            visited.insert(cause.receipt_id);
            chain.push(cause.clone());
            cursor = cause;
        }

        // Descendants: breadth-first over receipts citing a visited id.
        let mut frontier: Vec<Uuid> = vec![receipt_id];
        'walk: while let Some(id) = frontier.pop() {
            let effects = self.caused_by(scope, id).await?;
            for effect in effects {
                if visited.contains(&effect.receipt_id) {
                    return Err(Error::Internal(anyhow::anyhow!(
                        "provenance cycle detected at receipt {}",
                        effect.receipt_id
                    )));
                }
                if chain.len() >= depth_cap {
                    truncated = true;
                    continue_from = continue_from.or(Some(effect.receipt_id));
                    break 'walk;
                }
                visited.insert(effect.receipt_id);
                frontier.push(effect.receipt_id);
                chain.push(effect);
            }
        }

        chain.sort_by(|a, b| {
            a.stored_at
                .cmp(&b.stored_at)
                .then(a.receipt_id.cmp(&b.receipt_id))
        });

        Ok(ChainResult {
            chain,
            truncated,
            continue_from,
        })
    }

    async fn caused_by(&self, scope: &TenantScope, cause: Uuid) -> Result<Vec<Receipt>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECEIPT_COLUMNS}
            FROM ledger.receipts
            WHERE tenant_id = $1
              AND caused_by_receipt_id = $2
            ORDER BY stored_at ASC, seq ASC
            "#
        ))
        .bind(&scope.tenant_id)
        .bind(cause.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(receipt_from_row).collect()
    }

    /// Task status derived from receipt existence, never stored.
    pub async fn task_status(&self, scope: &TenantScope, task_id: &str) -> Result<DerivedStatus> {
        let row = sqlx::query(
            r#"
            SELECT
              count(*) FILTER (WHERE phase = 'complete') AS completes,
              count(*) FILTER (WHERE phase = 'escalate') AS escalates,
              count(*) FILTER (WHERE phase = 'accepted') AS accepteds
            FROM ledger.receipts
            WHERE tenant_id = $1
              AND task_id = $2
            "#,
        )
        .bind(&scope.tenant_id)
        .bind(task_id)
        .fetch_one(self.pool())
        .await?;

        let completes: i64 = row.try_get("completes")?;
        let escalates: i64 = row.try_get("escalates")?;
        let accepteds: i64 = row.try_get("accepteds")?;

        Ok(DerivedStatus::from_phase_presence(
            completes > 0,
            escalates > 0,
            accepteds > 0,
        ))
    }
}

fn parse_link(link: &str) -> Option<Uuid> {
    if link == docket_core::NA {
        return None;
    }
    Uuid::parse_str(link).ok()
}

#[cfg(test)]
mod tests {
    use super::parse_link;
    use docket_core::DerivedStatus;
    use uuid::Uuid;

    #[test]
    fn na_and_garbage_links_end_the_walk() {
        assert_eq!(parse_link("NA"), None);
        assert_eq!(parse_link("not-a-uuid"), None);
        let id = Uuid::new_v4();
        assert_eq!(parse_link(&id.to_string()), Some(id));
    }

    #[test]
    fn derived_status_precedence() {
        use DerivedStatus::*;
        assert_eq!(DerivedStatus::from_phase_presence(true, true, true), Resolved);
        assert_eq!(DerivedStatus::from_phase_presence(false, true, true), Escalated);
        assert_eq!(DerivedStatus::from_phase_presence(false, false, true), Open);
        assert_eq!(DerivedStatus::from_phase_presence(false, false, false), Unknown);
    }
}
