//! Context delegation requests.

use super::{Database, new_id, now_ms, optional, parse_column, parse_json};
use crate::context::{ContextLevel, Delegation, DelegationStatus};
use anyhow::Result;
use rusqlite::{Row, params};
use serde_json::Value;

fn parse_delegation_row(row: &Row) -> rusqlite::Result<Delegation> {
    let data: String = row.get("delegated_data")?;
    Ok(Delegation {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        source_level: parse_column("source_level", row.get("source_level")?)?,
        source_id: row.get("source_id")?,
        target_level: parse_column("target_level", row.get("target_level")?)?,
        target_id: row.get("target_id")?,
        delegated_data: parse_json::<Option<Value>>(&data).unwrap_or(Value::Null),
        reason: row.get("reason")?,
        status: parse_column("status", row.get("status")?)?,
        processed_at: row.get("processed_at")?,
        created_at: row.get("created_at")?,
    })
}

impl Database {
    /// Record a pending delegation.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_delegation(
        &self,
        user_id: &str,
        source_level: ContextLevel,
        source_id: &str,
        target_level: ContextLevel,
        target_id: &str,
        data: &Value,
        reason: &str,
    ) -> Result<Delegation> {
        let delegation = Delegation {
            id: new_id(),
            user_id: user_id.to_string(),
            source_level,
            source_id: source_id.to_string(),
            target_level,
            target_id: target_id.to_string(),
            delegated_data: data.clone(),
            reason: reason.to_string(),
            status: DelegationStatus::Pending,
            processed_at: None,
            created_at: now_ms(),
        };

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO context_delegations (id, user_id, source_level, source_id, target_level,
                     target_id, delegated_data, reason, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    &delegation.id,
                    user_id,
                    source_level.as_str(),
                    source_id,
                    target_level.as_str(),
                    target_id,
                    data.to_string(),
                    reason,
                    delegation.status.as_str(),
                    delegation.created_at,
                ],
            )?;
            Ok(())
        })?;

        Ok(delegation)
    }

    pub fn get_delegation(&self, user_id: &str, delegation_id: &str) -> Result<Option<Delegation>> {
        self.with_conn(|conn| {
            optional(conn.query_row(
                "SELECT * FROM context_delegations WHERE id = ?1 AND user_id = ?2",
                params![delegation_id, user_id],
                parse_delegation_row,
            ))
        })
    }

    /// Delegations of a user, newest first, optionally by status.
    pub fn list_delegations(
        &self,
        user_id: &str,
        status: Option<DelegationStatus>,
        limit: i64,
    ) -> Result<Vec<Delegation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM context_delegations
                 WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, id DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![user_id, status.map(|s| s.as_str()), limit], parse_delegation_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Move a pending delegation to a final status. Returns `false` when it was
    /// not pending (or does not exist).
    pub fn finish_delegation(
        &self,
        user_id: &str,
        delegation_id: &str,
        status: DelegationStatus,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE context_delegations SET status = ?1, processed_at = ?2
                 WHERE id = ?3 AND user_id = ?4 AND status = 'pending'",
                params![status.as_str(), now_ms(), delegation_id, user_id],
            )?;
            Ok(changed > 0)
        })
    }
}
