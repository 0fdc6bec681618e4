//! Persistent cache of resolved context inheritance chains.

use super::{Database, now_ms, optional, parse_json};
use crate::context::ContextLevel;
use anyhow::Result;
use rusqlite::params;
use serde::Serialize;
use serde_json::Value;

/// Aggregate view of the inheritance cache table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InheritanceCacheStats {
    pub entries: i64,
    pub valid: i64,
    pub invalidated: i64,
    pub expired: i64,
    pub total_hits: i64,
}

impl Database {
    /// Look up a valid, unexpired resolution and count the hit.
    pub fn cached_resolution(
        &self,
        level: ContextLevel,
        context_id: &str,
        user_id: &str,
    ) -> Result<Option<(Value, Vec<String>)>> {
        let now = now_ms();
        self.with_conn(|conn| {
            let row: Option<(String, String)> = optional(conn.query_row(
                "SELECT resolved_context, parent_chain FROM context_inheritance_cache
                 WHERE context_id = ?1 AND context_level = ?2 AND user_id = ?3
                   AND invalidated = 0 AND expires_at > ?4",
                params![context_id, level.as_str(), user_id, now],
                |row| Ok((row.get(0)?, row.get(1)?)),
            ))?;
            let Some((resolved, chain)) = row else {
                return Ok(None);
            };

            conn.execute(
                "UPDATE context_inheritance_cache SET hit_count = hit_count + 1, last_hit_at = ?1
                 WHERE context_id = ?2 AND context_level = ?3 AND user_id = ?4",
                params![now, context_id, level.as_str(), user_id],
            )?;
            Ok(Some((
                serde_json::from_str(&resolved)?,
                parse_json(&chain),
            )))
        })
    }

    /// Store (or replace) a resolution valid for `ttl_ms`.
    pub fn store_resolution(
        &self,
        level: ContextLevel,
        context_id: &str,
        user_id: &str,
        resolved: &Value,
        chain: &[String],
        ttl_ms: i64,
    ) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO context_inheritance_cache (context_id, context_level, user_id,
                     resolved_context, parent_chain, expires_at, hit_count, invalidated, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7)
                 ON CONFLICT (context_id, context_level, user_id) DO UPDATE SET
                     resolved_context = excluded.resolved_context,
                     parent_chain = excluded.parent_chain,
                     expires_at = excluded.expires_at,
                     hit_count = 0,
                     last_hit_at = NULL,
                     invalidated = 0,
                     invalidation_reason = NULL,
                     created_at = excluded.created_at",
                params![
                    context_id,
                    level.as_str(),
                    user_id,
                    resolved.to_string(),
                    serde_json::to_string(chain)?,
                    now + ttl_ms,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Mark the given resolutions invalid. Returns how many rows changed.
    pub fn invalidate_resolutions(
        &self,
        user_id: &str,
        targets: &[(ContextLevel, String)],
        reason: &str,
    ) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut changed = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE context_inheritance_cache SET invalidated = 1, invalidation_reason = ?1
                     WHERE context_id = ?2 AND context_level = ?3 AND user_id = ?4 AND invalidated = 0",
                )?;
                for (level, id) in targets {
                    changed += stmt.execute(params![reason, id, level.as_str(), user_id])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        })
    }

    /// Invalidate every resolution of a user.
    pub fn invalidate_user_resolutions(&self, user_id: &str, reason: &str) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE context_inheritance_cache SET invalidated = 1, invalidation_reason = ?1
                 WHERE user_id = ?2 AND invalidated = 0",
                params![reason, user_id],
            )?)
        })
    }

    /// Drop invalidated and expired rows.
    pub fn purge_resolutions(&self) -> Result<usize> {
        let now = now_ms();
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM context_inheritance_cache WHERE invalidated = 1 OR expires_at <= ?1",
                params![now],
            )?)
        })
    }

    pub fn inheritance_cache_stats(&self) -> Result<InheritanceCacheStats> {
        let now = now_ms();
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(invalidated = 0 AND expires_at > ?1), 0),
                        COALESCE(SUM(invalidated = 1), 0),
                        COALESCE(SUM(invalidated = 0 AND expires_at <= ?1), 0),
                        COALESCE(SUM(hit_count), 0)
                 FROM context_inheritance_cache",
                params![now],
                |row| {
                    Ok(InheritanceCacheStats {
                        entries: row.get(0)?,
                        valid: row.get(1)?,
                        invalidated: row.get(2)?,
                        expired: row.get(3)?,
                        total_hits: row.get(4)?,
                    })
                },
            )?)
        })
    }
}
