//! Context rows of the four hierarchy tables, plus entity lookups used by
//! hierarchy validation and cache invalidation.

use super::{Database, now_ms, optional, parse_json};
use crate::context::{ContextLevel, ContextRecord};
use crate::error::ApiError;
use anyhow::Result;
use rusqlite::{Connection, Row, params};
use serde_json::Value;

fn parse_context_row(level: ContextLevel, row: &Row) -> rusqlite::Result<ContextRecord> {
    let data: String = row.get("data")?;
    let overrides: String = row.get("local_overrides")?;
    let insights: String = row.get("insights")?;
    let progress: String = row.get("progress")?;
    let rules: String = row.get("delegation_rules")?;
    let parent_id = if level == ContextLevel::Global {
        None
    } else {
        row.get("parent_id")?
    };

    Ok(ContextRecord {
        level,
        id: row.get("id")?,
        parent_id,
        user_id: row.get("user_id")?,
        data: parse_json::<Option<Value>>(&data).unwrap_or_else(|| Value::Object(Default::default())),
        local_overrides: parse_json::<Option<Value>>(&overrides)
            .unwrap_or_else(|| Value::Object(Default::default())),
        insights: parse_json(&insights),
        progress: parse_json(&progress),
        delegation_rules: parse_json::<Option<Value>>(&rules)
            .unwrap_or_else(|| Value::Object(Default::default())),
        inheritance_disabled: row.get("inheritance_disabled")?,
        version: row.get("version")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub(crate) fn get_context_internal(
    conn: &Connection,
    level: ContextLevel,
    context_id: &str,
    user_id: &str,
) -> Result<Option<ContextRecord>> {
    let sql = format!("SELECT * FROM {} WHERE id = ?1 AND user_id = ?2", level.table());
    optional(conn.query_row(&sql, params![context_id, user_id], |row| {
        parse_context_row(level, row)
    }))
}

fn ids(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(args, |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

impl Database {
    pub fn get_context(
        &self,
        level: ContextLevel,
        context_id: &str,
        user_id: &str,
    ) -> Result<Option<ContextRecord>> {
        self.with_conn(|conn| get_context_internal(conn, level, context_id, user_id))
    }

    /// Insert a new context row. Fails with `AlreadyExists` on duplicates.
    pub fn insert_context(&self, record: &ContextRecord) -> Result<()> {
        let table = record.level.table();
        self.with_conn(|conn| {
            if get_context_internal(conn, record.level, &record.id, &record.user_id)?.is_some() {
                return Err(ApiError::already_exists(format!(
                    "{} context {} already exists",
                    record.level, record.id
                ))
                .into());
            }

            // Global rows have no parent column
            let (columns, values) = if record.level == ContextLevel::Global {
                ("id, user_id", "?1, ?2")
            } else {
                ("id, user_id, parent_id", "?1, ?2, ?11")
            };
            let sql = format!(
                "INSERT INTO {} ({}, data, local_overrides, insights, progress, delegation_rules,
                     inheritance_disabled, version, created_at, updated_at)
                 VALUES ({}, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                table, columns, values
            );

            let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![
                Box::new(record.id.clone()),
                Box::new(record.user_id.clone()),
                Box::new(record.data.to_string()),
                Box::new(record.local_overrides.to_string()),
                Box::new(serde_json::to_string(&record.insights)?),
                Box::new(serde_json::to_string(&record.progress)?),
                Box::new(record.delegation_rules.to_string()),
                Box::new(record.inheritance_disabled),
                Box::new(record.version),
                Box::new(record.created_at),
            ];
            if record.level != ContextLevel::Global {
                args.push(Box::new(record.parent_id.clone()));
            }
            conn.execute(&sql, rusqlite::params_from_iter(args.iter()))?;
            Ok(())
        })
    }

    /// Persist the mutable fields of a context and bump its version.
    ///
    /// Returns the stored record, or `None` when it does not exist.
    pub fn save_context(&self, record: &ContextRecord) -> Result<Option<ContextRecord>> {
        let now = now_ms();
        let sql = format!(
            "UPDATE {} SET data = ?1, local_overrides = ?2, insights = ?3, progress = ?4,
                 delegation_rules = ?5, inheritance_disabled = ?6, version = version + 1, updated_at = ?7
             WHERE id = ?8 AND user_id = ?9",
            record.level.table()
        );
        self.with_conn(|conn| {
            let changed = conn.execute(
                &sql,
                params![
                    record.data.to_string(),
                    record.local_overrides.to_string(),
                    serde_json::to_string(&record.insights)?,
                    serde_json::to_string(&record.progress)?,
                    record.delegation_rules.to_string(),
                    record.inheritance_disabled,
                    now,
                    &record.id,
                    &record.user_id,
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            get_context_internal(conn, record.level, &record.id, &record.user_id)
        })
    }

    pub fn delete_context(&self, level: ContextLevel, context_id: &str, user_id: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?1 AND user_id = ?2", level.table());
        self.with_conn(|conn| {
            let removed = conn.execute(&sql, params![context_id, user_id])?;
            Ok(removed > 0)
        })
    }

    /// Contexts of one level owned by the user, most recently updated first.
    pub fn list_contexts(
        &self,
        level: ContextLevel,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ContextRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE user_id = ?1 ORDER BY updated_at DESC, id ASC LIMIT ?2 OFFSET ?3",
            level.table()
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params![user_id, limit, offset], |row| parse_context_row(level, row))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    /// Whether the entity behind a context exists and belongs to the user.
    /// The global level always exists.
    pub fn context_entity_exists(&self, level: ContextLevel, entity_id: &str, user_id: &str) -> Result<bool> {
        let table = match level {
            ContextLevel::Global => return Ok(true),
            ContextLevel::Project => "projects",
            ContextLevel::Branch => "branches",
            ContextLevel::Task => "tasks",
        };
        let sql = format!("SELECT 1 FROM {} WHERE id = ?1 AND user_id = ?2", table);
        self.with_conn(|conn| {
            let found: Option<i64> = optional(conn.query_row(&sql, params![entity_id, user_id], |r| r.get(0)))?;
            Ok(found.is_some())
        })
    }

    /// Id of the parent entity: task → branch, branch → project, project → the
    /// user's global context id.
    pub fn context_entity_parent(
        &self,
        level: ContextLevel,
        entity_id: &str,
        user_id: &str,
    ) -> Result<Option<String>> {
        let sql = match level {
            ContextLevel::Global => return Ok(None),
            ContextLevel::Project => return Ok(Some(user_id.to_string())),
            ContextLevel::Branch => "SELECT project_id FROM branches WHERE id = ?1 AND user_id = ?2",
            ContextLevel::Task => "SELECT branch_id FROM tasks WHERE id = ?1 AND user_id = ?2",
        };
        self.with_conn(|conn| optional(conn.query_row(sql, params![entity_id, user_id], |r| r.get(0))))
    }

    /// Every entity below the given one, for downward cache invalidation.
    pub fn context_descendants(
        &self,
        level: ContextLevel,
        entity_id: &str,
        user_id: &str,
    ) -> Result<Vec<(ContextLevel, String)>> {
        self.with_conn(|conn| {
            let mut out = Vec::new();
            match level {
                ContextLevel::Global => {
                    for id in ids(conn, "SELECT id FROM projects WHERE user_id = ?1", params![user_id])? {
                        out.push((ContextLevel::Project, id));
                    }
                    for id in ids(conn, "SELECT id FROM branches WHERE user_id = ?1", params![user_id])? {
                        out.push((ContextLevel::Branch, id));
                    }
                    for id in ids(conn, "SELECT id FROM tasks WHERE user_id = ?1", params![user_id])? {
                        out.push((ContextLevel::Task, id));
                    }
                }
                ContextLevel::Project => {
                    for id in ids(
                        conn,
                        "SELECT id FROM branches WHERE project_id = ?1 AND user_id = ?2",
                        params![entity_id, user_id],
                    )? {
                        out.push((ContextLevel::Branch, id));
                    }
                    for id in ids(
                        conn,
                        "SELECT t.id FROM tasks t JOIN branches b ON b.id = t.branch_id
                         WHERE b.project_id = ?1 AND t.user_id = ?2",
                        params![entity_id, user_id],
                    )? {
                        out.push((ContextLevel::Task, id));
                    }
                }
                ContextLevel::Branch => {
                    for id in ids(
                        conn,
                        "SELECT id FROM tasks WHERE branch_id = ?1 AND user_id = ?2",
                        params![entity_id, user_id],
                    )? {
                        out.push((ContextLevel::Task, id));
                    }
                }
                ContextLevel::Task => {}
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use serde_json::json;

    #[test]
    fn insert_get_save_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let global = ContextRecord::new(ContextLevel::Global, "u1", None, "u1", now_ms());
        db.insert_context(&global).unwrap();

        let project = db.create_project("u1", "alpha", "", None).unwrap();
        let mut record = ContextRecord::new(
            ContextLevel::Project,
            &project.id,
            Some("u1".into()),
            "u1",
            now_ms(),
        );
        record.data = json!({"lang": "rust"});
        db.insert_context(&record).unwrap();

        let mut stored = db
            .get_context(ContextLevel::Project, &project.id, "u1")
            .unwrap()
            .unwrap();
        assert_eq!(stored.parent_id.as_deref(), Some("u1"));
        assert_eq!(stored.version, 1);

        stored.insights.push(json!({"content": "use workspaces"}));
        let saved = db.save_context(&stored).unwrap().unwrap();
        assert_eq!(saved.version, 2);
        assert_eq!(saved.insights.len(), 1);
    }

    #[test]
    fn duplicate_context_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let global = ContextRecord::new(ContextLevel::Global, "u1", None, "u1", now_ms());
        db.insert_context(&global).unwrap();
        assert!(db.insert_context(&global).is_err());
    }

    #[test]
    fn entity_navigation() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("u1", "alpha", "", None).unwrap();
        let branch = db.create_branch("u1", &project.id, "main", "", Priority::Medium).unwrap();

        assert!(db.context_entity_exists(ContextLevel::Branch, &branch.id, "u1").unwrap());
        assert!(!db.context_entity_exists(ContextLevel::Branch, &branch.id, "u2").unwrap());
        assert_eq!(
            db.context_entity_parent(ContextLevel::Branch, &branch.id, "u1").unwrap(),
            Some(project.id.clone())
        );

        let below = db.context_descendants(ContextLevel::Project, &project.id, "u1").unwrap();
        assert_eq!(below, vec![(ContextLevel::Branch, branch.id)]);
    }
}
