//! Project persistence. Every query is scoped to the owning user.

use super::branches::delete_branch_tx;
use super::{Database, now_ms, optional, parse_column, parse_json};
use crate::config::deep_merge;
use crate::error::ApiError;
use crate::types::{DeletionReport, Project, ProjectStatus, ProjectUpdate};
use anyhow::Result;
use rusqlite::{Connection, Row, params};

fn parse_project_row(row: &Row) -> rusqlite::Result<Project> {
    let metadata: String = row.get("metadata")?;
    Ok(Project {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        user_id: row.get("user_id")?,
        status: parse_column("status", row.get("status")?)?,
        metadata: parse_json(&metadata),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub(crate) fn get_project_internal(
    conn: &Connection,
    user_id: &str,
    project_id: &str,
) -> Result<Option<Project>> {
    optional(conn.query_row(
        "SELECT * FROM projects WHERE id = ?1 AND user_id = ?2",
        params![project_id, user_id],
        parse_project_row,
    ))
}

fn name_taken(conn: &Connection, user_id: &str, name: &str, except: Option<&str>) -> Result<bool> {
    let found: Option<String> = optional(conn.query_row(
        "SELECT id FROM projects WHERE user_id = ?1 AND name = ?2",
        params![user_id, name],
        |row| row.get(0),
    ))?;
    Ok(matches!(found, Some(id) if Some(id.as_str()) != except))
}

impl Database {
    /// Create a project. Names are unique per user.
    pub fn create_project(
        &self,
        user_id: &str,
        name: &str,
        description: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Project> {
        let now = now_ms();
        let project = Project {
            id: super::new_id(),
            name: name.to_string(),
            description: description.to_string(),
            user_id: user_id.to_string(),
            status: ProjectStatus::Active,
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
            created_at: now,
            updated_at: now,
        };

        self.with_conn(|conn| {
            if name_taken(conn, user_id, name, None)? {
                return Err(ApiError::already_exists(format!("Project '{}' already exists", name)).into());
            }
            conn.execute(
                "INSERT INTO projects (id, name, description, user_id, status, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    &project.id,
                    &project.name,
                    &project.description,
                    &project.user_id,
                    project.status.as_str(),
                    project.metadata.to_string(),
                    project.created_at,
                    project.updated_at,
                ],
            )?;
            Ok(())
        })?;

        Ok(project)
    }

    pub fn get_project(&self, user_id: &str, project_id: &str) -> Result<Option<Project>> {
        self.with_conn(|conn| get_project_internal(conn, user_id, project_id))
    }

    /// List a user's projects, newest first.
    pub fn list_projects(
        &self,
        user_id: &str,
        status: Option<ProjectStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Project>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM projects
                 WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3 OFFSET ?4",
            )?;
            let projects = stmt
                .query_map(
                    params![user_id, status.map(|s| s.as_str()), limit, offset],
                    parse_project_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(projects)
        })
    }

    /// Apply a partial update. Returns `None` when the project does not exist.
    pub fn update_project(
        &self,
        user_id: &str,
        project_id: &str,
        update: &ProjectUpdate,
    ) -> Result<Option<Project>> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let Some(mut project) = get_project_internal(&tx, user_id, project_id)? else {
                return Ok(None);
            };

            if let Some(ref name) = update.name {
                if name_taken(&tx, user_id, name, Some(project_id))? {
                    return Err(ApiError::already_exists(format!("Project '{}' already exists", name)).into());
                }
                project.name = name.clone();
            }
            if let Some(ref description) = update.description {
                project.description = description.clone();
            }
            if let Some(status) = update.status {
                project.status = status;
            }
            if let Some(ref metadata) = update.metadata {
                project.metadata = deep_merge(project.metadata.take(), metadata.clone());
            }
            project.updated_at = now;

            tx.execute(
                "UPDATE projects SET name = ?1, description = ?2, status = ?3, metadata = ?4, updated_at = ?5
                 WHERE id = ?6 AND user_id = ?7",
                params![
                    &project.name,
                    &project.description,
                    project.status.as_str(),
                    project.metadata.to_string(),
                    now,
                    project_id,
                    user_id,
                ],
            )?;
            tx.commit()?;
            Ok(Some(project))
        })
    }

    /// Delete a project and everything below it in one transaction.
    ///
    /// Runs the branch deletion sequence for every branch, then removes the
    /// project context and the project itself.
    pub fn delete_project(&self, user_id: &str, project_id: &str) -> Result<Option<DeletionReport>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if get_project_internal(&tx, user_id, project_id)?.is_none() {
                return Ok(None);
            }

            let branch_ids: Vec<String> = {
                let mut stmt =
                    tx.prepare("SELECT id FROM branches WHERE project_id = ?1 AND user_id = ?2")?;
                stmt.query_map(params![project_id, user_id], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut report = DeletionReport::default();
            for branch_id in &branch_ids {
                report.absorb(&delete_branch_tx(&tx, user_id, branch_id)?);
            }

            tx.execute(
                "DELETE FROM context_inheritance_cache WHERE context_id = ?1 AND user_id = ?2",
                params![project_id, user_id],
            )?;
            report.project_contexts = tx.execute(
                "DELETE FROM project_contexts WHERE id = ?1 AND user_id = ?2",
                params![project_id, user_id],
            )?;
            report.projects = tx.execute(
                "DELETE FROM projects WHERE id = ?1 AND user_id = ?2",
                params![project_id, user_id],
            )?;

            tx.commit()?;
            Ok(Some(report))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_and_list_scoped_by_user() {
        let db = Database::open_in_memory().unwrap();
        db.create_project("u1", "alpha", "", None).unwrap();
        db.create_project("u1", "beta", "", None).unwrap();
        db.create_project("u2", "alpha", "", None).unwrap();

        let mine = db.list_projects("u1", None, 50, 0).unwrap();
        assert_eq!(mine.len(), 2);
        let theirs = db.list_projects("u2", None, 50, 0).unwrap();
        assert_eq!(theirs.len(), 1);
    }

    #[test]
    fn duplicate_name_conflicts() {
        let db = Database::open_in_memory().unwrap();
        db.create_project("u1", "alpha", "", None).unwrap();
        let err: ApiError = db.create_project("u1", "alpha", "", None).unwrap_err().into();
        assert_eq!(err.code, crate::error::ErrorCode::AlreadyExists);
    }

    #[test]
    fn other_users_cannot_read() {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("u1", "alpha", "", None).unwrap();
        assert!(db.get_project("u2", &project.id).unwrap().is_none());
        assert!(db.delete_project("u2", &project.id).unwrap().is_none());
    }

    #[test]
    fn update_merges_metadata() {
        let db = Database::open_in_memory().unwrap();
        let project = db
            .create_project("u1", "alpha", "", Some(json!({"repo": {"url": "x", "default": "main"}})))
            .unwrap();
        let updated = db
            .update_project(
                "u1",
                &project.id,
                &ProjectUpdate {
                    status: Some(ProjectStatus::Archived),
                    metadata: Some(json!({"repo": {"default": "dev"}})),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, ProjectStatus::Archived);
        assert_eq!(updated.metadata, json!({"repo": {"url": "x", "default": "dev"}}));

        let archived = db
            .list_projects("u1", Some(ProjectStatus::Archived), 50, 0)
            .unwrap();
        assert_eq!(archived.len(), 1);
    }
}
