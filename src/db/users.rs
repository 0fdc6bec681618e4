//! User account persistence.

use super::{Database, now_ms, optional, parse_column, parse_json};
use crate::auth::domain::{User, UserRole};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, Row, params};

const USER_COLUMNS: &str = "id, email, username, password_hash, status, roles, auth_provider,
     refresh_token_family, refresh_token_version, last_login_at, created_at, updated_at";

fn parse_user_row(row: &Row) -> rusqlite::Result<User> {
    let roles_json: String = row.get("roles")?;
    Ok(User {
        id: row.get("id")?,
        email: row.get("email")?,
        username: row.get("username")?,
        password_hash: row.get("password_hash")?,
        status: parse_column("status", row.get("status")?)?,
        roles: parse_json::<Vec<UserRole>>(&roles_json),
        auth_provider: row.get("auth_provider")?,
        refresh_token_family: row.get("refresh_token_family")?,
        refresh_token_version: row.get("refresh_token_version")?,
        last_login_at: row.get("last_login_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn get_user_internal(conn: &Connection, user_id: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    optional(conn.query_row(&sql, params![user_id], parse_user_row))
}

impl Database {
    /// Insert a new user. Email and username must be unique.
    pub fn insert_user(&self, user: &User) -> Result<()> {
        let roles_json = serde_json::to_string(&user.roles)?;
        self.with_conn(|conn| {
            let taken: bool = conn
                .query_row(
                    "SELECT 1 FROM users WHERE email = ?1 OR username = ?2",
                    params![&user.email, &user.username],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if taken {
                return Err(anyhow!("email or username already registered"));
            }

            conn.execute(
                "INSERT INTO users (id, email, username, password_hash, status, roles, auth_provider,
                     refresh_token_family, refresh_token_version, last_login_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    &user.id,
                    &user.email,
                    &user.username,
                    &user.password_hash,
                    user.status.as_str(),
                    roles_json,
                    &user.auth_provider,
                    &user.refresh_token_family,
                    user.refresh_token_version,
                    user.last_login_at,
                    user.created_at,
                    user.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        self.with_conn(|conn| get_user_internal(conn, user_id))
    }

    /// Look up a user by email (case-insensitive) or exact username.
    pub fn find_user_by_login(&self, login: &str) -> Result<Option<User>> {
        let login = login.trim();
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM users WHERE email = ?1 OR username = ?2",
                USER_COLUMNS
            );
            optional(conn.query_row(&sql, params![login.to_lowercase(), login], parse_user_row))
        })
    }

    pub fn update_password_hash(&self, user_id: &str, password_hash: &str) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
                params![password_hash, now, user_id],
            )?;
            if changed == 0 {
                return Err(anyhow!("user not found: {}", user_id));
            }
            Ok(())
        })
    }

    /// Persist the refresh-token family/version of a user.
    pub fn save_refresh_state(&self, user: &User) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET refresh_token_family = ?1, refresh_token_version = ?2,
                     updated_at = ?3 WHERE id = ?4",
                params![&user.refresh_token_family, user.refresh_token_version, now, &user.id],
            )?;
            Ok(())
        })
    }

    /// Advance a refresh family from `expected` to `next` only if it is still
    /// at `expected`. Returns false when another refresh got there first.
    pub fn rotate_refresh_token(&self, user_id: &str, family: &str, expected: i64, next: i64) -> Result<bool> {
        let now = now_ms();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET refresh_token_version = ?1, updated_at = ?2
                 WHERE id = ?3 AND refresh_token_family = ?4 AND refresh_token_version = ?5",
                params![next, now, user_id, family, expected],
            )?;
            Ok(changed == 1)
        })
    }

    /// Revoke a refresh family if it is still the user's current one.
    pub fn revoke_refresh_family(&self, user_id: &str, family: &str) -> Result<bool> {
        let now = now_ms();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET refresh_token_family = NULL,
                     refresh_token_version = refresh_token_version + 1, updated_at = ?1
                 WHERE id = ?2 AND refresh_token_family = ?3",
                params![now, user_id, family],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn record_login(&self, user_id: &str) -> Result<i64> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_login_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![now, user_id],
            )?;
            Ok(now)
        })
    }

    pub fn set_user_status(&self, user_id: &str, status: crate::auth::domain::UserStatus) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, user_id],
            )?;
            Ok(())
        })
    }

    /// Create or refresh the local shadow of an externally authenticated user.
    ///
    /// Email/username collisions with other accounts are resolved by suffixing
    /// the username with the user id, and leaving the email of the existing row.
    pub fn upsert_external_user(
        &self,
        user_id: &str,
        email: &str,
        username: &str,
        roles: &[UserRole],
        provider: &str,
    ) -> Result<User> {
        let now = now_ms();
        let roles_json = serde_json::to_string(roles)?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let existing = get_user_internal(&tx, user_id)?;
            if existing.is_some() {
                tx.execute(
                    "UPDATE users SET roles = ?1, auth_provider = ?2, updated_at = ?3 WHERE id = ?4",
                    params![roles_json, provider, now, user_id],
                )?;
            } else {
                let username_taken: bool = tx
                    .query_row(
                        "SELECT 1 FROM users WHERE username = ?1",
                        params![username],
                        |_| Ok(true),
                    )
                    .unwrap_or(false);
                let username = if username_taken {
                    format!("{}-{}", username, &user_id[..user_id.len().min(8)])
                } else {
                    username.to_string()
                };
                let email_taken: bool = tx
                    .query_row(
                        "SELECT 1 FROM users WHERE email = ?1",
                        params![email],
                        |_| Ok(true),
                    )
                    .unwrap_or(false);
                let email = if email_taken {
                    format!("{}+{}", user_id, email)
                } else {
                    email.to_string()
                };
                tx.execute(
                    "INSERT INTO users (id, email, username, password_hash, status, roles,
                         auth_provider, refresh_token_version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, NULL, 'active', ?4, ?5, 0, ?6, ?6)",
                    params![user_id, email, username, roles_json, provider, now],
                )?;
            }

            let user = get_user_internal(&tx, user_id)?
                .ok_or_else(|| anyhow!("user vanished during upsert: {}", user_id))?;
            tx.commit()?;
            Ok(user)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::domain::{Email, UserStatus};

    fn sample_user(email: &str, username: &str) -> User {
        User::new_local(
            Email::parse(email).unwrap(),
            username.to_string(),
            "hash".to_string(),
            now_ms(),
        )
    }

    #[test]
    fn insert_and_find_by_email_or_username() {
        let db = Database::open_in_memory().unwrap();
        let user = sample_user("eve@example.com", "eve");
        db.insert_user(&user).unwrap();

        let by_email = db.find_user_by_login("EVE@example.com").unwrap().unwrap();
        assert_eq!(by_email.id, user.id);
        let by_name = db.find_user_by_login("eve").unwrap().unwrap();
        assert_eq!(by_name.id, user.id);
        assert_eq!(by_name.roles, vec![UserRole::User]);
    }

    #[test]
    fn duplicate_email_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.insert_user(&sample_user("eve@example.com", "eve")).unwrap();
        assert!(db.insert_user(&sample_user("eve@example.com", "eve2")).is_err());
    }

    #[test]
    fn refresh_state_persists() {
        let db = Database::open_in_memory().unwrap();
        let mut user = sample_user("fay@example.com", "fay");
        db.insert_user(&user).unwrap();
        let (family, version) = user.start_refresh_family();
        db.save_refresh_state(&user).unwrap();

        let stored = db.get_user(&user.id).unwrap().unwrap();
        assert!(stored.refresh_token_matches(&family, version));
    }

    #[test]
    fn refresh_rotation_is_compare_and_swap() {
        let db = Database::open_in_memory().unwrap();
        let mut user = sample_user("ida@example.com", "ida");
        db.insert_user(&user).unwrap();
        let (family, version) = user.start_refresh_family();
        db.save_refresh_state(&user).unwrap();

        assert!(db.rotate_refresh_token(&user.id, &family, version, version + 1).unwrap());
        assert!(!db.rotate_refresh_token(&user.id, &family, version, version + 1).unwrap());
        assert!(!db.rotate_refresh_token(&user.id, "other-family", version + 1, version + 2).unwrap());

        assert!(db.revoke_refresh_family(&user.id, &family).unwrap());
        assert!(!db.revoke_refresh_family(&user.id, &family).unwrap());
        let stored = db.get_user(&user.id).unwrap().unwrap();
        assert!(stored.refresh_token_family.is_none());
        assert_eq!(stored.refresh_token_version, version + 2);
    }

    #[test]
    fn external_upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let first = db
            .upsert_external_user("kc-1", "gus@example.com", "gus", &[UserRole::User], "keycloak")
            .unwrap();
        let second = db
            .upsert_external_user("kc-1", "gus@example.com", "gus", &[UserRole::Admin], "keycloak")
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.roles, vec![UserRole::Admin]);
        assert!(second.password_hash.is_none());
    }

    #[test]
    fn status_update() {
        let db = Database::open_in_memory().unwrap();
        let user = sample_user("hal@example.com", "hal");
        db.insert_user(&user).unwrap();
        db.set_user_status(&user.id, UserStatus::Suspended).unwrap();
        let stored = db.get_user(&user.id).unwrap().unwrap();
        assert!(!stored.can_login());
    }
}
