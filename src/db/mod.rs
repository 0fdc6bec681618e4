//! Database layer: pooled SQLite connections, migrations and repositories.

pub mod branches;
pub mod contexts;
pub mod delegations;
pub mod inheritance_cache;
pub mod pool;
pub mod projects;
pub mod stats;
pub mod subtasks;
pub mod tasks;
pub mod users;

use crate::config::PoolConfig;
use anyhow::Result;
use pool::{ConnectionPool, PoolStats};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

// busy_timeout first so concurrent opens wait on the WAL switch.
const FILE_PRAGMAS: &str = "PRAGMA busy_timeout=5000;
     PRAGMA journal_mode=WAL;
     PRAGMA foreign_keys=ON;";

/// Database handle wrapping a pool of SQLite connections.
#[derive(Clone)]
pub struct Database {
    pool: Arc<ConnectionPool>,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P, pool_config: &PoolConfig) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let manager = SqliteConnectionManager::file(&path).with_init(|conn| conn.execute_batch(FILE_PRAGMAS));
        let pool = ConnectionPool::new(pool_config.clone(), manager)?;

        let db = Self {
            pool: Arc::new(pool),
        };
        db.run_migrations()?;
        info!(path = %path.display(), pool_size = pool_config.pool_size, "Database opened");

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    ///
    /// Backed by a single connection that is never recycled, so repository
    /// closures must not nest checkouts.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| conn.execute_batch("PRAGMA foreign_keys=ON;"));
        let pool = ConnectionPool::new(
            PoolConfig {
                pool_size: 1,
                max_overflow: 0,
                recycle_seconds: 0,
                idle_timeout_seconds: 0,
                timeout_ms: 5_000,
                pre_ping: false,
            },
            manager,
        )?;

        let db = Self {
            pool: Arc::new(pool),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Run database migrations.
    pub fn run_migrations(&self) -> Result<()> {
        self.with_conn_mut(|conn| {
            let report = embedded::migrations::runner().run(conn)?;
            for migration in report.applied_migrations() {
                info!(version = migration.version(), name = %migration.name(), "Applied migration");
            }
            Ok(())
        })
    }

    /// Highest applied migration version.
    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let version: Option<i64> = conn.query_row(
                "SELECT MAX(version) FROM refinery_schema_history",
                [],
                |row| row.get(0),
            )?;
            Ok(version)
        })
    }

    /// Execute a function with a pooled connection.
    ///
    /// The closure must not call back into `Database`: nested checkouts can
    /// exhaust a small pool.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.pool.get()?;
        f(&conn)
    }

    /// Execute a function with mutable access to a pooled connection (for transactions).
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.pool.get()?;
        f(&mut conn)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Cheap liveness check used by health endpoints.
    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

/// Get the current timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a new time-sortable identifier.
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Parse a JSON column, falling back to the type's default on malformed data.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Map `QueryReturnedNoRows` to `None`.
pub(crate) fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Parse a stored enum column, surfacing corrupt values as a column conversion error.
pub(crate) fn parse_column<T>(idx: &str, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("{}: {}", idx, e).into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_create_tables() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                     ('users', 'projects', 'branches', 'tasks', 'subtasks', 'global_contexts',
                      'task_contexts', 'context_delegations', 'context_inheritance_cache')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 9);
        assert_eq!(db.schema_version().unwrap(), Some(2));
    }

    #[test]
    fn file_database_reopens_with_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.db");
        {
            let db = Database::open(&path, &PoolConfig::default()).unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO projects (id, name, user_id, created_at, updated_at)
                     VALUES ('p1', 'demo', 'u1', 0, 0)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        }
        let db = Database::open(&path, &PoolConfig::default()).unwrap();
        let name: String = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT name FROM projects WHERE id = 'p1'", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(name, "demo");
        db.ping().unwrap();
    }
}
