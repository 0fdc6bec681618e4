//! SQLite connection pool on r2d2.
//!
//! `pool_size` connections stay open; under load up to `max_overflow` more are
//! opened and closed again once they sit idle past `idle_timeout_seconds`.
//! Connections older than `recycle_seconds` are replaced, and `pre_ping`
//! tests each connection on checkout.

use crate::config::PoolConfig;
use r2d2::event::{AcquireEvent, CheckoutEvent, ReleaseEvent, TimeoutEvent};
use r2d2::{HandleEvent, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Pool failures.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no database connection available within {timeout:?}: {source}")]
    Exhausted {
        timeout: Duration,
        #[source]
        source: r2d2::Error,
    },
    #[error("failed to open database connections: {0}")]
    Build(#[source] r2d2::Error),
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_size: usize,
    pub max_overflow: usize,
    /// Open connections, including ones still being established.
    pub connections: usize,
    pub idle: usize,
    pub checked_out: usize,
    /// Open connections beyond `pool_size`.
    pub overflow: usize,
    pub total_created: u64,
    pub total_closed: u64,
    pub total_checkouts: u64,
    pub total_timeouts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    closed: AtomicU64,
    checkouts: AtomicU64,
    timeouts: AtomicU64,
}

/// r2d2 event hook feeding [`Counters`].
#[derive(Debug)]
struct CountingHandler(Arc<Counters>);

impl HandleEvent for CountingHandler {
    fn handle_acquire(&self, event: AcquireEvent) {
        self.0.created.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = event.connection_id(), "Opened database connection");
    }

    fn handle_release(&self, event: ReleaseEvent) {
        self.0.closed.fetch_add(1, Ordering::Relaxed);
        debug!(
            connection_id = event.connection_id(),
            age_ms = event.age().as_millis() as u64,
            "Closed database connection"
        );
    }

    fn handle_checkout(&self, _event: CheckoutEvent) {
        self.0.checkouts.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_timeout(&self, event: TimeoutEvent) {
        self.0.timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(timeout_ms = event.timeout().as_millis() as u64, "Connection pool exhausted");
    }
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

fn as_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Thread-safe pool of rusqlite connections.
pub struct ConnectionPool {
    pool: Pool<SqliteConnectionManager>,
    config: PoolConfig,
    counters: Arc<Counters>,
}

impl ConnectionPool {
    /// Build the pool, opening `pool_size` connections up front.
    pub fn new(config: PoolConfig, manager: SqliteConnectionManager) -> Result<Self, PoolError> {
        let counters = Arc::new(Counters::default());
        let pool_size = config.pool_size.max(1);
        let pool = Pool::builder()
            .max_size(as_u32(pool_size + config.max_overflow))
            .min_idle(Some(as_u32(pool_size)))
            .max_lifetime(seconds(config.recycle_seconds))
            .idle_timeout(seconds(config.idle_timeout_seconds))
            .test_on_check_out(config.pre_ping)
            .connection_timeout(Duration::from_millis(config.timeout_ms))
            .event_handler(Box::new(CountingHandler(Arc::clone(&counters))))
            .build(manager)
            .map_err(PoolError::Build)?;

        Ok(Self {
            pool,
            config,
            counters,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connection, waiting up to the configured timeout.
    pub fn get(&self) -> Result<PooledConnection, PoolError> {
        self.pool.get().map_err(|source| PoolError::Exhausted {
            timeout: self.pool.connection_timeout(),
            source,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.pool.state();
        let connections = state.connections as usize;
        let idle = state.idle_connections as usize;
        PoolStats {
            pool_size: self.config.pool_size,
            max_overflow: self.config.max_overflow,
            connections,
            idle,
            checked_out: connections.saturating_sub(idle),
            overflow: connections.saturating_sub(self.config.pool_size),
            total_created: self.counters.created.load(Ordering::Relaxed),
            total_closed: self.counters.closed.load(Ordering::Relaxed),
            total_checkouts: self.counters.checkouts.load(Ordering::Relaxed),
            total_timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_pool(pool_size: usize, max_overflow: usize, timeout_ms: u64) -> ConnectionPool {
        ConnectionPool::new(
            PoolConfig {
                pool_size,
                max_overflow,
                recycle_seconds: 0,
                idle_timeout_seconds: 0,
                timeout_ms,
                pre_ping: true,
            },
            SqliteConnectionManager::memory(),
        )
        .unwrap()
    }

    #[test]
    fn connections_are_reused() {
        let pool = memory_pool(1, 0, 1_000);
        {
            let conn = pool.get().unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.checked_out, 0);

        let conn = pool.get().unwrap();
        conn.execute("INSERT INTO t VALUES (1)", []).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_checkouts, 2);
    }

    #[test]
    fn overflow_is_bounded() {
        let pool = memory_pool(1, 2, 1_000);
        let _a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        let _c = pool.get().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.connections, 3);
        assert_eq!(stats.checked_out, 3);
        assert_eq!(stats.overflow, 2);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = memory_pool(1, 0, 50);
        let _held = pool.get().unwrap();
        match pool.get() {
            Err(PoolError::Exhausted { .. }) => {}
            Err(other) => panic!("expected exhaustion, got {}", other),
            Ok(_) => panic!("expected exhaustion"),
        }
        assert_eq!(pool.stats().total_timeouts, 1);
    }

    #[test]
    fn waiter_gets_released_connection() {
        let pool = Arc::new(memory_pool(1, 0, 2_000));
        let held = pool.get().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.get().is_ok())
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn init_hook_runs_on_every_connection() {
        let pool = ConnectionPool::new(
            PoolConfig {
                pool_size: 2,
                ..PoolConfig::default()
            },
            SqliteConnectionManager::memory().with_init(|conn| conn.execute_batch("PRAGMA foreign_keys=ON;")),
        )
        .unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        for conn in [&a, &b] {
            let enabled: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0)).unwrap();
            assert_eq!(enabled, 1);
        }
    }
}
