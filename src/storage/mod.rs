//! SQLite history store -- schema, execution history, flaky episodes.

pub mod episodes;
pub mod executions;
pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Transaction, TransactionBehavior};

use crate::analysis::model::FlakyEpisode;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

// busy_timeout goes first so a second process waits out the WAL switch
const PRAGMAS: &str = "PRAGMA busy_timeout = 5000;
     PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA temp_store = MEMORY;
     PRAGMA foreign_keys = ON;";

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| c.execute_batch(PRAGMAS));
    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// In-memory database. Pinned to a single connection, since every SQLite
/// `:memory:` connection is its own database.
pub fn open_memory_pool() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Owned handle to the history store for one analysis scope.
///
/// All lifecycle writes of a run go through [`HistoryStore::write_transaction`],
/// which takes SQLite's write lock up front so concurrent runs serialize.
#[derive(Clone)]
pub struct HistoryStore {
    pool: Pool,
}

impl HistoryStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &str) -> Result<Self> {
        tracing::info!(%path, "Opening history store");
        Ok(Self::new(open_pool(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(open_memory_pool()?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run `f` inside one IMMEDIATE transaction. Commits only if `f` succeeds;
    /// any error rolls the whole batch back.
    pub fn write_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.pool.get().context("Failed to get DB connection")?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin write transaction")?;
        let out = f(&tx)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(out)
    }

    /// Open episodes for a project, `days_flaky` evaluated at `reference_ts`.
    pub fn open_episodes(&self, project: &str, reference_ts: i64) -> Result<Vec<FlakyEpisode>> {
        let conn = self.pool.get()?;
        let mut open = episodes::open_episodes(&conn, project)?;
        episodes::refresh_days(&mut open, reference_ts);
        episodes::rank_worst_first(&mut open);
        Ok(open)
    }

    /// Tests flaky the longest (open or fixed), worst first.
    pub fn worst_offenders(
        &self,
        project: &str,
        reference_ts: i64,
        limit: usize,
    ) -> Result<Vec<episodes::Offender>> {
        let conn = self.pool.get()?;
        episodes::worst_offenders(&conn, project, reference_ts, limit)
    }

    pub fn time_to_fix_summary(
        &self,
        project: &str,
        reference_ts: i64,
    ) -> Result<episodes::TimeToFixSummary> {
        let conn = self.pool.get()?;
        episodes::time_to_fix_summary(&conn, project, reference_ts)
    }

    /// Recorded runs for a project.
    pub fn run_count(&self, project: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        executions::run_count(&conn, project)
    }

    /// Release the handle. Pooled connections close once the last clone drops.
    pub fn close(self) {
        tracing::debug!("Closing history store");
        drop(self.pool);
    }
}
