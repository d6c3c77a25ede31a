//! Store layer: schema, pragmas, transaction helpers, and busy-retry.
//!
//! A single SQLite file under `<project>/.aqua/aqua.db`, opened in WAL mode
//! with a busy timeout so concurrent writers serialize instead of failing.
//! Schema advances through [`migrations::MIGRATIONS`], a forward-only list
//! applied once per version bump and tracked in `PRAGMA user_version`.

mod migrations;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous, SqliteTransactionBehavior,
};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::{AquaError, Result};
use crate::retry::{busy_retry_config, retry_with_backoff};

/// Busy timeout passed to SQLite itself, independent of the application-level
/// retry loop: a writer holding the lock for longer than this is a bug, not
/// contention we should patiently wait out.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    root: PathBuf,
}

impl Store {
    /// Open (creating if absent) the store under `<project_root>/.aqua/`.
    pub async fn open(project_root: &Path) -> Result<Self> {
        let aqua_dir = project_root.join(".aqua");
        tokio::fs::create_dir_all(&aqua_dir)
            .await
            .map_err(|e| AquaError::Store(sqlx::Error::Io(e)))?;
        set_restrictive_dir_perms(&aqua_dir);

        let db_path = aqua_dir.join("aqua.db");
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .map_err(sqlx::Error::from)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true)
            // Every write transaction acquires the writer lock up front
            // instead of lazily upgrading from a read lock, which is what
            // makes two competing "read candidate, then write" transactions
            // serialize instead of deadlock.
            .transaction_behavior(SqliteTransactionBehavior::Immediate);

        let pool = SqlitePool::connect_with(opts).await?;
        apply_pragmas(&pool).await?;
        migrate(&pool).await?;
        set_restrictive_file_perms(&db_path);

        Ok(Self {
            pool,
            root: project_root.to_path_buf(),
        })
    }

    /// Root project directory this store was opened under (used by the
    /// identity module to locate `.aqua/sessions/`).
    pub fn project_root(&self) -> &Path {
        &self.root
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin an immediate-write transaction. The connection's
    /// `transaction_behavior` is set to `Immediate` at connect time, so this
    /// is a plain `begin()` — every writer takes the lock up front rather
    /// than deadlocking on a shared-to-exclusive upgrade. Acquiring the
    /// writer slot is exactly where a competing writer surfaces "database is
    /// locked", so this is the one place every write path funnels through
    /// [`Store::with_busy_retry`] (spec §4.1's five-attempt backoff).
    pub async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>> {
        self.with_busy_retry(|| async { Ok(self.pool.begin().await?) }).await
    }

    /// Run `op` with busy-retry: up to five retries with exponential backoff
    /// and jitter when SQLite reports the database is locked or busy.
    pub async fn with_busy_retry<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let cfg = busy_retry_config();
        let max_attempts = cfg.max_attempts;
        let result = retry_with_backoff(&cfg, || async { op().await.map_err(StoreRetryError) }).await;
        result.map_err(|StoreRetryError(e)| match e {
            AquaError::Store(ref sqlx_err) if crate::retry::is_busy(sqlx_err) => {
                AquaError::StoreBusy {
                    attempts: max_attempts,
                }
            }
            other => other,
        })
    }
}

/// Wrapper so `AquaError` (which does not implement `Debug` cleanly for every
/// variant's inner type) satisfies `retry_with_backoff`'s `E: Debug` bound.
struct StoreRetryError(AquaError);

impl std::fmt::Debug for StoreRetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<()> {
    for pragma in [
        "PRAGMA cache_size = -32768",
        "PRAGMA mmap_size = 134217728",
        "PRAGMA wal_autocheckpoint = 4096",
        "PRAGMA temp_store = MEMORY",
    ] {
        sqlx::query(pragma).execute(pool).await?;
    }
    Ok(())
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    let current_version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;

    let target_version = migrations::MIGRATIONS.len() as i64;
    if current_version >= target_version {
        return Ok(());
    }

    for sql in &migrations::MIGRATIONS[current_version as usize..] {
        for stmt in sql.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }
    }

    sqlx::query(&format!("PRAGMA user_version = {target_version}"))
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(unix)]
fn set_restrictive_dir_perms(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o700);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_restrictive_dir_perms(_path: &Path) {}

#[cfg(unix)]
fn set_restrictive_file_perms(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_restrictive_file_perms(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_aqua_dir_and_applies_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();

        assert!(dir.path().join(".aqua").join("aqua.db").is_file());

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM agents")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn migrate_is_idempotent_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let _first = Store::open(dir.path()).await.unwrap();
        let second = Store::open(dir.path()).await.unwrap();

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(second.pool())
            .await
            .unwrap();
        assert_eq!(version, migrations::MIGRATIONS.len() as i64);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn aqua_dir_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let _store = Store::open(dir.path()).await.unwrap();
        let meta = std::fs::metadata(dir.path().join(".aqua")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }
}
