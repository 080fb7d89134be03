use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::DbInfraError;

pub fn pg_lock_id(key: &str) -> i64 {
    xxh3_64(key.as_bytes()) as i64
}

/// A held lock. Postgres guards keep the admin-pool handle and the advisory
/// key; file guards keep the OS file handle that carries the lock.
pub struct Guard {
    admin_pool: Option<DatabaseConnection>,
    lock_key: i64,
    file: Option<File>,
    lock_path: Option<PathBuf>,
    released: bool,
}

impl Guard {
    fn postgres(admin_pool: DatabaseConnection, lock_key: i64) -> Self {
        Self {
            admin_pool: Some(admin_pool),
            lock_key,
            file: None,
            lock_path: None,
            released: false,
        }
    }

    fn file(file: File, lock_path: PathBuf) -> Self {
        Self {
            admin_pool: None,
            lock_key: -1,
            file: Some(file),
            lock_path: Some(lock_path),
            released: false,
        }
    }

    fn in_memory() -> Self {
        Self {
            admin_pool: None,
            lock_key: 0,
            file: None,
            lock_path: None,
            released: false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release the lock. Safe to call on an already released guard.
    pub async fn release(&mut self) -> Result<(), DbInfraError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        if let Some(file) = self.file.take() {
            let lock_path = self
                .lock_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "unknown".to_string());

            // Dropping the handle releases the OS lock even if unlock reports an error.
            match fs4::fs_std::FileExt::unlock(&file) {
                Ok(()) => debug!(lock_path = lock_path, "file lock released"),
                Err(e) => debug!(
                    error = %e,
                    lock_path = lock_path,
                    "file unlock returned error (may be benign)"
                ),
            }
            return Ok(());
        }

        let Some(admin_pool) = self.admin_pool.take() else {
            return Ok(());
        };

        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_advisory_unlock($1) AS unlocked",
            vec![self.lock_key.into()],
        );

        match admin_pool.query_one(stmt).await {
            Ok(Some(row)) => {
                let unlocked: bool = row
                    .try_get("", "unlocked")
                    .map_err(|e| DbInfraError::lock(format!("failed to read unlock result: {e}")))?;
                if !unlocked {
                    warn!(
                        code = "PG_UNLOCK_FALSE",
                        lock_key = self.lock_key,
                        "Advisory lock unlock returned false"
                    );
                }
            }
            Ok(None) => warn!(
                lock_key = self.lock_key,
                "No result from advisory lock unlock query"
            ),
            Err(e) => warn!(
                error = %e,
                lock_key = self.lock_key,
                "Failed to unlock advisory lock"
            ),
        }
        Ok(())
    }
}

/// Non-blocking mutual exclusion between concurrent `migration` runs.
#[async_trait]
pub trait BootstrapLock: Send {
    /// Returns `Some(Guard)` if acquired, `None` if another holder has it.
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

/// PostgreSQL session advisory lock.
///
/// INVARIANT: the admin pool is configured with **min=max=1** so every
/// checkout reuses the session that holds the lock.
pub struct PgAdvisoryLock {
    admin_pool: DatabaseConnection,
    lock_key: i64,
}

impl PgAdvisoryLock {
    pub fn new(admin_pool: DatabaseConnection, key: &str) -> Self {
        Self {
            admin_pool,
            lock_key: pg_lock_id(key),
        }
    }
}

#[async_trait]
impl BootstrapLock for PgAdvisoryLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
        let lock_stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_try_advisory_lock($1) AS locked",
            vec![self.lock_key.into()],
        );

        let row = self
            .admin_pool
            .query_one(lock_stmt)
            .await
            .map_err(|e| DbInfraError::lock(format!("failed to acquire advisory lock: {e}")))?
            .ok_or_else(|| DbInfraError::lock("pg_try_advisory_lock returned no row"))?;

        let locked: bool = row
            .try_get("", "locked")
            .map_err(|e| DbInfraError::lock(format!("failed to read lock result: {e}")))?;

        if !locked {
            return Ok(None);
        }
        Ok(Some(Guard::postgres(self.admin_pool.clone(), self.lock_key)))
    }

    fn describe(&self) -> String {
        format!("pg advisory lock {}", self.lock_key)
    }
}

/// OS-level exclusive lock on a lock file. Guards SQLite database files
/// (`<db>.migrate.lock`) and the artifact store during generation.
pub struct FileLock {
    lock_path: PathBuf,
}

impl FileLock {
    /// All processes must resolve the same on-disk path.
    pub fn new(lock_path: &Path) -> Self {
        Self {
            lock_path: lock_path.to_path_buf(),
        }
    }
}

#[async_trait]
impl BootstrapLock for FileLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
        use fs4::fs_std::FileExt;

        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbInfraError::lock(format!(
                    "failed to create lock file directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| {
                DbInfraError::lock(format!(
                    "failed to open lock file {}: {e}",
                    self.lock_path.display()
                ))
            })?;

        match file.try_lock_exclusive() {
            Ok(true) => {
                debug!(lock_path = %self.lock_path.display(), "file lock acquired");
                Ok(Some(Guard::file(file, self.lock_path.clone())))
            }
            Ok(false) => {
                debug!(lock_path = %self.lock_path.display(), "file lock contended");
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(DbInfraError::lock(format!(
                "failed to lock {}: {e}",
                self.lock_path.display()
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("file lock {}", self.lock_path.display())
    }
}

/// No-op lock for in-memory databases, which only one process can see.
pub struct InMemoryLock;

#[async_trait]
impl BootstrapLock for InMemoryLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
        Ok(Some(Guard::in_memory()))
    }

    fn describe(&self) -> String {
        "in-memory (no lock)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_lock_excludes_a_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.db.migrate.lock");

        let mut first = FileLock::new(&path);
        let mut second = FileLock::new(&path);

        let mut guard = first.try_acquire().await.unwrap().expect("first acquire");
        assert!(second.try_acquire().await.unwrap().is_none());

        guard.release().await.unwrap();
        assert!(guard.is_released());
        guard.release().await.unwrap();

        let mut again = second.try_acquire().await.unwrap().expect("acquire after release");
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn in_memory_lock_always_acquires() {
        let mut lock = InMemoryLock;
        let mut a = lock.try_acquire().await.unwrap().unwrap();
        let mut b = lock.try_acquire().await.unwrap().unwrap();
        a.release().await.unwrap();
        b.release().await.unwrap();
    }

    #[test]
    fn pg_lock_id_is_stable_per_key() {
        assert_eq!(pg_lock_id("migration:a"), pg_lock_id("migration:a"));
        assert_ne!(pg_lock_id("migration:a"), pg_lock_id("migration:b"));
    }
}
