use std::path::{Path, PathBuf};
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use sea_orm::DatabaseBackend;

use crate::error::DbInfraError;

/// Runtime profile; selects the database name and safety rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnv {
    Prod,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Postgres,
    SqliteFile,
    SqliteMemory,
}

impl From<DbKind> for DatabaseBackend {
    fn from(kind: DbKind) -> Self {
        match kind {
            DbKind::Postgres => DatabaseBackend::Postgres,
            DbKind::SqliteFile | DbKind::SqliteMemory => DatabaseBackend::Sqlite,
        }
    }
}

pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";
pub const DEFAULT_MODEL_PATH: &str = "schema/model.json";
pub const DEFAULT_POSTGRES_USER: &str = "postgres";
pub const DEFAULT_POSTGRES_PASSWORD: &str = "postgres";
pub const DEFAULT_POSTGRES_DB: &str = "app";

/// Everything one `migration` invocation needs, resolved once up front.
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub env: RuntimeEnv,
    pub db_kind: DbKind,
    pub database_url: String,
    pub store_dir: PathBuf,
    pub model_path: PathBuf,
    pub lock_timeout: Duration,
    sqlite_path: Option<PathBuf>,
}

impl MigrateConfig {
    /// Resolve configuration from the process environment.
    pub fn from_env(env: RuntimeEnv, db_kind: DbKind) -> Result<Self, DbInfraError> {
        Self::from_lookup(env, db_kind, |name| std::env::var(name).ok())
    }

    /// Resolve configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(env: RuntimeEnv, db_kind: DbKind, lookup: F) -> Result<Self, DbInfraError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let sqlite_path = match db_kind {
            DbKind::SqliteFile => Some(PathBuf::from(must_var(&var, "SQLITE_DB_PATH")?)),
            _ => None,
        };
        let database_url = make_conn_spec(env, db_kind, &var)?;

        let lock_timeout = match var("MIGRATE_LOCK_TIMEOUT_MS") {
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                DbInfraError::config(format!(
                    "MIGRATE_LOCK_TIMEOUT_MS must be a number of milliseconds, got '{raw}'"
                ))
            })?,
            None => match env {
                RuntimeEnv::Test => 3_000,
                RuntimeEnv::Prod => 10_000,
            },
        };

        Ok(Self {
            env,
            db_kind,
            database_url,
            store_dir: var("MIGRATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MIGRATIONS_DIR)),
            model_path: var("MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            lock_timeout: Duration::from_millis(lock_timeout),
            sqlite_path,
        })
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = dir.into();
        self
    }

    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = path.into();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.db_kind.into()
    }

    /// Connection URL with the password masked, for logs.
    pub fn sanitized_url(&self) -> String {
        sanitize_db_url(&self.database_url)
    }

    /// Lock file serializing `generate` runs against the same artifact store.
    pub fn store_lock_path(&self) -> PathBuf {
        self.store_dir.join(".generate.lock")
    }

    /// Lock file next to a SQLite database file: `<db>.migrate.lock`.
    pub fn sqlite_lock_path(&self) -> Result<PathBuf, DbInfraError> {
        match (&self.db_kind, &self.sqlite_path) {
            (DbKind::SqliteFile, Some(path)) => Ok(sqlite_lock_path(path)),
            _ => Err(DbInfraError::config(format!(
                "a lock file only exists for sqlite-file databases, not {:?}",
                self.db_kind
            ))),
        }
    }
}

pub fn sqlite_lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "sqlite".into());
    name.push(".migrate.lock");
    db_path.with_file_name(name)
}

fn make_conn_spec<F>(env: RuntimeEnv, db_kind: DbKind, var: &F) -> Result<String, DbInfraError>
where
    F: Fn(&str) -> Option<String>,
{
    match db_kind {
        DbKind::SqliteMemory => Ok("sqlite::memory:".to_string()),
        DbKind::SqliteFile => {
            let path = must_var(var, "SQLITE_DB_PATH")?;
            Ok(format!("sqlite://{path}?mode=rwc"))
        }
        DbKind::Postgres => {
            if let Some(url) = var("DATABASE_URL") {
                if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                    return Err(DbInfraError::config(format!(
                        "DATABASE_URL must be a postgres URL, got '{}'",
                        sanitize_db_url(&url)
                    )));
                }
                return Ok(url);
            }

            let host = var("POSTGRES_SERVER").unwrap_or_else(|| "localhost".to_string());
            let port = var("POSTGRES_PORT").unwrap_or_else(|| "5432".to_string());
            let db_name = db_name(env, var)?;
            let user = var("POSTGRES_USER").unwrap_or_else(|| DEFAULT_POSTGRES_USER.to_string());
            let password = var("POSTGRES_PASSWORD")
                .unwrap_or_else(|| DEFAULT_POSTGRES_PASSWORD.to_string());
            let user = utf8_percent_encode(&user, NON_ALPHANUMERIC);
            let password = utf8_percent_encode(&password, NON_ALPHANUMERIC);

            Ok(format!(
                "postgresql://{user}:{password}@{host}:{port}/{db_name}"
            ))
        }
    }
}

fn db_name<F>(env: RuntimeEnv, var: &F) -> Result<String, DbInfraError>
where
    F: Fn(&str) -> Option<String>,
{
    match env {
        RuntimeEnv::Prod => Ok(var("POSTGRES_DB")
            .unwrap_or_else(|| DEFAULT_POSTGRES_DB.to_string())),
        RuntimeEnv::Test => {
            let db_name = must_var(var, "TEST_DB")?;
            // Enforce safety: test DB must end with "_test"
            if !db_name.ends_with("_test") {
                return Err(DbInfraError::config(format!(
                    "Test profile requires database name to end with '_test', but got: '{db_name}'"
                )));
            }
            Ok(db_name)
        }
    }
}

fn must_var<F>(var: &F, name: &str) -> Result<String, DbInfraError>
where
    F: Fn(&str) -> Option<String>,
{
    var(name).ok_or_else(|| {
        DbInfraError::config(format!("Required environment variable '{name}' is not set"))
    })
}

/// Mask the password in a connection URL.
pub fn sanitize_db_url(url: &str) -> String {
    let Some((auth, host)) = url.rsplit_once('@') else {
        return url.to_string();
    };
    let Some((scheme, credentials)) = auth.split_once("://") else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}
