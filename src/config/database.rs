use std::path::PathBuf;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_env};
use crate::error::ConfigError;

/// Which database backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Postgres,
    LibSql,
}

impl DatabaseBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::LibSql => "libsql",
        }
    }

    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "libsql" | "sqlite" | "turso" => Ok(Self::LibSql),
            _ => Err(ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: format!("expected 'postgres' or 'libsql', got '{value}'"),
            }),
        }
    }
}

/// Database connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: Option<SecretString>,
    pub pool_size: usize,
    pub libsql_path: PathBuf,
    pub libsql_url: Option<String>,
    pub libsql_auth_token: Option<SecretString>,
}

impl DatabaseConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let backend = optional_env("DATABASE_BACKEND")?
            .map(|value| DatabaseBackend::parse(&value))
            .transpose()?
            .unwrap_or(DatabaseBackend::Postgres);

        let url = optional_env("DATABASE_URL")?.map(SecretString::from);
        if backend == DatabaseBackend::Postgres && url.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "DATABASE_URL".to_string(),
                hint: "Set DATABASE_URL or DATABASE_BACKEND=libsql".to_string(),
            });
        }

        let pool_size = parse_env("DATABASE_POOL_SIZE", 10usize, "a positive integer")?;
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DATABASE_POOL_SIZE".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let libsql_path = optional_env("LIBSQL_PATH")?
            .map(PathBuf::from)
            .unwrap_or_else(default_libsql_path);

        Ok(Self {
            backend,
            url,
            pool_size,
            libsql_path,
            libsql_url: optional_env("LIBSQL_URL")?,
            libsql_auth_token: optional_env("LIBSQL_AUTH_TOKEN")?.map(SecretString::from),
        })
    }

    /// Local libSQL database at `path`, mostly for tests and tooling.
    pub fn libsql(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: DatabaseBackend::LibSql,
            url: None,
            pool_size: 1,
            libsql_path: path.into(),
            libsql_url: None,
            libsql_auth_token: None,
        }
    }
}

/// Default libSQL database path: `~/.moltnet/moltnet.db`.
pub fn default_libsql_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".moltnet")
        .join("moltnet.db")
}
