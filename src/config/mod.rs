//! Configuration for the signing service.
//!
//! Everything is read from env vars. `./.env` and `~/.moltnet/.env` are
//! loaded first via dotenvy, which never overwrites variables that are
//! already set, so the effective priority is:
//!
//!   explicit env vars > `./.env` > `~/.moltnet/.env` > defaults

mod database;
pub(crate) mod helpers;
mod signing;

use crate::error::ConfigError;

pub use self::database::{DatabaseBackend, DatabaseConfig, default_libsql_path};
pub use self::signing::{RecoveryConfig, SigningConfig};

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub signing: SigningConfig,
    pub recovery: RecoveryConfig,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        crate::bootstrap::load_moltnet_env();
        Self::resolve()
    }

    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve()?,
            signing: SigningConfig::resolve()?,
            recovery: RecoveryConfig::resolve()?,
        })
    }
}
