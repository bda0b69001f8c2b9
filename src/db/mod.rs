//! Persistence for signing requests and consumed nonces.
//!
//! Two backends implement the same traits:
//! - `postgres`: deadpool-postgres pool, refinery migrations, every write in
//!   a `SERIALIZABLE` transaction
//! - `libsql`: embedded SQLite-compatible file (optionally a Turso replica)
//!
//! Backends report write conflicts as plain errors; [`retry`] decides
//! whether to run the unit of work again.

#[cfg(feature = "libsql")]
pub mod libsql;
#[cfg(feature = "libsql")]
pub(crate) mod libsql_migrations;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::DatabaseError;
use crate::signing::{Page, SignatureSubmission, SigningRequest, StatusFilter, StatusUpdate};

/// Signing-request rows.
#[async_trait]
pub trait SigningRequestStore: Send + Sync {
    /// Insert a new `pending` row unless the agent already has
    /// `max_pending` pending rows. The count and the insert are one atomic
    /// unit.
    ///
    /// Returns `false` when the cap is reached. A nonce that is already
    /// bound to any other row fails with [`DatabaseError::DuplicateNonce`].
    async fn create(
        &self,
        request: &SigningRequest,
        max_pending: i64,
    ) -> Result<bool, DatabaseError>;

    /// Apply a terminal transition, but only while the row is still
    /// `pending`.
    ///
    /// Returns the updated row, or `None` when the row is missing or
    /// already terminal (the transition lost the race).
    async fn update_status(
        &self,
        id: Uuid,
        update: &StatusUpdate,
    ) -> Result<Option<SigningRequest>, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SigningRequest>, DatabaseError>;

    async fn find_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<SigningRequest>, DatabaseError>;

    /// An agent's requests, newest first.
    async fn list(
        &self,
        agent_id: &str,
        filter: &StatusFilter,
        page: Page,
    ) -> Result<Vec<SigningRequest>, DatabaseError>;

    async fn count_pending_by_agent(&self, agent_id: &str) -> Result<i64, DatabaseError>;

    /// Every `pending` row across agents, oldest first. Used to resume
    /// workflows after a restart.
    async fn list_pending(&self, limit: i64) -> Result<Vec<SigningRequest>, DatabaseError>;

    /// Conditionally expire every `pending` row whose deadline is before
    /// `now`; returns the count.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;
}

/// Single-use nonces.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Insert `nonce`; `false` when it already exists.
    ///
    /// Must be one atomic insert-or-conflict statement.
    async fn insert_nonce(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Delete nonces that expired before `now`; returns the count removed.
    async fn delete_expired_nonces(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;
}

/// Submitted signatures waiting for their request to be finalized.
///
/// One row per request; the first submission wins.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Record `signature` for `request_id` while the request is still
    /// `pending`. `false` when a submission already exists or the request
    /// is missing or terminal.
    async fn insert_submission(
        &self,
        request_id: Uuid,
        signature: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn find_submission(
        &self,
        request_id: Uuid,
    ) -> Result<Option<SignatureSubmission>, DatabaseError>;

    /// Delete submissions whose request reached a terminal state.
    async fn delete_settled_submissions(&self) -> Result<u64, DatabaseError>;
}

/// A complete backend.
#[async_trait]
pub trait Database: SigningRequestStore + NonceStore + SubmissionStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}

/// Open the configured backend. Does not run migrations.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "postgres")]
        DatabaseBackend::Postgres => {
            let backend = self::postgres::PgBackend::new(config).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "libsql")]
        DatabaseBackend::LibSql => {
            let backend = match (&config.libsql_url, &config.libsql_auth_token) {
                (Some(url), Some(token)) => {
                    use secrecy::ExposeSecret;
                    self::libsql::LibSqlBackend::new_remote_replica(
                        &config.libsql_path,
                        url,
                        token.expose_secret(),
                    )
                    .await?
                }
                _ => self::libsql::LibSqlBackend::new_local(&config.libsql_path).await?,
            };
            Ok(Arc::new(backend))
        }
        #[allow(unreachable_patterns)]
        other => Err(DatabaseError::Pool(format!(
            "database backend '{}' is not compiled in",
            other.as_str()
        ))),
    }
}
