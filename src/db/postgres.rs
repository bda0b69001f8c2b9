//! PostgreSQL backend for the Database trait.
//!
//! Every write runs in its own `SERIALIZABLE` transaction. Conflicts come
//! back as `40001` errors and are retried one level up, see
//! [`crate::signing::RetryingStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as PoolConfig, Object, Pool, Runtime};
use secrecy::ExposeSecret;
use tokio_postgres::error::SqlState;
use tokio_postgres::{IsolationLevel, NoTls, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::{Database, NonceStore, SigningRequestStore, SubmissionStore};
use crate::error::DatabaseError;
use crate::signing::{
    Page, SignatureSubmission, SigningRequest, SigningStatus, StatusFilter, StatusUpdate,
};

const ALL_STATUSES: [&str; 3] = ["pending", "completed", "expired"];

/// Unique constraint added in `V2__nonce_binding_and_submissions.sql`.
const NONCE_CONSTRAINT: &str = "signing_requests_nonce_key";

fn map_insert_error(err: tokio_postgres::Error) -> DatabaseError {
    let nonce_taken = err.as_db_error().is_some_and(|db| {
        *db.code() == SqlState::UNIQUE_VIOLATION && db.constraint() == Some(NONCE_CONSTRAINT)
    });
    if nonce_taken {
        DatabaseError::DuplicateNonce
    } else {
        err.into()
    }
}

/// PostgreSQL database backend.
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    /// Create a new PostgreSQL backend from configuration.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| DatabaseError::Pool("DATABASE_URL is not set".to_string()))?;

        let mut cfg = PoolConfig::new();
        cfg.url = Some(url.expose_secret().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;

        // Fail fast on a bad URL instead of on the first request.
        let _ = pool.get().await?;

        tracing::info!(pool_size = config.pool_size, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn conn(&self) -> Result<Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    fn row_to_request(row: &Row) -> Result<SigningRequest, DatabaseError> {
        let status: String = row.try_get("status")?;
        let status = SigningStatus::parse(&status)
            .ok_or_else(|| DatabaseError::Query(format!("unknown signing status '{status}'")))?;

        Ok(SigningRequest {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            message: row.try_get("message")?,
            nonce: row.try_get("nonce")?,
            status,
            signature: row.try_get("signature")?,
            valid: row.try_get("valid")?,
            workflow_id: row.try_get("workflow_id")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

// ==================== Database (supertrait) ====================

#[async_trait]
impl Database for PgBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        use refinery::embed_migrations;
        embed_migrations!("migrations");

        let mut client = self.conn().await?;
        let report = migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        tracing::info!(
            applied = report.applied_migrations().len(),
            "PostgreSQL migrations up to date"
        );
        Ok(())
    }
}

// ==================== SigningRequestStore ====================

#[async_trait]
impl SigningRequestStore for PgBackend {
    async fn create(
        &self,
        request: &SigningRequest,
        max_pending: i64,
    ) -> Result<bool, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await?;

        // Two concurrent creates that both see room under the cap conflict
        // under SERIALIZABLE; one of them is retried and sees the other.
        let pending: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM signing_requests WHERE agent_id = $1 AND status = 'pending'",
                &[&request.agent_id],
            )
            .await?
            .try_get(0)?;
        if pending >= max_pending {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.execute(
            r#"
            INSERT INTO signing_requests (
                id, agent_id, message, nonce, status, signature, valid,
                workflow_id, created_at, expires_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
            &[
                &request.id,
                &request.agent_id,
                &request.message,
                &request.nonce,
                &request.status.as_str(),
                &request.signature,
                &request.valid,
                &request.workflow_id,
                &request.created_at,
                &request.expires_at,
                &request.completed_at,
            ],
        )
        .await
        .map_err(map_insert_error)?;

        tx.commit().await?;
        Ok(true)
    }

    async fn update_status(
        &self,
        id: Uuid,
        update: &StatusUpdate,
    ) -> Result<Option<SigningRequest>, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await?;

        let completed_at = update.completed_at();
        let row = tx
            .query_opt(
                r#"
                UPDATE signing_requests
                SET status = $2, signature = $3, valid = $4, completed_at = $5
                WHERE id = $1 AND status = 'pending'
                RETURNING *
                "#,
                &[
                    &id,
                    &update.status().as_str(),
                    &update.signature(),
                    &update.valid(),
                    &completed_at,
                ],
            )
            .await?;

        tx.commit().await?;
        row.as_ref().map(Self::row_to_request).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SigningRequest>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM signing_requests WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(Self::row_to_request).transpose()
    }

    async fn find_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<SigningRequest>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                SELECT * FROM signing_requests
                WHERE signature = $1
                ORDER BY completed_at DESC NULLS LAST
                LIMIT 1
                "#,
                &[&signature],
            )
            .await?;
        row.as_ref().map(Self::row_to_request).transpose()
    }

    async fn list(
        &self,
        agent_id: &str,
        filter: &StatusFilter,
        page: Page,
    ) -> Result<Vec<SigningRequest>, DatabaseError> {
        let statuses: Vec<&str> = if filter.is_any() {
            ALL_STATUSES.to_vec()
        } else {
            filter.statuses().iter().map(|s| s.as_str()).collect()
        };

        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM signing_requests
                WHERE agent_id = $1 AND status = ANY($2)
                ORDER BY created_at DESC, id DESC
                LIMIT $3 OFFSET $4
                "#,
                &[&agent_id, &statuses, &page.limit, &page.offset],
            )
            .await?;
        rows.iter().map(Self::row_to_request).collect()
    }

    async fn count_pending_by_agent(&self, agent_id: &str) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM signing_requests WHERE agent_id = $1 AND status = 'pending'",
                &[&agent_id],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<SigningRequest>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                SELECT * FROM signing_requests
                WHERE status = 'pending'
                ORDER BY created_at ASC
                LIMIT $1
                "#,
                &[&limit],
            )
            .await?;
        rows.iter().map(Self::row_to_request).collect()
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await?;
        let expired = tx
            .execute(
                r#"
                UPDATE signing_requests
                SET status = 'expired', completed_at = $1
                WHERE status = 'pending' AND expires_at < $1
                "#,
                &[&now],
            )
            .await?;
        tx.commit().await?;
        Ok(expired)
    }
}

// ==================== SubmissionStore ====================

#[async_trait]
impl SubmissionStore for PgBackend {
    async fn insert_submission(
        &self,
        request_id: Uuid,
        signature: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await?;
        let inserted = tx
            .execute(
                r#"
                INSERT INTO signing_submissions (request_id, signature, submitted_at)
                SELECT $1::uuid, $2::text, $3::timestamptz
                WHERE EXISTS (
                    SELECT 1 FROM signing_requests WHERE id = $1 AND status = 'pending'
                )
                ON CONFLICT (request_id) DO NOTHING
                "#,
                &[&request_id, &signature, &submitted_at],
            )
            .await?;
        tx.commit().await?;
        Ok(inserted == 1)
    }

    async fn find_submission(
        &self,
        request_id: Uuid,
    ) -> Result<Option<SignatureSubmission>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT signature FROM signing_submissions WHERE request_id = $1",
                &[&request_id],
            )
            .await?;
        match row {
            Some(row) => Ok(Some(SignatureSubmission {
                signature: row.try_get("signature")?,
            })),
            None => Ok(None),
        }
    }

    async fn delete_settled_submissions(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute(
                r#"
                DELETE FROM signing_submissions s
                USING signing_requests r
                WHERE s.request_id = r.id AND r.status <> 'pending'
                "#,
                &[],
            )
            .await?;
        Ok(deleted)
    }
}

// ==================== NonceStore ====================

#[async_trait]
impl NonceStore for PgBackend {
    async fn insert_nonce(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let inserted = conn
            .execute(
                r#"
                INSERT INTO used_recovery_nonces (nonce, expires_at)
                VALUES ($1, $2)
                ON CONFLICT (nonce) DO NOTHING
                "#,
                &[&nonce, &expires_at],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn delete_expired_nonces(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute(
                "DELETE FROM used_recovery_nonces WHERE expires_at < $1",
                &[&now],
            )
            .await?;
        Ok(deleted)
    }
}
