//! NonceStore for libSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{LibSqlBackend, fmt_ts};
use crate::db::NonceStore;
use crate::error::DatabaseError;

#[async_trait]
impl NonceStore for LibSqlBackend {
    async fn insert_nonce(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let inserted = conn
            .execute(
                "INSERT INTO used_recovery_nonces (nonce, expires_at) VALUES (?1, ?2) \
                 ON CONFLICT (nonce) DO NOTHING",
                libsql::params![nonce, fmt_ts(&expires_at)],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn delete_expired_nonces(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let conn = self.connect().await?;
        let deleted = conn
            .execute(
                "DELETE FROM used_recovery_nonces WHERE expires_at < ?1",
                libsql::params![fmt_ts(&now)],
            )
            .await?;
        Ok(deleted)
    }
}
