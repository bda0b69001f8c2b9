//! SubmissionStore for libSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{LibSqlBackend, fmt_ts, get_text};
use crate::db::SubmissionStore;
use crate::error::DatabaseError;
use crate::signing::SignatureSubmission;

#[async_trait]
impl SubmissionStore for LibSqlBackend {
    async fn insert_submission(
        &self,
        request_id: Uuid,
        signature: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let inserted = conn
            .execute(
                "INSERT INTO signing_submissions (request_id, signature, submitted_at) \
                 SELECT ?1, ?2, ?3 \
                 WHERE EXISTS (SELECT 1 FROM signing_requests \
                               WHERE id = ?1 AND status = 'pending') \
                 ON CONFLICT (request_id) DO NOTHING",
                libsql::params![request_id.to_string(), signature, fmt_ts(&submitted_at)],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn find_submission(
        &self,
        request_id: Uuid,
    ) -> Result<Option<SignatureSubmission>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT signature FROM signing_submissions WHERE request_id = ?1",
                libsql::params![request_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(SignatureSubmission {
                signature: get_text(&row, 0)?,
            })),
            None => Ok(None),
        }
    }

    async fn delete_settled_submissions(&self) -> Result<u64, DatabaseError> {
        let conn = self.connect().await?;
        let deleted = conn
            .execute(
                "DELETE FROM signing_submissions WHERE request_id IN \
                 (SELECT id FROM signing_requests WHERE status <> 'pending')",
                (),
            )
            .await?;
        Ok(deleted)
    }
}
