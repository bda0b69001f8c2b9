//! SigningRequestStore for libSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    LibSqlBackend, fmt_opt_ts, fmt_ts, get_opt_bool, get_opt_text, get_opt_ts, get_text, get_ts,
    get_uuid, opt_bool, opt_text,
};
use crate::db::SigningRequestStore;
use crate::error::DatabaseError;
use crate::signing::{Page, SigningRequest, SigningStatus, StatusFilter, StatusUpdate};

/// Explicit column list (matches positional access in `row_to_request`).
const COLUMNS: &str = "\
    id, agent_id, message, nonce, status, signature, valid, \
    workflow_id, created_at, expires_at, completed_at";

fn row_to_request(row: &libsql::Row) -> Result<SigningRequest, DatabaseError> {
    let status = get_text(row, 4)?;
    let status = SigningStatus::parse(&status)
        .ok_or_else(|| DatabaseError::Query(format!("unknown signing status '{status}'")))?;

    Ok(SigningRequest {
        id: get_uuid(row, 0)?,
        agent_id: get_text(row, 1)?,
        message: get_text(row, 2)?,
        nonce: get_text(row, 3)?,
        status,
        signature: get_opt_text(row, 5),
        valid: get_opt_bool(row, 6),
        workflow_id: get_uuid(row, 7)?,
        created_at: get_ts(row, 8)?,
        expires_at: get_ts(row, 9)?,
        completed_at: get_opt_ts(row, 10),
    })
}

/// SQLite reports the unique index on `nonce` by column name.
fn map_insert_error(err: libsql::Error) -> DatabaseError {
    if err
        .to_string()
        .contains("UNIQUE constraint failed: signing_requests.nonce")
    {
        DatabaseError::DuplicateNonce
    } else {
        err.into()
    }
}

async fn collect(mut rows: libsql::Rows) -> Result<Vec<SigningRequest>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(row_to_request(&row)?);
    }
    Ok(out)
}

/// Exactly three status values for `status IN (?, ?, ?)`; unused slots
/// repeat the first entry.
fn status_slots(filter: &StatusFilter) -> [&'static str; 3] {
    let statuses: Vec<&'static str> = if filter.is_any() {
        vec!["pending", "completed", "expired"]
    } else {
        filter.statuses().iter().map(|s| s.as_str()).collect()
    };
    let first = statuses[0];
    [
        first,
        statuses.get(1).copied().unwrap_or(first),
        statuses.get(2).copied().unwrap_or(first),
    ]
}

#[async_trait]
impl SigningRequestStore for LibSqlBackend {
    async fn create(
        &self,
        request: &SigningRequest,
        max_pending: i64,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        // One statement, so the cap check and the insert share SQLite's
        // write lock.
        let inserted = conn
            .execute(
                &format!(
                    "INSERT INTO signing_requests ({COLUMNS}) \
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11 \
                     WHERE (SELECT COUNT(*) FROM signing_requests \
                            WHERE agent_id = ?2 AND status = 'pending') < ?12"
                ),
                libsql::params![
                    request.id.to_string(),
                    request.agent_id.as_str(),
                    request.message.as_str(),
                    request.nonce.as_str(),
                    request.status.as_str(),
                    opt_text(request.signature.as_deref()),
                    opt_bool(request.valid),
                    request.workflow_id.to_string(),
                    fmt_ts(&request.created_at),
                    fmt_ts(&request.expires_at),
                    fmt_opt_ts(&request.completed_at),
                    max_pending,
                ],
            )
            .await
            .map_err(map_insert_error)?;
        Ok(inserted == 1)
    }

    async fn update_status(
        &self,
        id: Uuid,
        update: &StatusUpdate,
    ) -> Result<Option<SigningRequest>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE signing_requests \
                     SET status = ?2, signature = ?3, valid = ?4, completed_at = ?5 \
                     WHERE id = ?1 AND status = 'pending' \
                     RETURNING {COLUMNS}"
                ),
                libsql::params![
                    id.to_string(),
                    update.status().as_str(),
                    opt_text(update.signature()),
                    opt_bool(update.valid()),
                    fmt_ts(&update.completed_at()),
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_request(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SigningRequest>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {COLUMNS} FROM signing_requests WHERE id = ?1"),
                libsql::params![id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_request(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<SigningRequest>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM signing_requests \
                     WHERE signature = ?1 \
                     ORDER BY completed_at DESC \
                     LIMIT 1"
                ),
                libsql::params![signature],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_request(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        agent_id: &str,
        filter: &StatusFilter,
        page: Page,
    ) -> Result<Vec<SigningRequest>, DatabaseError> {
        let [s1, s2, s3] = status_slots(filter);
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM signing_requests \
                     WHERE agent_id = ?1 AND status IN (?2, ?3, ?4) \
                     ORDER BY created_at DESC, id DESC \
                     LIMIT ?5 OFFSET ?6"
                ),
                libsql::params![agent_id, s1, s2, s3, page.limit, page.offset],
            )
            .await?;
        collect(rows).await
    }

    async fn count_pending_by_agent(&self, agent_id: &str) -> Result<i64, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM signing_requests WHERE agent_id = ?1 AND status = 'pending'",
                libsql::params![agent_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?),
            None => Ok(0),
        }
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<SigningRequest>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM signing_requests \
                     WHERE status = 'pending' \
                     ORDER BY created_at ASC \
                     LIMIT ?1"
                ),
                libsql::params![limit],
            )
            .await?;
        collect(rows).await
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let conn = self.connect().await?;
        let now = fmt_ts(&now);
        let expired = conn
            .execute(
                "UPDATE signing_requests SET status = 'expired', completed_at = ?1 \
                 WHERE status = 'pending' AND expires_at < ?1",
                libsql::params![now],
            )
            .await?;
        Ok(expired)
    }
}
