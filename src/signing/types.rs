//! Signing-request records and the values that flow through the workflow.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SigningError;

/// Lifecycle state of a signing request.
///
/// `Pending` is the only non-terminal state; once a request is `Completed`
/// or `Expired` it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningStatus {
    Pending,
    Completed,
    Expired,
}

impl SigningStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for SigningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One challenge/response cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub id: Uuid,
    pub agent_id: String,
    pub message: String,
    pub nonce: String,
    pub status: SigningStatus,
    pub signature: Option<String>,
    pub valid: Option<bool>,
    pub workflow_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SigningRequest {
    /// A fresh `pending` request that expires `timeout` after `created_at`.
    pub fn pending(
        id: Uuid,
        agent_id: impl Into<String>,
        message: impl Into<String>,
        nonce: impl Into<String>,
        created_at: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        Self {
            id,
            agent_id: agent_id.into(),
            message: message.into(),
            nonce: nonce.into(),
            status: SigningStatus::Pending,
            signature: None,
            valid: None,
            workflow_id: Uuid::new_v4(),
            created_at,
            expires_at: created_at
                .checked_add_signed(timeout)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            completed_at: None,
        }
    }

    /// The challenge delivered to the key holder.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            request_id: self.id,
            message: self.message.clone(),
            nonce: self.nonce.clone(),
        }
    }

    /// Final outcome, or `None` while still pending.
    pub fn outcome(&self) -> Option<SigningOutcome> {
        self.status.is_terminal().then(|| SigningOutcome {
            request_id: self.id,
            status: self.status,
            valid: self.valid,
        })
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left until `expires_at`, zero once passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Terminal transition applied by [`update_status`].
///
/// [`update_status`]: crate::db::SigningRequestStore::update_status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Completed {
        signature: String,
        valid: bool,
        completed_at: DateTime<Utc>,
    },
    Expired {
        completed_at: DateTime<Utc>,
    },
}

impl StatusUpdate {
    pub fn status(&self) -> SigningStatus {
        match self {
            Self::Completed { .. } => SigningStatus::Completed,
            Self::Expired { .. } => SigningStatus::Expired,
        }
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        match self {
            Self::Completed { completed_at, .. } | Self::Expired { completed_at } => *completed_at,
        }
    }

    pub fn signature(&self) -> Option<&str> {
        match self {
            Self::Completed { signature, .. } => Some(signature),
            Self::Expired { .. } => None,
        }
    }

    pub fn valid(&self) -> Option<bool> {
        match self {
            Self::Completed { valid, .. } => Some(*valid),
            Self::Expired { .. } => None,
        }
    }
}

/// What a caller waiting on a signing request gets back.
///
/// Expiry and invalid signatures are outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningOutcome {
    pub request_id: Uuid,
    pub status: SigningStatus,
    pub valid: Option<bool>,
}

/// Challenge payload `{request_id, message, nonce}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: Uuid,
    pub message: String,
    pub nonce: String,
}

/// Answer from the key holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSubmission {
    pub signature: String,
}

/// Set of statuses a listing is restricted to. Empty means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFilter(Vec<SigningStatus>);

impl StatusFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn only(statuses: impl IntoIterator<Item = SigningStatus>) -> Self {
        let mut out: Vec<SigningStatus> = Vec::new();
        for status in statuses {
            if !out.contains(&status) {
                out.push(status);
            }
        }
        Self(out)
    }

    /// Parse a comma-separated list such as `"pending,completed"`.
    pub fn parse(raw: &str) -> Result<Self, SigningError> {
        let mut statuses = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let status = SigningStatus::parse(part).ok_or_else(|| {
                SigningError::validation(format!(
                    "unknown status '{part}', expected pending, completed or expired"
                ))
            })?;
            statuses.push(status);
        }
        Ok(Self::only(statuses))
    }

    pub fn statuses(&self) -> &[SigningStatus] {
        &self.0
    }

    pub fn is_any(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, status: SigningStatus) -> bool {
        self.is_any() || self.0.contains(&status)
    }
}

/// Offset pagination for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 20;
    pub const MAX_LIMIT: i64 = 100;

    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Result<Self, SigningError> {
        let limit = limit.unwrap_or(Self::DEFAULT_LIMIT);
        let offset = offset.unwrap_or(0);
        if !(1..=Self::MAX_LIMIT).contains(&limit) {
            return Err(SigningError::validation(format!(
                "limit must be between 1 and {}",
                Self::MAX_LIMIT
            )));
        }
        if offset < 0 {
            return Err(SigningError::validation("offset must be >= 0"));
        }
        Ok(Self { limit, offset })
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}
