//! Error types for the signing service.

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Nonce is already bound to another signing request")]
    DuplicateNonce,

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization conflict persisted after {attempts} attempts")]
    SerializationExhausted { attempts: u32, retry_after: Duration },

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("Pool build error: {0}")]
    PoolBuild(#[from] deadpool_postgres::CreatePoolError),

    #[cfg(feature = "postgres")]
    #[error("Pool runtime error: {0}")]
    PoolRuntime(#[from] deadpool_postgres::PoolError),

    #[cfg(feature = "libsql")]
    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

impl From<crate::db::retry::RetriesExhausted> for DatabaseError {
    fn from(exhausted: crate::db::retry::RetriesExhausted) -> Self {
        Self::SerializationExhausted {
            attempts: exhausted.attempts,
            retry_after: exhausted.retry_after,
        }
    }
}

/// Key material and codec misuse. Signature *validity* is never an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key encoding: {reason}")]
    InvalidKeyEncoding { reason: String },

    #[error("Malformed signing payload: {reason}")]
    MalformedPayload { reason: String },
}

/// Errors surfaced by the signing-request workflow.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("Signing request {id} not found")]
    NotFound { id: Uuid },

    #[error("Signing request {id} has expired")]
    Expired { id: Uuid },

    #[error("Signing request {id} is already {status}")]
    AlreadyCompleted { id: Uuid, status: String },

    #[error("Agent {agent_id} already has {pending} pending signing requests (max {max})")]
    TooManyPending {
        agent_id: String,
        pending: i64,
        max: i64,
    },

    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Nonce is already bound to another signing request")]
    NonceReused,

    #[error("Key lookup failed for agent {agent_id}: {reason}")]
    KeyLookup { agent_id: String, reason: String },

    #[error("Rendezvous error: {0}")]
    Rendezvous(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl SigningError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

/// Key-recovery challenge errors.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("Recovery challenges are disabled: RECOVERY_CHALLENGE_SECRET is not set")]
    Disabled,

    #[error("Challenge MAC does not match")]
    InvalidMac,

    #[error("Malformed challenge: {reason}")]
    MalformedChallenge { reason: String },

    #[error("Challenge was issued for a different public key")]
    KeyMismatch,

    #[error("Challenge expired {age:?} after issue (ttl {ttl:?})")]
    ChallengeExpired { age: Duration, ttl: Duration },

    #[error("Challenge signature is invalid")]
    InvalidSignature,

    #[error("Challenge nonce has already been used")]
    Replayed,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Structured, client-facing view of an error.
///
/// `status` is the HTTP-equivalent status for whatever transport sits in
/// front of the workflow.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub status: u16,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    pub message: String,
}

impl ErrorPayload {
    fn new(code: &'static str, status: u16, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            code,
            status,
            retryable,
            retry_after_secs: None,
            message: message.into(),
        }
    }

    fn with_retry_after(mut self, retry_after: Duration) -> Self {
        // Round up so clients never retry before the hint.
        let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        self.retry_after_secs = Some(secs.max(1));
        self
    }
}

impl DatabaseError {
    fn to_error_payload(&self) -> ErrorPayload {
        match self {
            Self::SerializationExhausted { retry_after, .. } => ErrorPayload::new(
                "SERIALIZATION_EXHAUSTED",
                429,
                true,
                "Too many concurrent writes, retry later",
            )
            .with_retry_after(*retry_after),
            _ => ErrorPayload::new("DATABASE_ERROR", 500, false, self.to_string()),
        }
    }
}

impl SigningError {
    /// Stable error code for this failure.
    pub fn code(&self) -> &'static str {
        self.to_error_payload().code
    }

    /// Map into the structured surface consumed by transports.
    pub fn to_error_payload(&self) -> ErrorPayload {
        match self {
            Self::NotFound { .. } => {
                ErrorPayload::new("SIGNING_REQUEST_NOT_FOUND", 404, false, self.to_string())
            }
            Self::Expired { .. } => {
                ErrorPayload::new("SIGNING_REQUEST_EXPIRED", 410, false, self.to_string())
            }
            Self::AlreadyCompleted { .. } => ErrorPayload::new(
                "SIGNING_REQUEST_ALREADY_COMPLETED",
                409,
                false,
                self.to_string(),
            ),
            Self::TooManyPending { .. } => {
                ErrorPayload::new("TOO_MANY_PENDING_REQUESTS", 429, true, self.to_string())
            }
            Self::Validation { .. } => {
                ErrorPayload::new("VALIDATION_FAILED", 400, false, self.to_string())
            }
            Self::NonceReused => {
                ErrorPayload::new("NONCE_ALREADY_USED", 409, false, self.to_string())
            }
            Self::KeyLookup { .. } | Self::Rendezvous(_) => {
                ErrorPayload::new("UPSTREAM_UNAVAILABLE", 503, true, self.to_string())
            }
            Self::Crypto(_) => ErrorPayload::new("CRYPTO_ERROR", 500, false, self.to_string()),
            Self::Database(err) => err.to_error_payload(),
        }
    }
}

impl RecoveryError {
    /// Map into the structured surface consumed by transports.
    pub fn to_error_payload(&self) -> ErrorPayload {
        match self {
            Self::Disabled => {
                ErrorPayload::new("RECOVERY_DISABLED", 503, false, self.to_string())
            }
            Self::InvalidMac | Self::MalformedChallenge { .. } | Self::KeyMismatch => {
                ErrorPayload::new("INVALID_CHALLENGE", 400, false, self.to_string())
            }
            Self::ChallengeExpired { .. } => {
                ErrorPayload::new("CHALLENGE_EXPIRED", 410, false, self.to_string())
            }
            Self::InvalidSignature => {
                ErrorPayload::new("INVALID_SIGNATURE", 401, false, self.to_string())
            }
            Self::Replayed => ErrorPayload::new("CHALLENGE_REPLAYED", 409, false, self.to_string()),
            Self::Crypto(_) => ErrorPayload::new("CRYPTO_ERROR", 500, false, self.to_string()),
            Self::Database(err) => err.to_error_payload(),
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
