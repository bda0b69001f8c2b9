use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{optional_env, parse_env, require_positive};
use crate::db::retry::RetryConfig;
use crate::error::ConfigError;

/// Signing-request workflow settings.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    /// How long a request waits for the agent before it expires.
    pub request_timeout: Duration,
    pub max_pending_per_agent: i64,
    pub retry: RetryConfig,
    pub nonce_cleanup_interval: Duration,
    /// How often a waiter checks the store for submissions made by another
    /// process.
    pub submission_poll_interval: Duration,
    /// How often overdue `pending` rows are expired and settled submissions
    /// pruned.
    pub sweep_interval: Duration,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(300),
            max_pending_per_agent: 100,
            retry: RetryConfig::default(),
            nonce_cleanup_interval: Duration::from_secs(3600),
            submission_poll_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl SigningConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let timeout_secs = require_positive(
            "SIGNING_REQUEST_TIMEOUT_SECS",
            parse_env(
                "SIGNING_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
                "a positive integer",
            )?,
        )?;

        let max_pending = require_positive(
            "SIGNING_MAX_PENDING_PER_AGENT",
            parse_env(
                "SIGNING_MAX_PENDING_PER_AGENT",
                defaults.max_pending_per_agent as u64,
                "a positive integer",
            )?,
        )?;

        let max_retries = parse_env(
            "SERIALIZATION_MAX_RETRIES",
            defaults.retry.max_retries,
            "a positive integer",
        )?;
        if max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SERIALIZATION_MAX_RETRIES".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let base_delay_ms = parse_env(
            "SERIALIZATION_BASE_DELAY_MS",
            defaults.retry.base_delay.as_millis() as u64,
            "a non-negative integer",
        )?;

        let cleanup_secs = require_positive(
            "NONCE_CLEANUP_INTERVAL_SECS",
            parse_env(
                "NONCE_CLEANUP_INTERVAL_SECS",
                defaults.nonce_cleanup_interval.as_secs(),
                "a positive integer",
            )?,
        )?;

        let poll_ms = require_positive(
            "SIGNING_SUBMISSION_POLL_MS",
            parse_env(
                "SIGNING_SUBMISSION_POLL_MS",
                defaults.submission_poll_interval.as_millis() as u64,
                "a positive integer",
            )?,
        )?;

        let sweep_secs = require_positive(
            "SIGNING_SWEEP_INTERVAL_SECS",
            parse_env(
                "SIGNING_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
                "a positive integer",
            )?,
        )?;

        Ok(Self {
            request_timeout: Duration::from_secs(timeout_secs),
            max_pending_per_agent: i64::try_from(max_pending).unwrap_or(i64::MAX),
            retry: RetryConfig {
                max_retries,
                base_delay: Duration::from_millis(base_delay_ms),
            },
            nonce_cleanup_interval: Duration::from_secs(cleanup_secs),
            submission_poll_interval: Duration::from_millis(poll_ms),
            sweep_interval: Duration::from_secs(sweep_secs),
        })
    }
}

/// Key-recovery challenge settings. Recovery is off without a secret.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub secret: Option<SecretString>,
    pub challenge_ttl: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            secret: None,
            challenge_ttl: Duration::from_secs(300),
        }
    }
}

impl RecoveryConfig {
    pub const MIN_SECRET_LEN: usize = 32;

    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let secret = optional_env("RECOVERY_CHALLENGE_SECRET")?.map(SecretString::from);
        if let Some(secret) = &secret
            && secret.expose_secret().len() < Self::MIN_SECRET_LEN
        {
            return Err(ConfigError::InvalidValue {
                key: "RECOVERY_CHALLENGE_SECRET".to_string(),
                message: format!("must be at least {} bytes", Self::MIN_SECRET_LEN),
            });
        }

        let ttl_secs = require_positive(
            "RECOVERY_CHALLENGE_TTL_SECS",
            parse_env("RECOVERY_CHALLENGE_TTL_SECS", 300u64, "a positive integer")?,
        )?;

        Ok(Self {
            secret,
            challenge_ttl: Duration::from_secs(ttl_secs),
        })
    }
}
