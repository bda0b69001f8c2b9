//! Single-use nonce ledger.
//!
//! A nonce is accepted at most once. Acceptance is decided by the store's
//! uniqueness constraint in one insert-or-conflict statement, never by a
//! read followed by a write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::db::NonceStore;
use crate::db::retry::ConflictRetryPolicy;
use crate::error::DatabaseError;

/// Records consumed nonces until they expire.
#[derive(Clone)]
pub struct NonceLedger {
    store: Arc<dyn NonceStore>,
    policy: ConflictRetryPolicy,
}

impl NonceLedger {
    pub fn new(store: Arc<dyn NonceStore>, policy: ConflictRetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Mark `nonce` as used until `expires_at`.
    ///
    /// Returns `true` the first time and `false` for every later call with
    /// the same nonce, including concurrent ones.
    pub async fn consume(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let fresh = self
            .policy
            .run("nonces.consume", || self.store.insert_nonce(nonce, expires_at))
            .await?;
        if !fresh {
            tracing::debug!(nonce, "nonce already consumed");
        }
        Ok(fresh)
    }

    /// Delete every nonce whose expiry has passed.
    pub async fn cleanup(&self) -> Result<u64, DatabaseError> {
        let now = Utc::now();
        self.policy
            .run("nonces.cleanup", || self.store.delete_expired_nonces(now))
            .await
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until the task is
    /// aborted. Failures are logged and the loop keeps going.
    pub fn spawn_cleanup(&self, interval: Duration) -> JoinHandle<()> {
        let ledger = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match ledger.cleanup().await {
                    Ok(0) => tracing::trace!("nonce cleanup: nothing expired"),
                    Ok(deleted) => tracing::info!(deleted, "nonce cleanup removed expired nonces"),
                    Err(e) => tracing::warn!(error = %e, "nonce cleanup failed"),
                }
            }
        })
    }
}
