//! Retrying decorator for [`SigningRequestStore`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::SigningRequestStore;
use crate::db::retry::ConflictRetryPolicy;
use crate::error::DatabaseError;
use crate::signing::{Page, SigningRequest, StatusFilter, StatusUpdate};

/// Routes every mutation through a [`ConflictRetryPolicy`]. Reads go
/// straight to the inner store.
pub struct RetryingStore {
    inner: Arc<dyn SigningRequestStore>,
    policy: ConflictRetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn SigningRequestStore>, policy: ConflictRetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &ConflictRetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl SigningRequestStore for RetryingStore {
    async fn create(
        &self,
        request: &SigningRequest,
        max_pending: i64,
    ) -> Result<bool, DatabaseError> {
        self.policy
            .run("signing_requests.create", || {
                self.inner.create(request, max_pending)
            })
            .await
    }

    async fn update_status(
        &self,
        id: Uuid,
        update: &StatusUpdate,
    ) -> Result<Option<SigningRequest>, DatabaseError> {
        self.policy
            .run("signing_requests.update_status", || {
                self.inner.update_status(id, update)
            })
            .await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SigningRequest>, DatabaseError> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<SigningRequest>, DatabaseError> {
        self.inner.find_by_signature(signature).await
    }

    async fn list(
        &self,
        agent_id: &str,
        filter: &StatusFilter,
        page: Page,
    ) -> Result<Vec<SigningRequest>, DatabaseError> {
        self.inner.list(agent_id, filter, page).await
    }

    async fn count_pending_by_agent(&self, agent_id: &str) -> Result<i64, DatabaseError> {
        self.inner.count_pending_by_agent(agent_id).await
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<SigningRequest>, DatabaseError> {
        self.inner.list_pending(limit).await
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        self.policy
            .run("signing_requests.expire_overdue", || {
                self.inner.expire_overdue(now)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::db::retry::RetryConfig;

    /// Fails `update_status` with a lock error a fixed number of times and
    /// counts every call.
    struct Flaky {
        failures: u32,
        update_calls: AtomicU32,
        read_calls: AtomicU32,
    }

    #[async_trait]
    impl SigningRequestStore for Flaky {
        async fn create(
            &self,
            _request: &SigningRequest,
            _max_pending: i64,
        ) -> Result<bool, DatabaseError> {
            Ok(true)
        }

        async fn update_status(
            &self,
            _id: Uuid,
            _update: &StatusUpdate,
        ) -> Result<Option<SigningRequest>, DatabaseError> {
            let call = self.update_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(DatabaseError::Query("database is locked".to_string()));
            }
            Ok(None)
        }

        async fn find_by_id(&self, _id: Uuid) -> Result<Option<SigningRequest>, DatabaseError> {
            self.read_calls.fetch_add(1, Ordering::SeqCst);
            Err(DatabaseError::Query("database is locked".to_string()))
        }

        async fn find_by_signature(
            &self,
            _signature: &str,
        ) -> Result<Option<SigningRequest>, DatabaseError> {
            Ok(None)
        }

        async fn list(
            &self,
            _agent_id: &str,
            _filter: &StatusFilter,
            _page: Page,
        ) -> Result<Vec<SigningRequest>, DatabaseError> {
            Ok(Vec::new())
        }

        async fn count_pending_by_agent(&self, _agent_id: &str) -> Result<i64, DatabaseError> {
            Ok(0)
        }

        async fn list_pending(&self, _limit: i64) -> Result<Vec<SigningRequest>, DatabaseError> {
            Ok(Vec::new())
        }

        async fn expire_overdue(&self, _now: DateTime<Utc>) -> Result<u64, DatabaseError> {
            Ok(0)
        }
    }

    fn store(failures: u32) -> (Arc<Flaky>, RetryingStore) {
        let flaky = Arc::new(Flaky {
            failures,
            update_calls: AtomicU32::new(0),
            read_calls: AtomicU32::new(0),
        });
        let policy = ConflictRetryPolicy::new(RetryConfig {
            max_retries: 5,
            base_delay: Duration::ZERO,
        });
        (flaky.clone(), RetryingStore::new(flaky, policy))
    }

    fn expired() -> StatusUpdate {
        StatusUpdate::Expired {
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn mutations_are_retried_on_conflict() {
        let (flaky, store) = store(2);
        let result = store.update_status(Uuid::new_v4(), &expired()).await;
        assert!(result.unwrap().is_none());
        assert_eq!(flaky.update_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_as_serialization_exhausted() {
        let (flaky, store) = store(u32::MAX);
        let err = store
            .update_status(Uuid::new_v4(), &expired())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::SerializationExhausted { attempts: 5, .. }
        ));
        assert_eq!(flaky.update_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn reads_are_not_retried() {
        let (flaky, store) = store(0);
        assert!(store.find_by_id(Uuid::new_v4()).await.is_err());
        assert_eq!(flaky.read_calls.load(Ordering::SeqCst), 1);
    }
}
