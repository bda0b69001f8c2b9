//! Database-backed rendezvous.
//!
//! `deliver` writes the submission to `signing_submissions` before
//! returning, so an accepted signature survives a crash and is visible to
//! waiters in other processes. Local waiters are woken straight away;
//! waiters elsewhere notice the row on their next poll.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, broadcast};
use uuid::Uuid;

use crate::db::SubmissionStore;
use crate::db::retry::ConflictRetryPolicy;
use crate::error::SigningError;
use crate::signing::rendezvous::broadcast_envelope;
use crate::signing::{Envelope, Rendezvous, SignatureSubmission};

/// Rendezvous whose mailbox is the `signing_submissions` table.
pub struct DurableRendezvous {
    store: Arc<dyn SubmissionStore>,
    policy: ConflictRetryPolicy,
    poll_interval: Duration,
    waiters: Mutex<HashMap<Uuid, Arc<Notify>>>,
    envelopes: broadcast::Sender<Envelope>,
}

impl DurableRendezvous {
    const ENVELOPE_BUFFER: usize = 256;

    pub fn new(
        store: Arc<dyn SubmissionStore>,
        policy: ConflictRetryPolicy,
        poll_interval: Duration,
    ) -> Self {
        let (envelopes, _) = broadcast::channel(Self::ENVELOPE_BUFFER);
        Self {
            store,
            policy,
            poll_interval,
            waiters: Mutex::new(HashMap::new()),
            envelopes,
        }
    }

    /// Stream of published envelopes.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.envelopes.subscribe()
    }

    /// Number of requests with a waiter in this process.
    pub fn local_waiters(&self) -> usize {
        self.waiters.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn waiter(&self, request_id: Uuid) -> Result<Arc<Notify>, SigningError> {
        let mut waiters = self
            .waiters
            .lock()
            .map_err(|_| SigningError::Rendezvous("rendezvous lock poisoned".to_string()))?;
        Ok(waiters.entry(request_id).or_default().clone())
    }

    fn wake(&self, request_id: Uuid) {
        if let Ok(waiters) = self.waiters.lock()
            && let Some(notify) = waiters.get(&request_id)
        {
            notify.notify_one();
        }
    }
}

#[async_trait]
impl Rendezvous for DurableRendezvous {
    async fn publish(&self, envelope: &Envelope) -> Result<(), SigningError> {
        broadcast_envelope(&self.envelopes, envelope);
        Ok(())
    }

    fn open(&self, request_id: Uuid) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.entry(request_id).or_default();
        }
    }

    async fn deliver(
        &self,
        request_id: Uuid,
        submission: SignatureSubmission,
    ) -> Result<(), SigningError> {
        let submitted_at = Utc::now();
        let stored = self
            .policy
            .run("submissions.insert", || {
                self.store
                    .insert_submission(request_id, &submission.signature, submitted_at)
            })
            .await?;

        if !stored {
            if self.store.find_submission(request_id).await?.is_none() {
                return Err(SigningError::Rendezvous(format!(
                    "request {request_id} is no longer accepting submissions"
                )));
            }
            tracing::debug!(%request_id, "submission already stored, dropping duplicate");
            return Ok(());
        }

        self.wake(request_id);
        Ok(())
    }

    async fn receive(&self, request_id: Uuid) -> Result<SignatureSubmission, SigningError> {
        let notify = self.waiter(request_id)?;
        loop {
            if let Some(submission) = self.store.find_submission(request_id).await? {
                return Ok(submission);
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn close(&self, request_id: Uuid) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.remove(&request_id);
        }
    }

    async fn prune(&self) -> Result<u64, SigningError> {
        let deleted = self
            .policy
            .run("submissions.prune", || self.store.delete_settled_submissions())
            .await?;
        if deleted > 0 {
            tracing::debug!(deleted, "pruned settled submissions");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::db::retry::RetryConfig;
    use crate::error::DatabaseError;

    /// Submissions in memory; `pending` stands in for the request rows.
    #[derive(Default)]
    struct MemorySubmissions {
        pending: Mutex<HashSet<Uuid>>,
        rows: Mutex<HashMap<Uuid, String>>,
    }

    impl MemorySubmissions {
        fn with_pending(ids: &[Uuid]) -> Arc<Self> {
            let store = Self::default();
            store.pending.lock().unwrap().extend(ids.iter().copied());
            Arc::new(store)
        }

        fn settle(&self, id: Uuid) {
            self.pending.lock().unwrap().remove(&id);
        }
    }

    #[async_trait]
    impl SubmissionStore for MemorySubmissions {
        async fn insert_submission(
            &self,
            request_id: Uuid,
            signature: &str,
            _submitted_at: DateTime<Utc>,
        ) -> Result<bool, DatabaseError> {
            if !self.pending.lock().unwrap().contains(&request_id) {
                return Ok(false);
            }
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(&request_id) {
                return Ok(false);
            }
            rows.insert(request_id, signature.to_string());
            Ok(true)
        }

        async fn find_submission(
            &self,
            request_id: Uuid,
        ) -> Result<Option<SignatureSubmission>, DatabaseError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .get(&request_id)
                .map(|signature| SignatureSubmission {
                    signature: signature.clone(),
                }))
        }

        async fn delete_settled_submissions(&self) -> Result<u64, DatabaseError> {
            let pending = self.pending.lock().unwrap().clone();
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|id, _| pending.contains(id));
            Ok((before - rows.len()) as u64)
        }
    }

    fn rendezvous(store: Arc<MemorySubmissions>, poll: Duration) -> DurableRendezvous {
        DurableRendezvous::new(
            store,
            ConflictRetryPolicy::new(RetryConfig {
                max_retries: 3,
                base_delay: Duration::ZERO,
            }),
            poll,
        )
    }

    fn submission(sig: &str) -> SignatureSubmission {
        SignatureSubmission {
            signature: sig.to_string(),
        }
    }

    #[tokio::test]
    async fn local_delivery_wakes_the_waiter() {
        let id = Uuid::new_v4();
        let rv = Arc::new(rendezvous(
            MemorySubmissions::with_pending(&[id]),
            Duration::from_secs(60),
        ));
        rv.open(id);

        let waiter = {
            let rv = rv.clone();
            tokio::spawn(async move { rv.receive(id).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        rv.deliver(id, submission("sig")).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, submission("sig"));
    }

    #[tokio::test]
    async fn submission_from_another_instance_is_picked_up() {
        let id = Uuid::new_v4();
        let store = MemorySubmissions::with_pending(&[id]);
        let waiting_side = Arc::new(rendezvous(store.clone(), Duration::from_millis(10)));
        let submitting_side = rendezvous(store, Duration::from_millis(10));
        waiting_side.open(id);

        let waiter = {
            let rv = waiting_side.clone();
            tokio::spawn(async move { rv.receive(id).await })
        };
        submitting_side.deliver(id, submission("remote")).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, submission("remote"));
    }

    #[tokio::test]
    async fn submissions_outlive_the_rendezvous() {
        let id = Uuid::new_v4();
        let store = MemorySubmissions::with_pending(&[id]);

        let before_restart = rendezvous(store.clone(), Duration::from_millis(10));
        before_restart.deliver(id, submission("kept")).await.unwrap();
        before_restart.deliver(id, submission("dropped")).await.unwrap();
        drop(before_restart);

        let after_restart = rendezvous(store, Duration::from_millis(10));
        after_restart.open(id);
        assert_eq!(after_restart.receive(id).await.unwrap(), submission("kept"));
        after_restart.close(id);
        assert_eq!(after_restart.local_waiters(), 0);
    }

    #[tokio::test]
    async fn settled_requests_refuse_and_prune() {
        let id = Uuid::new_v4();
        let store = MemorySubmissions::with_pending(&[id]);
        let rv = rendezvous(store.clone(), Duration::from_millis(10));

        rv.deliver(id, submission("sig")).await.unwrap();
        store.settle(id);
        assert_eq!(rv.prune().await.unwrap(), 1);

        let err = rv.deliver(id, submission("late")).await.unwrap_err();
        assert!(matches!(err, SigningError::Rendezvous(_)));
        assert_eq!(rv.local_waiters(), 0);
    }
}
