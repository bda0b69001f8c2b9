//! Durable signing-request workflow.
//!
//! Each request gets its own tokio task that waits for either the agent's
//! submission or the deadline, whichever comes first. Nothing about the
//! wait lives only in memory: the task can be rebuilt from the `pending`
//! row after a restart with [`SigningWorkflow::resume_pending`].
//!
//! A waiter always ends in a terminal write. Failures it can outwait (key
//! lookup, rendezvous, store reads) are retried until the deadline; a
//! failure it cannot (undecodable key material) expires the request and is
//! reported to the caller. Rows left behind by a crashed process are
//! expired by [`SigningWorkflow::sweep`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::SigningConfig;
use crate::db::SigningRequestStore;
use crate::db::retry::ConflictRetryPolicy;
use crate::error::{DatabaseError, SigningError};
use crate::signing::{
    Ed25519Verifier, InMemoryRendezvous, KeyLookup, Page, Rendezvous, RetryingStore,
    SignatureSubmission, SignatureVerifier, SigningOutcome, SigningRequest, StatusFilter,
    StatusUpdate,
};

/// Upper bound on rows picked up by one `resume_pending` call.
const RESUME_BATCH: i64 = 10_000;

/// Pause between attempts to verify a submission after a transient failure.
const CHECK_RETRY_PAUSE: Duration = Duration::from_millis(250);

/// Collects the workflow's collaborators. Consumed by [`build`](Self::build).
pub struct SigningWorkflowBuilder {
    store: Arc<dyn SigningRequestStore>,
    keys: Arc<dyn KeyLookup>,
    verifier: Arc<dyn SignatureVerifier>,
    rendezvous: Arc<dyn Rendezvous>,
    config: SigningConfig,
    retry_policy: Option<ConflictRetryPolicy>,
}

impl SigningWorkflowBuilder {
    pub fn new(store: Arc<dyn SigningRequestStore>, keys: Arc<dyn KeyLookup>) -> Self {
        Self {
            store,
            keys,
            verifier: Arc::new(Ed25519Verifier),
            rendezvous: Arc::new(InMemoryRendezvous::new()),
            config: SigningConfig::default(),
            retry_policy: None,
        }
    }

    pub fn verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn rendezvous(mut self, rendezvous: Arc<dyn Rendezvous>) -> Self {
        self.rendezvous = rendezvous;
        self
    }

    pub fn config(mut self, config: SigningConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the policy built from `config.retry`.
    pub fn retry_policy(mut self, policy: ConflictRetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<SigningWorkflow, SigningError> {
        if self.config.request_timeout.is_zero() {
            return Err(SigningError::validation("request timeout must be > 0"));
        }
        if self.config.max_pending_per_agent <= 0 {
            return Err(SigningError::validation("max pending per agent must be > 0"));
        }

        let policy = self
            .retry_policy
            .unwrap_or_else(|| ConflictRetryPolicy::new(self.config.retry));

        Ok(SigningWorkflow {
            inner: Arc::new(Inner {
                store: Arc::new(RetryingStore::new(self.store, policy)),
                keys: self.keys,
                verifier: self.verifier,
                rendezvous: self.rendezvous,
                config: self.config,
            }),
        })
    }
}

struct Inner {
    store: Arc<dyn SigningRequestStore>,
    keys: Arc<dyn KeyLookup>,
    verifier: Arc<dyn SignatureVerifier>,
    rendezvous: Arc<dyn Rendezvous>,
    config: SigningConfig,
}

/// Entry point for creating, answering and inspecting signing requests.
///
/// Cheap to clone; clones share the same collaborators.
#[derive(Clone)]
pub struct SigningWorkflow {
    inner: Arc<Inner>,
}

/// A request whose waiter task is running.
pub struct PendingSignature {
    pub request: SigningRequest,
    task: JoinHandle<Result<SigningOutcome, SigningError>>,
    rendezvous: Arc<dyn Rendezvous>,
}

/// What one [`SigningWorkflow::sweep`] pass cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: u64,
    pub pruned: u64,
}

impl PendingSignature {
    /// Wait for the terminal outcome.
    pub async fn wait(self) -> Result<SigningOutcome, SigningError> {
        self.task
            .await
            .map_err(|e| SigningError::Rendezvous(format!("signing waiter failed: {e}")))?
    }

    /// Stop waiting in this process. The row stays `pending` and is picked
    /// up again by `resume_pending`.
    pub fn detach(self) -> SigningRequest {
        self.task.abort();
        self.rendezvous.close(self.request.id);
        self.request
    }
}

impl SigningWorkflow {
    pub fn builder(
        store: Arc<dyn SigningRequestStore>,
        keys: Arc<dyn KeyLookup>,
    ) -> SigningWorkflowBuilder {
        SigningWorkflowBuilder::new(store, keys)
    }

    /// Fresh nonce for a new request.
    pub fn new_nonce() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn config(&self) -> &SigningConfig {
        &self.inner.config
    }

    /// Create a request and wait for its outcome.
    ///
    /// Expiry and invalid signatures come back as a [`SigningOutcome`], not
    /// as errors.
    pub async fn request_signature(
        &self,
        request_id: Uuid,
        agent_id: &str,
        message: &str,
        nonce: &str,
    ) -> Result<SigningOutcome, SigningError> {
        self.start(request_id, agent_id, message, nonce)
            .await?
            .wait()
            .await
    }

    /// Create a request, publish its envelope and start the waiter.
    #[tracing::instrument(skip(self, message, nonce))]
    pub async fn start(
        &self,
        request_id: Uuid,
        agent_id: &str,
        message: &str,
        nonce: &str,
    ) -> Result<PendingSignature, SigningError> {
        if agent_id.trim().is_empty() {
            return Err(SigningError::validation("agent_id must not be empty"));
        }
        if message.is_empty() {
            return Err(SigningError::validation("message must not be empty"));
        }
        if nonce.trim().is_empty() {
            return Err(SigningError::validation("nonce must not be empty"));
        }

        let request = SigningRequest::pending(
            request_id,
            agent_id,
            message,
            nonce,
            Utc::now(),
            self.inner.config.request_timeout,
        );

        let max = self.inner.config.max_pending_per_agent;
        let created = self
            .inner
            .store
            .create(&request, max)
            .await
            .map_err(|e| match e {
                DatabaseError::DuplicateNonce => SigningError::NonceReused,
                other => other.into(),
            })?;
        if !created {
            let pending = self.inner.store.count_pending_by_agent(agent_id).await?;
            return Err(SigningError::TooManyPending {
                agent_id: agent_id.to_string(),
                pending,
                max,
            });
        }
        tracing::info!(expires_at = %request.expires_at, "signing request created");

        // Waiter first, so the row never sits without one if publishing fails.
        let pending = self.spawn_waiter(request.clone());
        self.inner.rendezvous.publish(&request.envelope()).await?;
        Ok(pending)
    }

    /// Hand an agent's signature to the waiting workflow.
    ///
    /// Rejects requests the agent does not own, requests that already
    /// reached a terminal state, and requests past their deadline.
    #[tracing::instrument(skip(self, signature))]
    pub async fn submit_signature(
        &self,
        agent_id: &str,
        request_id: Uuid,
        signature: &str,
    ) -> Result<(), SigningError> {
        if signature.trim().is_empty() {
            return Err(SigningError::validation("signature must not be empty"));
        }

        let request = self.get(agent_id, request_id).await?;
        if request.status.is_terminal() {
            return Err(SigningError::AlreadyCompleted {
                id: request_id,
                status: request.status.to_string(),
            });
        }
        if request.is_past_deadline(Utc::now()) {
            return Err(SigningError::Expired { id: request_id });
        }

        let delivered = self
            .inner
            .rendezvous
            .deliver(
                request_id,
                SignatureSubmission {
                    signature: signature.trim().to_string(),
                },
            )
            .await;

        if let Err(e) = delivered {
            // Lost the race against the deadline or another submission.
            if let Some(current) = self.inner.store.find_by_id(request_id).await?
                && current.status.is_terminal()
            {
                return Err(SigningError::AlreadyCompleted {
                    id: request_id,
                    status: current.status.to_string(),
                });
            }
            return Err(e);
        }
        tracing::debug!("signature delivered");
        Ok(())
    }

    /// Restart waiters for every `pending` row, without publishing the
    /// envelopes again.
    pub async fn resume_pending(&self) -> Result<Vec<PendingSignature>, SigningError> {
        let rows = self.inner.store.list_pending(RESUME_BATCH).await?;
        if rows.len() as i64 == RESUME_BATCH {
            tracing::warn!(
                batch = RESUME_BATCH,
                "resume batch is full, remaining pending requests resume on the next call"
            );
        }
        tracing::info!(count = rows.len(), "resuming pending signing requests");
        Ok(rows
            .into_iter()
            .map(|request| self.spawn_waiter(request))
            .collect())
    }

    /// Expire `pending` rows past their deadline and drop submissions for
    /// requests that are already settled.
    ///
    /// Covers rows whose waiter died with its process or gave up on a
    /// failed terminal write.
    pub async fn sweep(&self) -> Result<SweepReport, SigningError> {
        let expired = self.inner.store.expire_overdue(Utc::now()).await?;
        let pruned = self.inner.rendezvous.prune().await?;
        if expired > 0 {
            tracing::info!(expired, "expired overdue signing requests");
        }
        Ok(SweepReport { expired, pruned })
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the task is
    /// aborted.
    pub fn spawn_sweep(&self, interval: Duration) -> JoinHandle<()> {
        let workflow = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = workflow.sweep().await {
                    tracing::warn!(error = %e, "signing request sweep failed");
                }
            }
        })
    }

    /// One of the agent's own requests.
    pub async fn get(&self, agent_id: &str, id: Uuid) -> Result<SigningRequest, SigningError> {
        match self.inner.store.find_by_id(id).await? {
            Some(request) if request.agent_id == agent_id => Ok(request),
            _ => Err(SigningError::NotFound { id }),
        }
    }

    /// The agent's requests, newest first.
    ///
    /// `status_filter` is a comma-separated list such as
    /// `"pending,completed"`; empty means any status.
    pub async fn list(
        &self,
        agent_id: &str,
        status_filter: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<SigningRequest>, SigningError> {
        let filter = StatusFilter::parse(status_filter)?;
        let page = Page::new(limit, offset)?;
        Ok(self.inner.store.list(agent_id, &filter, page).await?)
    }

    /// Which request, if any, a signature answered.
    pub async fn lookup_signature(
        &self,
        signature: &str,
    ) -> Result<Option<SigningRequest>, SigningError> {
        if signature.trim().is_empty() {
            return Err(SigningError::validation("signature must not be empty"));
        }
        Ok(self.inner.store.find_by_signature(signature.trim()).await?)
    }

    fn spawn_waiter(&self, request: SigningRequest) -> PendingSignature {
        self.inner.rendezvous.open(request.id);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn({
            let request = request.clone();
            async move { inner.wait_for_signature(request).await }
        });
        PendingSignature {
            request,
            task,
            rendezvous: Arc::clone(&self.inner.rendezvous),
        }
    }
}

fn expired_now() -> StatusUpdate {
    StatusUpdate::Expired {
        completed_at: Utc::now(),
    }
}

impl Inner {
    #[tracing::instrument(skip_all, fields(request_id = %request.id, agent_id = %request.agent_id))]
    async fn wait_for_signature(&self, request: SigningRequest) -> Result<SigningOutcome, SigningError> {
        let deadline = Instant::now() + request.remaining(Utc::now());

        let result = match self.decide(&request, deadline).await {
            Ok(update) => self.finalize(request.id, update).await,
            Err(fatal) => {
                tracing::error!(error = %fatal, "submission cannot be verified, expiring request");
                if let Err(e) = self.finalize(request.id, expired_now()).await {
                    tracing::warn!(error = %e, "could not expire request, leaving it to the sweep");
                }
                Err(fatal)
            }
        };
        self.rendezvous.close(request.id);
        result
    }

    /// Wait for a submission or the deadline and work out the terminal
    /// transition. `Err` only for failures that waiting cannot fix.
    async fn decide(
        &self,
        request: &SigningRequest,
        deadline: Instant,
    ) -> Result<StatusUpdate, SigningError> {
        let mut submission: Option<SignatureSubmission> = None;
        loop {
            if submission.is_none() {
                tokio::select! {
                    received = self.rendezvous.receive(request.id) => match received {
                        Ok(received) => submission = Some(received),
                        Err(e) => tracing::warn!(error = %e, "receiving submission failed, retrying"),
                    },
                    _ = tokio::time::sleep_until(deadline) => return Ok(expired_now()),
                }
            }

            if let Some(received) = &submission {
                match self.check(request, &received.signature).await {
                    Ok(valid) => {
                        return Ok(StatusUpdate::Completed {
                            signature: received.signature.clone(),
                            valid,
                            completed_at: Utc::now(),
                        });
                    }
                    Err(e @ SigningError::Crypto(_)) => return Err(e),
                    Err(e) => tracing::warn!(error = %e, "verifying submission failed, retrying"),
                }
            }

            let resume_at = Instant::now() + CHECK_RETRY_PAUSE;
            if resume_at >= deadline {
                tokio::time::sleep_until(deadline).await;
                return Ok(expired_now());
            }
            tokio::time::sleep_until(resume_at).await;
        }
    }

    /// Verify a submission. Unknown agents never verify.
    async fn check(&self, request: &SigningRequest, signature: &str) -> Result<bool, SigningError> {
        let Some(public_key) = self.keys.public_key(&request.agent_id).await? else {
            tracing::info!("no public key registered for agent");
            return Ok(false);
        };
        Ok(self
            .verifier
            .verify(&request.message, &request.nonce, signature, &public_key)?)
    }

    /// Apply the terminal transition, or report whichever one got there
    /// first.
    async fn finalize(&self, id: Uuid, update: StatusUpdate) -> Result<SigningOutcome, SigningError> {
        if let Some(row) = self.store.update_status(id, &update).await? {
            tracing::info!(status = %row.status, valid = ?row.valid, "signing request finished");
            return row
                .outcome()
                .ok_or_else(|| DatabaseError::Query(format!("request {id} still pending")).into());
        }

        let row = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(SigningError::NotFound { id })?;
        tracing::debug!(
            attempted = %update.status(),
            stored = %row.status,
            "terminal transition already applied"
        );
        row.outcome()
            .ok_or_else(|| DatabaseError::Query(format!("request {id} still pending")).into())
    }
}
