//! End-to-end signing-request scenarios against an embedded libSQL file.

#![cfg(feature = "libsql")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use uuid::Uuid;

use moltnet_signing::config::SigningConfig;
use moltnet_signing::crypto::{self, KeyMaterial};
use moltnet_signing::db::libsql::LibSqlBackend;
use moltnet_signing::db::retry::{ConflictRetryPolicy, RetryConfig};
use moltnet_signing::db::{Database, SigningRequestStore};
use moltnet_signing::error::SigningError;
use moltnet_signing::signing::{
    DurableRendezvous, InMemoryRendezvous, KeyLookup, SigningOutcome, SigningStatus,
    SigningWorkflow, StaticKeyLookup, SweepReport,
};

const AGENT: &str = "agent-7";

struct Harness {
    _dir: TempDir,
    db: Arc<LibSqlBackend>,
    keys: KeyMaterial,
    lookup: Arc<StaticKeyLookup>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = LibSqlBackend::new_local(&dir.path().join("moltnet.db"))
            .await
            .unwrap();
        db.run_migrations().await.unwrap();

        let keys = KeyMaterial::generate();
        let lookup = Arc::new(StaticKeyLookup::new().with_key(AGENT, keys.public_key.clone()));
        Self {
            _dir: dir,
            db: Arc::new(db),
            keys,
            lookup,
        }
    }

    fn workflow(&self, timeout: Duration) -> (SigningWorkflow, Arc<InMemoryRendezvous>) {
        let rendezvous = Arc::new(InMemoryRendezvous::new());
        let workflow = SigningWorkflow::builder(self.db.clone(), self.lookup.clone())
            .rendezvous(rendezvous.clone())
            .config(config(timeout))
            .build()
            .unwrap();
        (workflow, rendezvous)
    }

    /// Workflow whose submissions live in the database.
    fn durable_workflow(&self, timeout: Duration) -> SigningWorkflow {
        let config = config(timeout);
        let rendezvous = DurableRendezvous::new(
            self.db.clone(),
            ConflictRetryPolicy::new(config.retry),
            Duration::from_millis(20),
        );
        SigningWorkflow::builder(self.db.clone(), self.lookup.clone())
            .rendezvous(Arc::new(rendezvous))
            .config(config)
            .build()
            .unwrap()
    }

    fn sign(&self, message: &str, nonce: &str) -> String {
        crypto::sign_with_nonce(message, nonce, &self.keys.private_key).unwrap()
    }
}

fn config(timeout: Duration) -> SigningConfig {
    SigningConfig {
        request_timeout: timeout,
        max_pending_per_agent: 3,
        retry: RetryConfig {
            max_retries: 5,
            base_delay: Duration::ZERO,
        },
        ..SigningConfig::default()
    }
}

fn outcome(id: Uuid, status: SigningStatus, valid: Option<bool>) -> SigningOutcome {
    SigningOutcome {
        request_id: id,
        status,
        valid,
    }
}

#[tokio::test]
async fn valid_signature_completes_the_request() {
    let h = Harness::new().await;
    let (workflow, rendezvous) = h.workflow(Duration::from_secs(10));
    let mut envelopes = rendezvous.subscribe();

    let id = Uuid::new_v4();
    let nonce = SigningWorkflow::new_nonce();
    let pending = workflow
        .start(id, AGENT, "prove it", &nonce)
        .await
        .unwrap();

    let envelope = envelopes.recv().await.unwrap();
    assert_eq!(envelope.request_id, id);
    assert_eq!(envelope.nonce, nonce);

    let signature = h.sign(&envelope.message, &envelope.nonce);
    workflow
        .submit_signature(AGENT, id, &signature)
        .await
        .unwrap();

    let result = pending.wait().await.unwrap();
    assert_eq!(result, outcome(id, SigningStatus::Completed, Some(true)));

    let stored = workflow.get(AGENT, id).await.unwrap();
    assert_eq!(stored.signature.as_deref(), Some(signature.as_str()));
    assert!(stored.completed_at.is_some());

    let found = workflow.lookup_signature(&signature).await.unwrap().unwrap();
    assert_eq!(found.id, id);
}

#[tokio::test]
async fn unanswered_request_expires_and_rejects_late_submissions() {
    let h = Harness::new().await;
    let (workflow, _) = h.workflow(Duration::from_millis(200));

    let id = Uuid::new_v4();
    let nonce = SigningWorkflow::new_nonce();
    let result = workflow
        .request_signature(id, AGENT, "too slow", &nonce)
        .await
        .unwrap();
    assert_eq!(result, outcome(id, SigningStatus::Expired, None));

    let stored = workflow.get(AGENT, id).await.unwrap();
    assert_eq!(stored.status, SigningStatus::Expired);
    assert_eq!(stored.signature, None);
    assert!(stored.completed_at.is_some());

    let err = workflow
        .submit_signature(AGENT, id, &h.sign("too slow", &nonce))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SIGNING_REQUEST_ALREADY_COMPLETED");
}

#[tokio::test]
async fn signature_over_another_nonce_is_invalid() {
    let h = Harness::new().await;
    let (workflow, _) = h.workflow(Duration::from_secs(10));

    let id = Uuid::new_v4();
    let pending = workflow
        .start(id, AGENT, "bind me", &SigningWorkflow::new_nonce())
        .await
        .unwrap();

    let replayed = h.sign("bind me", "some-other-nonce");
    workflow.submit_signature(AGENT, id, &replayed).await.unwrap();

    let result = pending.wait().await.unwrap();
    assert_eq!(result, outcome(id, SigningStatus::Completed, Some(false)));
}

#[tokio::test]
async fn agent_without_a_key_never_verifies() {
    let h = Harness::new().await;
    let (workflow, _) = h.workflow(Duration::from_secs(10));

    let id = Uuid::new_v4();
    let nonce = SigningWorkflow::new_nonce();
    let pending = workflow
        .start(id, "unregistered", "who am i", &nonce)
        .await
        .unwrap();
    workflow
        .submit_signature("unregistered", id, &h.sign("who am i", &nonce))
        .await
        .unwrap();

    let result = pending.wait().await.unwrap();
    assert_eq!(result, outcome(id, SigningStatus::Completed, Some(false)));
}

#[tokio::test]
async fn requests_are_scoped_to_their_agent() {
    let h = Harness::new().await;
    let (workflow, _) = h.workflow(Duration::from_secs(10));

    let id = Uuid::new_v4();
    let pending = workflow
        .start(id, AGENT, "mine", &SigningWorkflow::new_nonce())
        .await
        .unwrap();

    let err = workflow
        .submit_signature("intruder", id, "c2ln")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SIGNING_REQUEST_NOT_FOUND");
    assert_eq!(
        workflow.get("intruder", id).await.unwrap_err().code(),
        "SIGNING_REQUEST_NOT_FOUND"
    );
    assert!(
        workflow
            .list("intruder", "", None, None)
            .await
            .unwrap()
            .is_empty()
    );

    pending.detach();
}

#[tokio::test]
async fn pending_cap_and_listing() {
    let h = Harness::new().await;
    let (workflow, _) = h.workflow(Duration::from_secs(10));

    let mut ids = Vec::new();
    let mut waiters = Vec::new();
    for i in 0..3 {
        let id = Uuid::new_v4();
        waiters.push(
            workflow
                .start(id, AGENT, &format!("m{i}"), &SigningWorkflow::new_nonce())
                .await
                .unwrap(),
        );
        ids.push(id);
    }

    let err = workflow
        .start(Uuid::new_v4(), AGENT, "one too many", "n")
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), "TOO_MANY_PENDING_REQUESTS");

    let pending = workflow.list(AGENT, "pending", None, None).await.unwrap();
    assert_eq!(pending.len(), 3);
    assert!(
        workflow
            .list(AGENT, "completed,expired", None, None)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        workflow
            .list(AGENT, "pending,bogus", None, None)
            .await
            .unwrap_err()
            .code(),
        "VALIDATION_FAILED"
    );
    assert_eq!(
        workflow
            .list(AGENT, "", Some(101), None)
            .await
            .unwrap_err()
            .code(),
        "VALIDATION_FAILED"
    );

    for waiter in waiters {
        waiter.detach();
    }
}

#[tokio::test]
async fn empty_message_is_rejected_before_touching_the_store() {
    let h = Harness::new().await;
    let (workflow, _) = h.workflow(Duration::from_secs(10));

    let err = workflow
        .start(Uuid::new_v4(), AGENT, "", "n")
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), "VALIDATION_FAILED");
    assert!(
        workflow
            .list(AGENT, "", None, None)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn pending_requests_resume_after_restart() {
    let h = Harness::new().await;
    let id = Uuid::new_v4();
    let nonce = SigningWorkflow::new_nonce();

    // First process creates the request and goes away.
    {
        let (workflow, _) = h.workflow(Duration::from_secs(10));
        workflow
            .start(id, AGENT, "survive restarts", &nonce)
            .await
            .unwrap()
            .detach();
    }

    // Second process picks it up without publishing again.
    let (workflow, rendezvous) = h.workflow(Duration::from_secs(10));
    let mut envelopes = rendezvous.subscribe();
    let mut resumed = workflow.resume_pending().await.unwrap();
    assert_eq!(resumed.len(), 1);
    assert!(envelopes.try_recv().is_err());

    workflow
        .submit_signature(AGENT, id, &h.sign("survive restarts", &nonce))
        .await
        .unwrap();
    let result = resumed.pop().unwrap().wait().await.unwrap();
    assert_eq!(result, outcome(id, SigningStatus::Completed, Some(true)));
}

#[tokio::test]
async fn double_resume_produces_one_terminal_transition() {
    let h = Harness::new().await;
    let id = Uuid::new_v4();
    let nonce = SigningWorkflow::new_nonce();

    let (first, _) = h.workflow(Duration::from_millis(600));
    first
        .start(id, AGENT, "once", &nonce)
        .await
        .unwrap()
        .detach();

    let (workflow, _) = h.workflow(Duration::from_millis(600));
    let a = workflow.resume_pending().await.unwrap();
    let b = workflow.resume_pending().await.unwrap();

    workflow
        .submit_signature(AGENT, id, &h.sign("once", &nonce))
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    for waiter in a.into_iter().chain(b) {
        outcomes.push(waiter.wait().await.unwrap());
    }

    // One waiter takes the submission; the other times out, loses the
    // conditional write and reports the stored result.
    let expected = outcome(id, SigningStatus::Completed, Some(true));
    assert_eq!(outcomes, vec![expected, expected]);
}

#[tokio::test]
async fn a_nonce_cannot_be_reused_for_a_second_request() {
    let h = Harness::new().await;
    let (workflow, _) = h.workflow(Duration::from_secs(10));

    let nonce = SigningWorkflow::new_nonce();
    let first = Uuid::new_v4();
    let pending = workflow.start(first, AGENT, "pay 10", &nonce).await.unwrap();
    let signature = h.sign("pay 10", &nonce);
    workflow
        .submit_signature(AGENT, first, &signature)
        .await
        .unwrap();
    assert_eq!(
        pending.wait().await.unwrap(),
        outcome(first, SigningStatus::Completed, Some(true))
    );

    // Same message and nonce again: the captured signature must not be
    // usable against a fresh request.
    let second = Uuid::new_v4();
    let err = workflow
        .start(second, AGENT, "pay 10", &nonce)
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), "NONCE_ALREADY_USED");
    assert_eq!(
        workflow.get(AGENT, second).await.unwrap_err().code(),
        "SIGNING_REQUEST_NOT_FOUND"
    );
}

struct UnreachableKeys;

#[async_trait]
impl KeyLookup for UnreachableKeys {
    async fn public_key(&self, agent_id: &str) -> Result<Option<String>, SigningError> {
        Err(SigningError::KeyLookup {
            agent_id: agent_id.to_string(),
            reason: "key directory offline".to_string(),
        })
    }
}

#[tokio::test]
async fn failing_key_lookup_still_ends_in_a_terminal_state() {
    let h = Harness::new().await;
    let workflow = SigningWorkflow::builder(h.db.clone(), Arc::new(UnreachableKeys))
        .config(config(Duration::from_millis(300)))
        .build()
        .unwrap();

    let id = Uuid::new_v4();
    let nonce = SigningWorkflow::new_nonce();
    let pending = workflow.start(id, AGENT, "lookup fails", &nonce).await.unwrap();
    workflow
        .submit_signature(AGENT, id, &h.sign("lookup fails", &nonce))
        .await
        .unwrap();

    let result = pending.wait().await.unwrap();
    assert_eq!(result, outcome(id, SigningStatus::Expired, None));

    let stored = workflow.get(AGENT, id).await.unwrap();
    assert_eq!(stored.status, SigningStatus::Expired);
    assert_eq!(h.db.count_pending_by_agent(AGENT).await.unwrap(), 0);
}

#[tokio::test]
async fn undecodable_key_expires_the_request_and_reports_the_error() {
    let h = Harness::new().await;
    let lookup = Arc::new(StaticKeyLookup::new().with_key(AGENT, "ed25519:***"));
    let workflow = SigningWorkflow::builder(h.db.clone(), lookup)
        .config(config(Duration::from_secs(10)))
        .build()
        .unwrap();

    let id = Uuid::new_v4();
    let pending = workflow
        .start(id, AGENT, "bad key", &SigningWorkflow::new_nonce())
        .await
        .unwrap();
    workflow.submit_signature(AGENT, id, "c2ln").await.unwrap();

    assert_eq!(pending.wait().await.unwrap_err().code(), "CRYPTO_ERROR");
    let stored = workflow.get(AGENT, id).await.unwrap();
    assert_eq!(stored.status, SigningStatus::Expired);
}

#[tokio::test]
async fn submission_made_before_a_restart_is_not_lost() {
    let h = Harness::new().await;
    let id = Uuid::new_v4();
    let nonce = SigningWorkflow::new_nonce();
    let signature = h.sign("durable", &nonce);

    // The process accepts the signature and dies before finalizing.
    {
        let workflow = h.durable_workflow(Duration::from_secs(10));
        let pending = workflow.start(id, AGENT, "durable", &nonce).await.unwrap();
        pending.detach();
        workflow
            .submit_signature(AGENT, id, &signature)
            .await
            .unwrap();
    }
    assert_eq!(
        h.db.find_by_id(id).await.unwrap().unwrap().status,
        SigningStatus::Pending
    );

    let workflow = h.durable_workflow(Duration::from_secs(10));
    let mut resumed = workflow.resume_pending().await.unwrap();
    assert_eq!(resumed.len(), 1);
    let result = resumed.pop().unwrap().wait().await.unwrap();
    assert_eq!(result, outcome(id, SigningStatus::Completed, Some(true)));

    let stored = workflow.get(AGENT, id).await.unwrap();
    assert_eq!(stored.signature.as_deref(), Some(signature.as_str()));
    assert_eq!(
        workflow.sweep().await.unwrap(),
        SweepReport {
            expired: 0,
            pruned: 1
        }
    );
}

#[tokio::test]
async fn sweep_expires_requests_whose_waiter_is_gone() {
    let h = Harness::new().await;
    let (workflow, _) = h.workflow(Duration::from_millis(100));

    let id = Uuid::new_v4();
    workflow
        .start(id, AGENT, "abandoned", &SigningWorkflow::new_nonce())
        .await
        .unwrap()
        .detach();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let report = workflow.sweep().await.unwrap();
    assert_eq!(report.expired, 1);
    let stored = workflow.get(AGENT, id).await.unwrap();
    assert_eq!(stored.status, SigningStatus::Expired);
    assert!(stored.completed_at.is_some());
    assert_eq!(workflow.sweep().await.unwrap().expired, 0);
}

#[tokio::test]
async fn concurrent_starts_never_exceed_the_pending_cap() {
    let h = Harness::new().await;
    let (workflow, _) = h.workflow(Duration::from_secs(10));

    let mut handles = Vec::new();
    for i in 0..8 {
        let workflow = workflow.clone();
        handles.push(tokio::spawn(async move {
            workflow
                .start(
                    Uuid::new_v4(),
                    AGENT,
                    &format!("burst {i}"),
                    &SigningWorkflow::new_nonce(),
                )
                .await
        }));
    }

    let mut started = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(pending) => {
                started += 1;
                pending.detach();
            }
            Err(e) => assert_eq!(e.code(), "TOO_MANY_PENDING_REQUESTS"),
        }
    }
    assert_eq!(started, 3);
    assert_eq!(h.db.count_pending_by_agent(AGENT).await.unwrap(), 3);
}
