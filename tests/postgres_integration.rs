//! PostgreSQL backend checks against a throwaway container.
//!
//! Needs Docker: `cargo test --features integration --test postgres_integration`

#![cfg(all(feature = "postgres", feature = "integration"))]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::ContainerAsync;
use testcontainers_modules::testcontainers::runners::AsyncRunner;
use uuid::Uuid;

use moltnet_signing::config::{DatabaseBackend, DatabaseConfig, SigningConfig};
use moltnet_signing::crypto::{self, KeyMaterial};
use moltnet_signing::db::postgres::PgBackend;
use moltnet_signing::db::retry::{ConflictRetryPolicy, RetryConfig};
use moltnet_signing::db::{Database, SigningRequestStore, SubmissionStore};
use moltnet_signing::error::DatabaseError;
use moltnet_signing::signing::{
    DurableRendezvous, NonceLedger, RetryingStore, SigningRequest, SigningStatus,
    SigningWorkflow, StaticKeyLookup, StatusUpdate,
};

async fn start() -> (ContainerAsync<Postgres>, Arc<PgBackend>) {
    let container = Postgres::default().start().await.unwrap();
    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(5432).await.unwrap();

    let config = DatabaseConfig {
        backend: DatabaseBackend::Postgres,
        url: Some(SecretString::from(format!(
            "postgres://postgres:postgres@{host}:{port}/postgres"
        ))),
        pool_size: 8,
        libsql_path: std::env::temp_dir().join("unused.db"),
        libsql_url: None,
        libsql_auth_token: None,
    };
    let backend = PgBackend::new(&config).await.unwrap();
    backend.run_migrations().await.unwrap();
    (container, Arc::new(backend))
}

fn policy() -> ConflictRetryPolicy {
    ConflictRetryPolicy::new(RetryConfig {
        max_retries: 8,
        base_delay: Duration::from_millis(5),
    })
}

#[tokio::test]
async fn racing_terminal_writes_apply_once() {
    let (_container, db) = start().await;
    let store = Arc::new(RetryingStore::new(db.clone(), policy()));

    let request = SigningRequest::pending(
        Uuid::new_v4(),
        "agent-1",
        "race",
        "nonce",
        Utc::now(),
        Duration::from_secs(60),
    );
    assert!(store.create(&request, i64::MAX).await.unwrap());

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let id = request.id;
        handles.push(tokio::spawn(async move {
            let update = if i % 2 == 0 {
                StatusUpdate::Completed {
                    signature: format!("sig-{i}"),
                    valid: true,
                    completed_at: Utc::now(),
                }
            } else {
                StatusUpdate::Expired {
                    completed_at: Utc::now(),
                }
            };
            store.update_status(id, &update).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let stored = store.find_by_id(request.id).await.unwrap().unwrap();
    assert!(stored.status.is_terminal());
}

#[tokio::test]
async fn concurrent_nonce_consumption_accepts_one() {
    let (_container, db) = start().await;
    let ledger = NonceLedger::new(db.clone(), policy());
    let expires = Utc::now() + chrono::Duration::minutes(5);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.consume("shared", expires).await.unwrap()
        }));
    }
    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
}

#[tokio::test]
async fn workflow_completes_on_postgres() {
    let (_container, db) = start().await;
    let keys = KeyMaterial::generate();
    let lookup = Arc::new(StaticKeyLookup::new().with_key("agent-1", keys.public_key.clone()));
    let workflow = SigningWorkflow::builder(db.clone(), lookup)
        .config(SigningConfig {
            request_timeout: Duration::from_secs(10),
            ..SigningConfig::default()
        })
        .build()
        .unwrap();

    let id = Uuid::new_v4();
    let nonce = SigningWorkflow::new_nonce();
    let pending = workflow.start(id, "agent-1", "pg", &nonce).await.unwrap();
    let signature = crypto::sign_with_nonce("pg", &nonce, &keys.private_key).unwrap();
    workflow
        .submit_signature("agent-1", id, &signature)
        .await
        .unwrap();

    let outcome = pending.wait().await.unwrap();
    assert_eq!(outcome.status, SigningStatus::Completed);
    assert_eq!(outcome.valid, Some(true));
}

fn pending(agent: &str, nonce: &str) -> SigningRequest {
    SigningRequest::pending(
        Uuid::new_v4(),
        agent,
        "pg",
        nonce,
        Utc::now(),
        Duration::from_secs(60),
    )
}

#[tokio::test]
async fn concurrent_creates_respect_the_pending_cap() {
    let (_container, db) = start().await;
    let store = Arc::new(RetryingStore::new(db.clone(), policy()));

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .create(&pending("capped", &format!("n-{i}")), 3)
                .await
                .unwrap()
        }));
    }
    let mut created = 0;
    for handle in handles {
        if handle.await.unwrap() {
            created += 1;
        }
    }
    assert_eq!(created, 3);
    assert_eq!(db.count_pending_by_agent("capped").await.unwrap(), 3);
}

#[tokio::test]
async fn reused_nonce_is_rejected() {
    let (_container, db) = start().await;
    assert!(db.create(&pending("agent-1", "shared"), i64::MAX).await.unwrap());

    let err = db
        .create(&pending("agent-2", "shared"), i64::MAX)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::DuplicateNonce));
}

#[tokio::test]
async fn submissions_and_overdue_rows_on_postgres() {
    let (_container, db) = start().await;
    let live = pending("agent-1", "live");
    let overdue = SigningRequest::pending(
        Uuid::new_v4(),
        "agent-1",
        "late",
        "overdue",
        Utc::now() - chrono::Duration::minutes(5),
        Duration::from_secs(1),
    );
    assert!(db.create(&live, i64::MAX).await.unwrap());
    assert!(db.create(&overdue, i64::MAX).await.unwrap());

    assert!(db.insert_submission(live.id, "first", Utc::now()).await.unwrap());
    assert!(!db.insert_submission(live.id, "second", Utc::now()).await.unwrap());
    assert_eq!(
        db.find_submission(live.id).await.unwrap().unwrap().signature,
        "first"
    );

    assert_eq!(db.expire_overdue(Utc::now()).await.unwrap(), 1);
    assert!(!db.insert_submission(overdue.id, "late", Utc::now()).await.unwrap());
    assert_eq!(db.delete_settled_submissions().await.unwrap(), 0);

    db.update_status(
        live.id,
        &StatusUpdate::Completed {
            signature: "first".to_string(),
            valid: false,
            completed_at: Utc::now(),
        },
    )
    .await
    .unwrap();
    assert_eq!(db.delete_settled_submissions().await.unwrap(), 1);
}

#[tokio::test]
async fn submission_from_another_workflow_completes_the_waiter() {
    let (_container, db) = start().await;
    let keys = KeyMaterial::generate();
    let lookup = Arc::new(StaticKeyLookup::new().with_key("agent-1", keys.public_key.clone()));
    let build = || {
        let rendezvous = DurableRendezvous::new(db.clone(), policy(), Duration::from_millis(20));
        SigningWorkflow::builder(db.clone(), lookup.clone())
            .rendezvous(Arc::new(rendezvous))
            .config(SigningConfig {
                request_timeout: Duration::from_secs(10),
                ..SigningConfig::default()
            })
            .build()
            .unwrap()
    };
    let waiting = build();
    let submitting = build();

    let id = Uuid::new_v4();
    let nonce = SigningWorkflow::new_nonce();
    let pending = waiting.start(id, "agent-1", "pg", &nonce).await.unwrap();
    let signature = crypto::sign_with_nonce("pg", &nonce, &keys.private_key).unwrap();
    submitting
        .submit_signature("agent-1", id, &signature)
        .await
        .unwrap();

    let outcome = pending.wait().await.unwrap();
    assert_eq!(outcome.status, SigningStatus::Completed);
    assert_eq!(outcome.valid, Some(true));
}
