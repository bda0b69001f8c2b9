//! Command-line interface for the signing service.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::config::{Config, DatabaseBackend, DatabaseConfig};
use crate::crypto;
use crate::db::{self, Database};
use crate::db::retry::ConflictRetryPolicy;
use crate::signing::{
    DurableRendezvous, KeyLookup, NonceLedger, SigningWorkflow, StaticKeyLookup,
};

#[derive(Parser, Debug)]
#[command(name = "moltnet-signing", version, about = "Durable signing requests for agents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Apply database migrations.
    Migrate {
        /// Also write the database selection to ~/.moltnet/.env.
        #[arg(long)]
        save: bool,
    },

    /// Resume pending signing requests, expire overdue ones and sweep
    /// expired nonces until Ctrl-C.
    Worker {
        /// JSON object mapping agent ids to `ed25519:` public keys.
        #[arg(long, env = "MOLTNET_AGENT_KEYS")]
        keys: Option<PathBuf>,
    },

    /// Submit an agent's signature for a pending request. The waiting
    /// worker picks it up from the database.
    Submit {
        #[arg(long)]
        agent_id: String,
        #[arg(long)]
        request_id: Uuid,
        #[arg(long)]
        signature: String,
    },

    /// Sign a message/nonce pair (agent side).
    Sign {
        #[arg(long)]
        message: String,
        #[arg(long)]
        nonce: String,
        #[arg(long, env = "MOLTNET_PRIVATE_KEY", hide_env_values = true)]
        private_key: String,
    },

    /// Verify a signature over a message/nonce pair.
    Verify {
        #[arg(long)]
        message: String,
        #[arg(long)]
        nonce: String,
        #[arg(long)]
        signature: String,
        #[arg(long)]
        public_key: String,
    },

    /// Print the fingerprint of a public key.
    Fingerprint {
        #[arg(long)]
        public_key: String,
    },

    /// Generate a fresh key pair.
    Keygen,
}

/// Dispatch a parsed command.
pub async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Migrate { save } => run_migrate(save).await,
        Command::Worker { keys } => run_worker(keys.as_deref()).await,
        Command::Submit {
            agent_id,
            request_id,
            signature,
        } => run_submit(&agent_id, request_id, &signature).await,
        Command::Sign {
            message,
            nonce,
            private_key,
        } => {
            let signature =
                crypto::sign_with_nonce(&message, &nonce, &SecretString::from(private_key))?;
            println!("{signature}");
            Ok(())
        }
        Command::Verify {
            message,
            nonce,
            signature,
            public_key,
        } => {
            let valid = crypto::verify_with_nonce(&message, &nonce, &signature, &public_key)?;
            println!("{}", serde_json::json!({ "valid": valid }));
            if !valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Fingerprint { public_key } => {
            println!("{}", crypto::fingerprint(&public_key)?);
            Ok(())
        }
        Command::Keygen => {
            let keys = crypto::KeyMaterial::generate();
            println!(
                "{}",
                serde_json::json!({
                    "public_key": keys.public_key,
                    "private_key": keys.private_key.expose_secret(),
                    "fingerprint": keys.fingerprint,
                })
            );
            Ok(())
        }
    }
}

async fn run_migrate(save: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let db = db::connect(&config.database).await?;
    db.run_migrations().await?;
    println!("Migrations applied ({})", config.database.backend.as_str());

    if save {
        let vars = bootstrap_vars(&config.database);
        let vars: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        crate::bootstrap::save_bootstrap_env(&vars)?;
        println!(
            "Saved database settings to {}",
            crate::bootstrap::moltnet_env_path().display()
        );
    }
    Ok(())
}

fn bootstrap_vars(config: &DatabaseConfig) -> Vec<(&'static str, String)> {
    let mut vars = vec![("DATABASE_BACKEND", config.backend.as_str().to_string())];
    match config.backend {
        DatabaseBackend::Postgres => {
            if let Some(url) = &config.url {
                vars.push(("DATABASE_URL", url.expose_secret().to_string()));
            }
        }
        DatabaseBackend::LibSql => {
            vars.push((
                "LIBSQL_PATH",
                config.libsql_path.to_string_lossy().into_owned(),
            ));
            if let Some(url) = &config.libsql_url {
                vars.push(("LIBSQL_URL", url.clone()));
            }
        }
    }
    vars
}

/// Workflow whose mailbox is the shared database, so every process built
/// this way can answer every other process's waiters.
fn durable_workflow(
    config: &Config,
    db: Arc<dyn Database>,
    keys: Arc<dyn KeyLookup>,
) -> anyhow::Result<SigningWorkflow> {
    let rendezvous = DurableRendezvous::new(
        db.clone(),
        ConflictRetryPolicy::new(config.signing.retry),
        config.signing.submission_poll_interval,
    );
    Ok(SigningWorkflow::builder(db, keys)
        .rendezvous(Arc::new(rendezvous))
        .config(config.signing.clone())
        .build()?)
}

async fn run_submit(agent_id: &str, request_id: Uuid, signature: &str) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let db = db::connect(&config.database).await?;
    // Verification happens in the waiting worker; keys are not needed here.
    let workflow = durable_workflow(&config, db, Arc::new(StaticKeyLookup::new()))?;

    if let Err(e) = workflow
        .submit_signature(agent_id, request_id, signature)
        .await
    {
        println!("{}", serde_json::to_string(&e.to_error_payload())?);
        std::process::exit(1);
    }
    println!("{}", serde_json::json!({ "request_id": request_id, "submitted": true }));
    Ok(())
}

async fn run_worker(keys_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let db = db::connect(&config.database).await?;
    db.run_migrations().await?;

    let keys = Arc::new(load_keys(keys_path)?);
    let workflow = durable_workflow(&config, db.clone(), keys)?;

    let ledger = NonceLedger::new(
        db.clone(),
        ConflictRetryPolicy::new(config.signing.retry),
    );
    let cleanup = ledger.spawn_cleanup(config.signing.nonce_cleanup_interval);
    let sweep = workflow.spawn_sweep(config.signing.sweep_interval);

    for pending in workflow.resume_pending().await? {
        let request_id = pending.request.id;
        tokio::spawn(async move {
            match pending.wait().await {
                Ok(outcome) => tracing::info!(
                    %request_id,
                    status = %outcome.status,
                    valid = ?outcome.valid,
                    "resumed signing request finished"
                ),
                Err(e) => tracing::error!(%request_id, error = %e, "resumed signing request failed"),
            }
        });
    }

    tracing::info!("worker running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cleanup.abort();
    sweep.abort();
    Ok(())
}

fn load_keys(path: Option<&Path>) -> anyhow::Result<StaticKeyLookup> {
    let lookup = StaticKeyLookup::new();
    let Some(path) = path else {
        tracing::warn!("no agent key file given, every submission will verify as invalid");
        return Ok(lookup);
    };

    let raw = std::fs::read_to_string(path)?;
    let keys: HashMap<String, String> = serde_json::from_str(&raw)?;
    for (agent_id, public_key) in keys {
        crypto::fingerprint(&public_key)
            .map_err(|e| anyhow::anyhow!("bad key for agent {agent_id}: {e}"))?;
        lookup.insert(agent_id, public_key);
    }
    Ok(lookup)
}
