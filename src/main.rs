use clap::Parser;
use tracing_subscriber::EnvFilter;

use moltnet_signing::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli.command);
    moltnet_signing::cli::run(cli.command).await
}

/// `RUST_LOG` filter (default `info`), JSON lines when `LOG_FORMAT=json`.
fn init_tracing(command: &Command) {
    // One-shot crypto helpers print their result on stdout; keep logs quiet.
    let default = match command {
        Command::Migrate { .. } | Command::Worker { .. } => "moltnet_signing=info",
        _ => "warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
