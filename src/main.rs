mod bridge;
mod connection;
mod credentials;
mod errors;
mod firestore;
mod protocol;
mod query;
mod sandbox;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bridge::Bridge;
use firestore::RestConnector;

/// Firestore connection and query bridge for a desktop browsing shell.
///
/// Owns the single live database connection, lists collections, and executes
/// user-authored query scripts against the connection. Requests arrive as
/// newline-delimited JSON on stdin; every response is a value with a
/// `success` discriminant on stdout. Logs go to stderr.
#[derive(Parser)]
#[command(name = "firestore-bridge-rs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Firestore connection/query bridge (stdio JSON protocol)", long_about = None)]
struct Cli {
    /// Upper bound in seconds for a single query or listing operation.
    #[arg(long, default_value_t = 60)]
    query_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "firestore_bridge_rs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let connector = Arc::new(RestConnector::new()?);
    let bridge = Bridge::new(connector, Duration::from_secs(cli.query_timeout));

    tracing::info!("Bridge ready; awaiting requests on stdin");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    bridge.serve(stdin, tokio::io::stdout()).await?;
    tracing::info!("Input closed; shutting down");

    Ok(())
}
