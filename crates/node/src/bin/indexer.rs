#![forbid(unsafe_code)]

//! The indexer binary: serves webhook intake and the query API over the
//! persistent rejection/snapshot store, re-subscribing to the metagraph's
//! webhook feed idempotently at boot.

use anyhow::{Context, Result};
use clap::Parser;
use loom_client::{DataLayerApi, HttpDataLayer};
use loom_indexer::{ensure_subscription, run_server, IndexerState, Store};
use loom_node::{init_observability, shutdown_channel};
use loom_types::config::Endpoints;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(name = "indexer", about = "Indexes metagraph rejections and confirmations")]
struct IndexerOpts {
    #[clap(long, env = "INDEXER_LISTEN_ADDR", default_value = "0.0.0.0:8090")]
    listen_addr: SocketAddr,
    #[clap(long, env = "INDEXER_DB_PATH", default_value = "indexer.redb")]
    db_path: PathBuf,
    #[clap(long, env = "ML0_URL",
           help = "Snapshot layer base URL, used for webhook subscription")]
    ml0_url: Option<String>,
    #[clap(long, env = "DL1_URL", use_value_delimiter = true)]
    dl1_url: Vec<String>,
    #[clap(long, env = "WEBHOOK_CALLBACK_URL",
           help = "Public URL the metagraph should deliver webhooks to")]
    callback_url: Option<String>,
    #[clap(long, env = "WEBHOOK_SECRET",
           help = "Shared secret inbound deliveries must be signed with")]
    webhook_secret: Option<String>,
    #[clap(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = IndexerOpts::parse();
    init_observability(opts.metrics_addr)?;

    let store = Store::open(&opts.db_path)
        .with_context(|| format!("opening store at {}", opts.db_path.display()))?;
    let (rejections_tx, _) = broadcast::channel(256);

    // A snapshot-layer client powers both the idempotent webhook
    // re-subscription and the post-confirmation checkpoint sync.
    let client = opts.ml0_url.as_ref().and_then(|ml0_url| {
        let endpoints = Endpoints {
            ml0_url: ml0_url.clone(),
            dl1_urls: if opts.dl1_url.is_empty() {
                vec![ml0_url.clone()]
            } else {
                opts.dl1_url.clone()
            },
            ..Default::default()
        };
        match HttpDataLayer::new(&endpoints) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!(target: "indexer", error = %e, "snapshot-layer client unavailable");
                None
            }
        }
    });

    if let (Some(client), Some(callback_url)) = (&client, &opts.callback_url) {
        ensure_subscription(client, callback_url, opts.webhook_secret.as_deref()).await;
    }

    let checkpoint_source: Option<Arc<dyn DataLayerApi>> = match client {
        Some(client) => Some(client),
        None => None,
    };
    let state = Arc::new(IndexerState {
        store,
        rejections_tx,
        webhook_secret: opts.webhook_secret.clone(),
        checkpoint_source,
    });

    let shutdown = shutdown_channel();
    run_server(opts.listen_addr, state, shutdown).await
}
