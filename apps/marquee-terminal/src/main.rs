use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};

use marquee_terminal::{
    config::Config,
    conn::{ClientConfig, ConnectionClient},
    fetch::HttpSyncSource,
    prefetch::ContentPrefetcher,
    retry::RetryPolicy,
    store::LocalStore,
    sync::SyncOrchestrator,
};

#[derive(Parser, Debug)]
#[command(name = "marquee-terminal")]
#[command(about = "Marquee display terminal")]
struct Cli {
    /// Control plane base URL (overrides MARQUEE_API_BASE)
    #[arg(long)]
    api_base: Option<String>,

    /// Display this terminal belongs to (overrides MARQUEE_DISPLAY_ID)
    #[arg(long)]
    display: Option<String>,

    /// Directory for the local cache (overrides MARQUEE_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seconds between pull-sync cycles
    #[arg(long)]
    sync_interval: Option<u64>,

    /// Run one sync cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(api_base) = cli.api_base {
        config.api_base = api_base;
    }
    if let Some(display) = cli.display {
        config.display_id = display;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(seconds) = cli.sync_interval {
        config.sync_interval = Duration::from_secs(seconds);
    }

    info!(display = %config.display_id, api = %config.api_base, "starting marquee terminal");

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(LocalStore::open(config.data_dir.join("cache.redb"))?);
    match store.metadata() {
        Some(meta) => {
            info!(last_updated = %meta.last_updated, "local cache present; rendering last known state");
        }
        None => info!("local cache empty; waiting for first sync"),
    }
    for state in store.states() {
        debug!(screen = %state.screen_id, src = ?state.src, "cached screen state");
    }

    let (client, mut snapshots) = ConnectionClient::new(ClientConfig::new(config.push_url()?));
    tokio::spawn(client.clone().run());

    let source = Arc::new(HttpSyncSource::new(config.api_base_url()?)?);
    let orchestrator = Arc::new(SyncOrchestrator::new(store.clone(), RetryPolicy::default()));
    let prefetcher = Arc::new(ContentPrefetcher::new(
        config.api_base_url()?,
        config.data_dir.join("content"),
        client.state(),
    )?);

    let mut status_rx = orchestrator.status();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow().clone();
            debug!(
                is_syncing = status.is_syncing,
                last_error = status.last_error.as_deref().unwrap_or("none"),
                "sync status"
            );
        }
    });

    if cli.once {
        let status = orchestrator.sync(&config.display_id, source.as_ref()).await;
        prefetcher.warm(&store.states()).await;
        client.stop();
        info!(
            last_error = status.last_error.as_deref().unwrap_or("none"),
            "sync cycle finished"
        );
        return Ok(());
    }

    // resilience path: periodic pull sync plus content warm
    {
        let orchestrator = orchestrator.clone();
        let store = store.clone();
        let prefetcher = prefetcher.clone();
        let source = source.clone();
        let display_id = config.display_id.clone();
        let interval = config.sync_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                orchestrator.sync(&display_id, source.as_ref()).await;
                prefetcher.warm(&store.states()).await;
            }
        });
    }

    // primary path: render whatever the push channel delivers
    loop {
        tokio::select! {
            snapshot = snapshots.recv() => {
                let Some(snapshot) = snapshot else { break };
                info!(screens = snapshot.len(), "applying pushed state snapshot");
                for (screen_id, entry) in &snapshot {
                    debug!(screen = %screen_id, src = ?entry.src, "rendering screen");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                client.stop();
                break;
            }
        }
    }
    Ok(())
}
