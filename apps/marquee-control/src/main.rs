use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use marquee_control::{
    broadcast::{Broadcaster, PROBE_INTERVAL},
    cli::{Cli, Commands},
    config::Config,
    handlers::{app_router, AppState, SharedStore},
    store::{MemoryStateStore, RedisStateStore},
};

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Some(Commands::SetImage { url, screen, src, scenario }) = cli.command {
        if let Err(err) = marquee_control::cli::run_set_image(url, screen, src, scenario).await {
            error!("set-image failed: {}", err);
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("starting marquee control plane on port {}", config.port);

    let store: SharedStore = if cli.memory {
        info!("using in-process state store");
        Arc::new(MemoryStateStore::default())
    } else {
        info!("Redis URL: {}", config.redis_url);
        match RedisStateStore::new(&config.redis_url).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                error!("failed to connect to Redis: {}", err);
                std::process::exit(1);
            }
        }
    };

    let broadcaster = Arc::new(Broadcaster::new(store.clone()));
    let prober = broadcaster.clone().start_prober(PROBE_INTERVAL);

    let app = app_router(AppState {
        store,
        broadcaster,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    info!("marquee control listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("failed to start server");

    prober.stop();
}
