use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use life_agent::config;
use life_agent::db;
use life_agent::dispatch::Dispatcher;
use life_agent::push::{LogStaleEndpoint, PruneStaleEndpoint, StaleEndpointHook, WebPushTransport};
use life_agent::realtime::TopicHub;
use life_agent::server::{build_router, AppState};
use life_agent::sweeper::Sweeper;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Delete a user's push subscription when its endpoint is reported gone
    #[arg(long)]
    prune_stale_endpoints: bool,

    /// Print an example config and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let hub = Arc::new(TopicHub::new());
    let transport = Arc::new(WebPushTransport::from_config(&cfg)?);
    let stale_hook: Arc<dyn StaleEndpointHook> = if args.prune_stale_endpoints {
        Arc::new(PruneStaleEndpoint::new(pool.clone()))
    } else {
        Arc::new(LogStaleEndpoint)
    };

    let dispatcher = Dispatcher::new(pool.clone(), hub.clone(), transport, stale_hook);
    let sweeper = Sweeper::new(dispatcher.clone(), cfg.due_soon(), cfg.dedup_window());

    let state = AppState {
        pool,
        dispatcher,
        sweeper,
        hub,
        cron_secret: Arc::from(cfg.sweeper.cron_secret.as_str()),
        vapid_public_key: Arc::from(cfg.push.vapid_public_key.as_str()),
    };

    let addr = cfg.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
