use anyhow::Result;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use life_agent::config;
use life_agent::db;
use life_agent::dispatch::Dispatcher;
use life_agent::push::{LogStaleEndpoint, PruneStaleEndpoint, StaleEndpointHook, WebPushTransport};
use life_agent::realtime::TopicHub;
use life_agent::sweeper::Sweeper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Target {
    Notifications,
    Tasks,
    All,
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one sweep against the database and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Which sweep to run
    #[arg(long, value_enum, default_value = "all")]
    target: Target,

    /// Delete a user's push subscription when its endpoint is reported gone
    #[arg(long)]
    prune_stale_endpoints: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    // No WebSocket clients are attached to a one-shot process; the hub just drops events.
    let hub = Arc::new(TopicHub::new());
    let transport = Arc::new(WebPushTransport::from_config(&cfg)?);
    let stale_hook: Arc<dyn StaleEndpointHook> = if args.prune_stale_endpoints {
        Arc::new(PruneStaleEndpoint::new(pool.clone()))
    } else {
        Arc::new(LogStaleEndpoint)
    };
    let dispatcher = Dispatcher::new(pool, hub, transport, stale_hook);
    let sweeper = Sweeper::new(dispatcher, cfg.due_soon(), cfg.dedup_window());

    let now = Utc::now();
    if matches!(args.target, Target::Notifications | Target::All) {
        let summary = sweeper.sweep_notifications(now).await?;
        info!(promoted = summary.count, "notification sweep done");
    }
    if matches!(args.target, Target::Tasks | Target::All) {
        let summary = sweeper.sweep_tasks(now).await?;
        info!(
            created = summary.count,
            skipped = summary.skipped,
            failed = summary.failed,
            "task sweep done"
        );
    }
    Ok(())
}
