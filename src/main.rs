//! CrowdSec Traefik Bouncer CLI.

use anyhow::Result;
use clap::Parser;
use crowdsec_traefik_bouncer::metrics::Metrics;
use crowdsec_traefik_bouncer::server::{create_router, AppState};
use crowdsec_traefik_bouncer::{
    Bouncer, BouncerDeps, Config, DecisionCache, LapiClient, Mode, StreamSynchronizer, SyncState,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crowdsec-traefik-bouncer")]
#[command(about = "Forward-auth bouncer - blocks client IPs banned by a CrowdSec decision source")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "bouncer.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let settings = &config.bouncer;
    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(DecisionCache::new(
        config.cache.max_entries,
        config.cache.max_memory_bytes,
        config.cache.shards,
    ));
    let source = Arc::new(LapiClient::new(&config.source)?);
    let sync_state = Arc::new(SyncState::new());

    let bouncer = Arc::new(Bouncer::new(BouncerDeps {
        mode: settings.mode,
        cache: cache.clone(),
        source: source.clone(),
        sync_state: sync_state.clone(),
        default_allow_ttl: settings.default_allow_ttl(),
        ban_fallback_ttl: settings.ban_fallback_ttl(),
        metrics: metrics.clone(),
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let sync_task = if settings.mode == Mode::Stream {
        let synchronizer = Arc::new(
            StreamSynchronizer::new(
                source,
                cache,
                sync_state,
                settings.stream_interval(),
                settings.ban_fallback_ttl(),
            )
            .with_metrics(metrics),
        );
        Some(synchronizer.spawn(shutdown_rx)?)
    } else {
        None
    };

    let state = AppState::new(bouncer, &config.response, config.ip_extraction.clone());
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.server.listen).await?;
    info!(
        listen = %config.server.listen,
        mode = %settings.mode,
        source = %format!("{}://{}", config.source.scheme, config.source.host),
        "Bouncer listening"
    );

    // Dropping the sender also stops the synchronizer if the server exits early
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    if let Err(e) = server.await {
        error!(error = %e, "HTTP server error");
    }

    if let Some(task) = sync_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Stream synchronizer task failed");
        }
    }

    info!("Bouncer shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => { info!("Received SIGINT"); }
                _ = sigterm.recv() => { info!("Received SIGTERM"); }
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler, using SIGINT only");
            let _ = ctrl_c.await;
            info!("Received SIGINT");
        }
    }
}
