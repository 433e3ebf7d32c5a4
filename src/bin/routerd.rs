//! routerd - multi-camera frame router daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by ROUTER_CONFIG or --config, then env overrides)
//! 2. Registers the configured experts
//! 3. Serves the WebSocket ingest/query/push surface
//! 4. Shuts down cleanly on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use mentat_router::config::RouterdConfig;
use mentat_router::{Router, RouterServer};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML when the extension is .toml, otherwise JSON).
    #[arg(long, env = "ROUTER_CONFIG")]
    config: Option<PathBuf>,
    /// Override the listen address.
    #[arg(long)]
    listen: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = RouterdConfig::load_from(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    let registry = config.build_registry()?;
    for settings in &config.experts {
        log::info!(
            "expert '{}' ({:?}) every {} ms{}{}",
            settings.name,
            settings.kind,
            settings.interval.as_millis(),
            settings
                .timeout
                .map(|t| format!(", timeout {} ms", t.as_millis()))
                .unwrap_or_default(),
            if settings.enabled { "" } else { ", disabled" }
        );
    }

    let router = Arc::new(Router::new(registry, config.router_settings()));
    let server = RouterServer::new(config.server_config(), router.clone()).spawn()?;
    log::info!("routerd {} running on ws://{}", env!("CARGO_PKG_VERSION"), server.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("routerd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping server...");
    server.stop()?;
    router.shutdown();

    let stats = router.get_stats();
    log::info!(
        "routerd stopped: {} frames received, {} processed, {} failed",
        stats.frames_received,
        stats.total_frames_processed,
        stats.failed_invocations
    );
    Ok(())
}
