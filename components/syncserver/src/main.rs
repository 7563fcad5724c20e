/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Sync 1.5 storage server binary.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use syncserver::{create_router, AppState, Settings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sync 1.5 storage service backed by per-user SQLite stores.
#[derive(Parser, Debug)]
#[command(name = "syncserver")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "SYNC_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let hostname = settings
        .hostname
        .clone()
        .unwrap_or_else(|| "localhost".to_string());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %hostname,
        data_dir = %settings.data_dir.display(),
        pool_num = settings.pool.num,
        pool_max_size = settings.pool.max_size,
        max_bso_get_limit = settings.limit.max_bso_get_limit,
        max_post_records = settings.limit.max_post_records,
        max_post_bytes = settings.limit.max_post_bytes,
        max_total_records = settings.limit.max_total_records,
        max_total_bytes = settings.limit.max_total_bytes,
        max_request_bytes = settings.limit.max_request_bytes,
        max_batch_ttl_secs = settings.limit.max_batch_ttl_secs,
        "starting syncserver"
    );

    std::fs::create_dir_all(&settings.data_dir).with_context(|| {
        format!(
            "could not create data directory {}",
            settings.data_dir.display()
        )
    })?;

    let stop_timeout = Duration::from_secs(settings.pool.stop_timeout_secs);
    let kill_timeout = Duration::from_secs(settings.pool.kill_timeout_secs);
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .context("invalid bind address")?;

    let state = AppState::new(settings.clone());

    // The reaper closes stores that sit idle past their ttl.
    let pool = state.dispatch.pool().clone();
    let reap_every = Duration::from_secs(settings.pool.ttl_idle_secs.max(2) / 2);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            pool.reap().await;
        }
    });

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the pool: stop taking work, let in-flight operations finish,
    // close every store. The watchdog aborts the process if even the
    // forced path wedges.
    tracing::info!("draining storage pool");
    tokio::spawn(async move {
        tokio::time::sleep(stop_timeout + kill_timeout).await;
        tracing::error!("kill timeout exceeded, aborting");
        std::process::exit(2);
    });
    match tokio::time::timeout(stop_timeout, state.dispatch.stop()).await {
        Ok(()) => tracing::info!("shutdown complete"),
        Err(_) => {
            tracing::error!("stop timeout exceeded while draining");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
