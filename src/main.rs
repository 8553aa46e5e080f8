mod api;
mod backend;
mod bus;
mod config;
mod delta;
mod error;
mod history;
mod poller;
mod state;
mod sync;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::SyncLatency;
use crate::api::routes::{router, ApiState};
use crate::backend::{BackendClient, MarketQuery};
use crate::bus::listener::BusListener;
use crate::bus::ChangeBus;
use crate::config::{Config, CHANNEL_CAPACITY, REALTIME_TABLES};
use crate::error::Result;
use crate::poller::PollScheduler;
use crate::state::ViewState;
use crate::sync::{FetchRunner, SyncCoordinator};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let backend = Arc::new(BackendClient::new(&cfg.backend_api_url)?);
    let bus = ChangeBus::new();
    let view = ViewState::new();
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(SyncLatency::new());

    let query = MarketQuery {
        source: cfg.source_filter.clone(),
        category: cfg.category_filter.clone(),
        limit: None,
    };

    // --- Channels ---
    let (trigger_tx, trigger_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outcome_tx, outcome_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- Spawn tasks ---

    // Change-notification listener feeding the bus
    let listener = BusListener::new(
        cfg.realtime_ws_url.clone(),
        REALTIME_TABLES.iter().map(|t| t.to_string()).collect(),
        Arc::clone(&bus),
        Arc::clone(&health),
        shutdown_rx.clone(),
    );
    tokio::spawn(async move { listener.run().await });

    // Fetch runner executing the coordinator's read commands
    let runner = FetchRunner::new(
        Arc::clone(&backend),
        query,
        cmd_rx,
        outcome_tx,
        Arc::clone(&latency),
    );
    tokio::spawn(async move { runner.run().await });

    // Sync coordinator — the reconciliation engine
    let coordinator = SyncCoordinator::new(
        Arc::clone(&view),
        Arc::clone(&bus),
        Arc::clone(&health),
        trigger_tx.clone(),
        trigger_rx,
        cmd_tx,
        outcome_rx,
        shutdown_rx.clone(),
    );
    tokio::spawn(async move { coordinator.run().await });

    // Poll scheduler — the reliability backstop (immediate first tick)
    let poller = PollScheduler::new(
        Arc::clone(&backend),
        trigger_tx.clone(),
        cfg.poll_interval_secs,
        shutdown_rx.clone(),
    );
    tokio::spawn(async move { poller.run().await });

    // --- HTTP API server ---
    let proxy_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()?;
    let api_state = ApiState {
        view: Arc::clone(&view),
        health: Arc::clone(&health),
        latency: Arc::clone(&latency),
        trigger_tx,
        proxy_client,
        proxy_allowed_hosts: Arc::new(cfg.proxy_allowed_hosts.clone()),
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let tcp_listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(tcp_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the poll timer and release bus subscriptions; fetches already in
    // flight finish on their own and their results are discarded.
    let _ = shutdown_tx.send(true);
    info!("shutdown signalled, teardown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
}
