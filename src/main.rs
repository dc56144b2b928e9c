//! Machine health operator entry point

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::channel::mpsc;
use kube::{Client, CustomResourceExt};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use machine_health_operator::config::{LogFormat, OperatorConfig};
use machine_health_operator::controller::{
    run_controller, ClusterWatchRegistry, ControllerState, EventRouter, IndexManager,
    RemoteNodeWatcher,
};
use machine_health_operator::crd::MachineHealthCheck;
use machine_health_operator::rest_api;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = OperatorConfig::parse();

    if config.print_crds {
        print!("{}", serde_yaml::to_string(&MachineHealthCheck::crd())?);
        return Ok(());
    }

    init_tracing(config.log_format);
    info!(
        "Starting machine health operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let config = Arc::new(config);

    let (index, streams) = IndexManager::spawn(client.clone(), config.namespace.as_deref())?;
    let index = Arc::new(index);
    let router = Arc::new(EventRouter::new(index.clone()));

    let (trigger_tx, trigger_rx) = mpsc::unbounded();
    let node_watcher = RemoteNodeWatcher::new(
        client.clone(),
        router.clone(),
        trigger_tx,
        config.node_sync_timeout(),
    );
    let watches = Arc::new(ClusterWatchRegistry::new(Arc::new(node_watcher)));

    let state = Arc::new(ControllerState::new(
        client,
        index.clone(),
        watches,
        config.clone(),
    ));

    let ready_state = state.clone();
    tokio::spawn(async move {
        match index.wait_until_ready().await {
            Ok(()) => {
                info!("Index caches synced");
                ready_state.mark_ready();
            }
            Err(e) => error!("Index caches failed to sync: {}", e),
        }
    });

    let server_state = state.clone();
    let http_addr = config.http_addr;
    tokio::spawn(async move {
        if let Err(e) = rest_api::run_server(server_state, http_addr).await {
            error!("HTTP server error: {}", e);
        }
    });

    run_controller(state, router, streams, trigger_rx).await?;

    info!("Machine health operator stopped");
    Ok(())
}
