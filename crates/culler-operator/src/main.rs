//! culler controller entrypoint
//!
//! Bootstrap order: telemetry, kube client, node inventory, state store,
//! leader lease (nothing reconciles until it is held), provider refresh
//! loop, then the deletion scheduler. SIGTERM/SIGINT cancel everything and
//! in-flight calls are allowed to finish.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use culler_common::telemetry::{init_telemetry, TelemetryConfig};
use culler_operator::inventory::ReflectorInventory;
use culler_operator::lease::LeaderLease;
use culler_operator::metrics::Reporter;
use culler_operator::provider::{AwsProvider, CloudProvider};
use culler_operator::scheduler::Culler;
use culler_operator::settings::Settings;
use culler_operator::store::ConfigMapStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    settings.validate().context("validating settings")?;

    init_telemetry(TelemetryConfig::default()).context("initializing telemetry")?;

    info!(node = %settings.node_name, "Starting controller...");

    let settings = Arc::new(settings);
    let stop = CancellationToken::new();

    let client = Client::try_default()
        .await
        .context("creating kube client")?;

    let inventory = Arc::new(
        ReflectorInventory::start(client.clone(), stop.child_token())
            .await
            .context("starting node inventory")?,
    );

    let store = Arc::new(
        ConfigMapStore::new(
            client.clone(),
            &settings.namespace,
            &settings.lock_configmap_name,
        )
        .await
        .context("creating state store")?,
    );

    // Single writer: nothing reconciles until the lease is ours. The
    // identity is unique per process incarnation so a restarted controller
    // on the same node does not confuse itself with its predecessor.
    let lease = Arc::new(LeaderLease::new(
        store.clone(),
        format!("{}_{}", settings.node_name, std::process::id()),
    ));
    lease.acquire().await;
    {
        let lease = Arc::clone(&lease);
        let stop = stop.child_token();
        tokio::spawn(async move { lease.manage(stop).await });
    }

    let provider = Arc::new(
        AwsProvider::new(&settings)
            .await
            .context("creating AWS provider")?,
    );
    {
        let provider = Arc::clone(&provider);
        let stop = stop.child_token();
        tokio::spawn(async move { provider.run(stop).await });
    }

    let culler = Culler::new(
        settings.clone(),
        inventory,
        provider,
        store,
        Arc::new(Reporter::new()),
    );
    let scheduler = tokio::spawn(culler.run(stop.child_token()));

    shutdown_signal().await;
    info!("Received SIGTERM or SIGINT, shutting down");
    stop.cancel();
    let _ = scheduler.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
