//! Sandbox orchestrator daemon: registers the available backends and runs the
//! reconcile and cleanup loops until interrupted.

use blueprint_sdk::{error, info, warn};
use sandbox_orchestrator::container::DockerEngine;
use sandbox_orchestrator::microvm::network::IpNetwork;
use sandbox_orchestrator::microvm::supervisor::FirecrackerSupervisor;
use sandbox_orchestrator::{
    CleanupService, ContainerManager, ContainerSettings, LocalRecordStore, MicroVmManager,
    MicroVmSettings, OrchestratorConfig, Provider, ProviderRegistry, Reconciler, Result,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    setup_log();

    let config = OrchestratorConfig::load();
    let providers = ProviderRegistry::new();

    let engine = DockerEngine::connect(config.docker_host.as_deref()).await?;
    let containers = Arc::new(ContainerManager::new(
        Arc::new(engine),
        ContainerSettings::from_config(config),
    ));
    containers.ping().await?;
    match containers.rehydrate().await {
        Ok(count) => info!("Tracking {count} existing containers"),
        Err(e) => warn!("Failed to rehydrate containers: {e}"),
    }
    providers.register(containers.clone());

    let vms = Arc::new(MicroVmManager::new(
        Arc::new(FirecrackerSupervisor::new(
            &config.firecracker_binary,
            &config.firecracker_kernel,
        )),
        Arc::new(IpNetwork::new(&config.firecracker_bridge)),
        MicroVmSettings::from_config(config),
    ));
    if vms.is_available().await {
        if let Err(e) = std::fs::create_dir_all(&config.firecracker_socket_dir) {
            warn!(
                "Failed to create {}: {e}",
                config.firecracker_socket_dir.display()
            );
        }
        match vms.rehydrate().await {
            Ok(count) => info!("Tracking {count} existing microVMs"),
            Err(e) => warn!("Failed to rehydrate microVMs: {e}"),
        }
        providers.register(vms.clone());
        info!(
            "Firecracker provider enabled ({} rootfs images)",
            vms.rootfs().available().len()
        );
    } else {
        info!("Firecracker is not available on this host, microVM provider disabled");
    }
    info!("Registered providers: {}", providers.names().join(", "));

    let store = LocalRecordStore::open_default()?;
    let mut reconciler =
        Reconciler::new(Arc::new(store), config.reconciler).with_target(containers.clone());
    let mut cleanup = CleanupService::new(config.cleanup).with_target(containers.clone());
    if providers.get(sandbox_orchestrator::microvm::PROVIDER_NAME).is_ok() {
        reconciler = reconciler.with_target(vms.clone());
        cleanup = cleanup.with_target(vms.clone());
    }

    let reconciler = Arc::new(reconciler).spawn();
    let cleanup = Arc::new(cleanup).spawn();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutting down sandbox orchestrator");
    reconciler.shutdown().await;
    if let Some(cleanup) = cleanup {
        cleanup.shutdown().await;
    }
    Ok(())
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
