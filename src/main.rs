//! vanfab — management controller for a multi-site VAN fabric.
//!
//! The binary wires configuration, the cluster platform, and the
//! orchestration core, then runs until a shutdown signal arrives. In
//! cluster deployments the platform is the real object watcher; standalone
//! runs (SKX_STANDALONE_NAMESPACE set) use the in-memory platform.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};

use vanfab_cluster::MemoryPlatform;
use vanfab_core::{FabricConfig, VanFabric};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("vanfab=info".parse()?),
        )
        .json()
        .init();

    let config = FabricConfig::from_env();
    info!(
        controller = %config.controller_name,
        namespace = %config.namespace,
        standalone = config.standalone,
        "starting vanfab management controller"
    );

    let platform = Arc::new(MemoryPlatform::new(&config.namespace));

    let mut fabric = match VanFabric::new(config, platform).await {
        Ok(fabric) => fabric,
        Err(e) => {
            // Database unreachable at startup is fatal; the supervisor
            // restarts the process.
            error!("failed to initialize controller: {e}");
            return Err(e);
        }
    };

    if let Err(e) = fabric.start().await {
        error!("failed to start controller: {e}");
        return Err(e);
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("unable to listen for shutdown signal: {e}"),
    }

    fabric.stop().await?;
    info!("vanfab controller stopped");
    Ok(())
}
