use anyhow::Result;
use cloud_api::{create_app, ApiConfig, AppState};
use cloud_config::CloudConfig;
use cloud_orchestrator::{Backends, InstanceManager};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = cloud_logging::init_subscriber();

    info!("Starting cloud-api service...");

    let api_config = ApiConfig::from_env();
    let config = CloudConfig::load_from_env()?;
    info!(
        hypervisor = %config.hypervisor.api_url,
        bind_addr = %api_config.bind_addr,
        "Configuration loaded"
    );

    let backends = Backends::connect(&config)?;
    let manager = InstanceManager::new(config, backends)?;
    let state = AppState::new(manager);
    let app = create_app(state.clone());

    let listener = tokio::net::TcpListener::bind(&api_config.bind_addr).await?;
    info!("Listening on http://{}", api_config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    state.drain_provisioning().await;
    info!("cloud-api stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("could not listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
