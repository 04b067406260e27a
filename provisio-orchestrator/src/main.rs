use anyhow::Context;
use provisio_orchestrator::commands::CommandRegistry;
use provisio_orchestrator::provider_manager::ProviderManager;
use provisio_orchestrator::routes::create_router;
use provisio_orchestrator::{AppState, Orchestrator, Settings};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 1. Configuration
    let settings = Arc::new(Settings::from_env().context("loading configuration")?);
    tracing::info!(provider = ?settings.provider, listen = %settings.listen_addr, "starting orchestrator");

    // 2. Backends
    let backend = ProviderManager::backend(&settings)?;
    let bootstrap = ProviderManager::bootstrap(&settings)?;
    if settings.bootstrap_endpoint.is_none() {
        tracing::warn!("BOOTSTRAP_ENDPOINT not set; configuration-management bootstrap requests will fail");
    }

    // 3. Orchestrator + command surface
    let orchestrator = Arc::new(Orchestrator::new(backend, bootstrap, settings.clone()));
    let commands = CommandRegistry::with_defaults()?;
    let state = AppState::new(orchestrator.clone(), commands);
    let app = create_router(state);

    // 4. HTTP server
    let listener = tokio::net::TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("binding {}", settings.listen_addr))?;
    tracing::info!("Orchestrator listening on {}", settings.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    // 5. Drain background post-deploy work
    tracing::info!(running = orchestrator.tasks().running(), "shutting down background tasks");
    orchestrator.tasks().shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
