//! acegate — streaming gateway entry point.

use acegate::api::{self, AppState};
use acegate::config::ProxyConfig;
use acegate::logging::init_logging;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = ProxyConfig::from_env();
    let _guard = init_logging(&config.debug)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    info!("starting acegate v{}", env!("CARGO_PKG_VERSION"));
    match &config.orchestrator_url {
        Some(url) => info!(orchestrator = %url, "orchestrator mode"),
        None => info!(
            upstream = %format!(
                "{}://{}:{}",
                config.upstream.scheme, config.upstream.host, config.upstream.port
            ),
            "standalone mode (no orchestrator)"
        ),
    }

    let shutdown = CancellationToken::new();
    let state = AppState::build(config.clone(), shutdown.clone())?;
    state.spawn_background();

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %listener.local_addr()?, "listening");

    let signal_token = shutdown.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            signal_token.cancel();
        })
        .await?;

    info!("acegate shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = wait_for_sigterm() => {}
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
