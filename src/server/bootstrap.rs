use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::server;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → snapshot config → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = GatewayConfig::from_env();
    config.validate();

    let metrics = Metrics::install();
    let state = server::GatewayState::new(config, metrics);

    tracing::info!(
        routes = state.routes.len(),
        preset_auth = state.config.preset_auth_enabled,
        gemini_handler = state.config.gemini_special_handling,
        "server: starting gateway, listen={}",
        args.listen
    );

    let shutdown = Arc::new(Notify::new());

    // Admin server runs for the process lifetime; failures there should not
    // take the data plane down.
    tokio::spawn({
        let admin_listen = args.admin_listen.clone();
        let state = state.clone();
        async move {
            if let Err(e) = server::run_admin_server(&admin_listen, state).await {
                tracing::error!("server: admin server failed: {}", e);
            }
        }
    });

    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Block until SIGINT/SIGTERM, then notify the accept loops.
async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("server: received SIGINT"),
            _ = sigterm.recv() => tracing::info!("server: received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("server: received ctrl-c");
    }
    shutdown.notify_waiters();
}
