use antigravity_claude_proxy::constants::SHUTDOWN_DRAIN_SECS;
use antigravity_claude_proxy::models::AppConfig;
use antigravity_claude_proxy::proxy::{server, AccountPool, AppState, TokenStore, UpstreamClient};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env();

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "starting antigravity-claude-proxy v{} (fallback: {}, local llm: {})",
        env!("CARGO_PKG_VERSION"),
        config.fallback_enabled,
        config.local_llm_url
    );

    let pool = match AccountPool::load(config.data_dir.clone()).await {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            error!("failed to load account store: {}", e);
            std::process::exit(1);
        }
    };
    if pool.is_empty().await {
        warn!("no accounts loaded; pool-backed models will fail until the store is populated");
    }

    let token_store = Arc::new(TokenStore::new(config.data_dir.clone()));
    let upstream = Arc::new(UpstreamClient::new());
    let cancel = CancellationToken::new();

    let scheduler = token_store
        .clone()
        .spawn_refresh_scheduler(Arc::clone(&pool), cancel.clone());
    let janitor = server::spawn_rate_limit_janitor(Arc::clone(&pool), cancel.clone());

    let port = config.port;
    let state = AppState::new(pool, token_store, upstream, config, cancel.clone());

    let server_cancel = cancel.clone();
    let mut server_handle =
        tokio::spawn(async move { server::serve(state, port, server_cancel).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = &mut server_handle => {
            cancel.cancel();
            match result {
                Ok(Ok(())) => {
                    info!("listener stopped");
                    return;
                }
                Ok(Err(e)) => {
                    // Typically a bind failure.
                    error!("{}", e);
                    std::process::exit(1);
                }
                Err(e) => {
                    error!("server task panicked: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    // Stop background work, then drain in-flight requests with a bounded
    // deadline.
    cancel.cancel();
    let _ = scheduler.await;
    let _ = janitor.await;
    match tokio::time::timeout(
        std::time::Duration::from_secs(SHUTDOWN_DRAIN_SECS),
        &mut server_handle,
    )
    .await
    {
        Ok(_) => info!("shutdown complete"),
        Err(_) => {
            warn!("drain deadline reached, aborting remaining connections");
            server_handle.abort();
        }
    }
}
