//! Server binary: resolve configuration, open the store, reconcile stale
//! executions, and serve the control plane until ctrl-c.

use std::sync::Arc;

use miette::{IntoDiagnostic, WrapErr};
use tracing_subscriber::EnvFilter;

use flowprobe::api::{AppState, router};
use flowprobe::config::AppConfig;
use flowprobe::events::EventBus;
use flowprobe::replayer::{ReplaySettings, Replayer};
use flowprobe::store::{SharedStore, Store};

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();
    let store = open_store(&config).await?;

    // Executions left `running` by a previous process cannot make
    // progress; mark them failed before accepting traffic.
    let reconciled = store
        .reconcile_stale_executions()
        .await
        .into_diagnostic()
        .wrap_err("boot reconciliation failed")?;
    if reconciled > 0 {
        tracing::warn!(reconciled, "stale running executions marked failed");
    }

    let bus = EventBus::default();
    bus.listen();
    let replayer = Replayer::new(
        Arc::clone(&store),
        ReplaySettings::from(&config),
        bus.emitter(),
    );

    let listen_addr = config.listen_addr.clone();
    let app = router(AppState::new(store, config, replayer.clone()));
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("cannot bind {listen_addr}"))?;
    tracing::info!(%listen_addr, "flowprobe listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .into_diagnostic()
        .wrap_err("server error")?;

    // Cancel whatever is still replaying; workers observe the flag at
    // request boundaries and drain before the executions go terminal.
    let running = replayer.running_executions();
    for execution_id in &running {
        replayer.cancel(*execution_id);
    }
    if !running.is_empty() {
        tracing::info!(count = running.len(), "cancelled in-flight executions");
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "ctrl-c handler failed");
    }
    tracing::info!("shutdown signal received");
}

async fn open_store(config: &AppConfig) -> miette::Result<SharedStore> {
    let url = config.database_url.as_str();
    #[cfg(feature = "sqlite")]
    if url.starts_with("sqlite:") {
        let store = flowprobe::store::SqliteStore::connect(url)
            .await
            .into_diagnostic()
            .wrap_err("sqlite store initialization failed")?;
        return Ok(Arc::new(store) as SharedStore);
    }
    #[cfg(feature = "postgres")]
    if url.starts_with("postgres:") || url.starts_with("postgresql:") {
        let store = flowprobe::store::PostgresStore::connect(url)
            .await
            .into_diagnostic()
            .wrap_err("postgres store initialization failed")?;
        return Ok(Arc::new(store) as SharedStore);
    }
    tracing::warn!(
        database_url = %url,
        "no matching database driver built in; falling back to the in-memory store"
    );
    Ok(Arc::new(flowprobe::store::InMemoryStore::new()) as SharedStore)
}
