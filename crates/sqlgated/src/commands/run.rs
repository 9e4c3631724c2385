use std::path::Path;

use anyhow::Context;
use sqlgate_core::ProxyConfig;
use tokio::sync::watch;
use tracing::info;

/// Load `config_path`, serve until Ctrl-C / SIGTERM, then drain.
pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = ProxyConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        addr = %config.server.addr,
        admin = %config.mysql.admin.addr,
        readonly = %config.mysql.readonly.addr,
        "sqlgate daemon starting"
    );

    let server = sqlgate_proxy::mysql_proxy(config).context("invalid proxy configuration")?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
        // Keep the sender alive so the server sees `true`, not a closed channel.
        std::future::pending::<()>().await;
    });

    server.run(shutdown_rx).await.context("proxy server failed")?;

    info!("sqlgate daemon stopped");
    Ok(())
}

/// Resolves on Ctrl-C. If the handler cannot be installed this never
/// resolves, so a setup failure is not mistaken for a stop request.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler; only Ctrl-C will stop the daemon");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}
