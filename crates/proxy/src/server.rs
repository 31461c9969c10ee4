use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Serves `app` until `cancel` fires, then drains in-flight requests for at
/// most `grace` before aborting the server task.
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken, grace: Duration) -> Result<()> {
    let addr = listener.local_addr().context("reading listener address")?;
    info!(%addr, "proxy listening");
    let shutdown = cancel.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move { shutdown.cancelled().await });
    let mut task = tokio::spawn(async move { server.await });

    tokio::select! {
        joined = &mut task => {
            joined.context("proxy server task")?.context("proxy server")?;
            return Ok(());
        }
        _ = cancel.cancelled() => {}
    }

    info!(grace_secs = grace.as_secs(), "draining in-flight requests");
    match tokio::time::timeout(grace, &mut task).await {
        Ok(joined) => joined.context("proxy server task")?.context("proxy server")?,
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "requests still in flight after grace period; aborting");
            task.abort();
        }
    }
    Ok(())
}
