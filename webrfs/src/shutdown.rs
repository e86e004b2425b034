//! Signals that end the mount loop.

use anyhow::{Context, Result};
use std::future::Future;
use tokio::signal;

/// Installs the SIGTERM handler right away and returns a future resolving to
/// the name of the first shutdown signal received, Ctrl+C or SIGTERM.
pub fn shutdown_signal() -> Result<impl Future<Output = Result<&'static str>>> {
    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    Ok(async move {
        #[cfg(unix)]
        let terminate = sigterm.recv();

        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            res = signal::ctrl_c() => {
                res.context("Failed to listen for Ctrl+C")?;
                Ok("interrupt")
            }
            _ = terminate => Ok("SIGTERM"),
        }
    })
}
