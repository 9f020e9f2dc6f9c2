//! Shutdown on SIGINT or SIGTERM.

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::{ShutdownHandle, TilehostError};

/// Installs the handlers now and triggers `handle` on the first signal.
///
/// # Errors
/// [`TilehostError::Startup`] if the handlers cannot be installed.
pub fn spawn_shutdown_on_signal(handle: ShutdownHandle) -> Result<(), TilehostError> {
    let install = |kind| signal(kind).map_err(|e| TilehostError::Startup(format!("signal handler: {e}")));
    let mut sigint = install(SignalKind::interrupt())?;
    let mut sigterm = install(SignalKind::terminate())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        info!(signal = name, "received shutdown signal");
        handle.trigger();
    });
    Ok(())
}
