//! Process signal handling.
//!
//! The accept loop is synchronous, so signals are awaited on a dedicated
//! thread running a small current-thread tokio runtime. The first SIGINT or
//! SIGTERM requests a cooperative stop; the server exits after finishing the
//! connection it is serving, at most one accept timeout later.

use crate::server::StopHandle;
use std::io;
use std::thread;
use tokio::signal;
use tracing::{info, warn};

/// Spawn the watcher thread. It exits after the first shutdown signal.
pub fn spawn_watcher(handle: StopHandle) -> io::Result<thread::JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if let Err(e) = wait_for_shutdown().await {
                    warn!(error = %e, "Failed to listen for shutdown signals");
                    return;
                }
                handle.stop();
            });
        })
}

async fn wait_for_shutdown() -> io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, stopping after the current connection");
            }
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, stopping after the current connection");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, stopping after the current connection");
    }

    Ok(())
}
