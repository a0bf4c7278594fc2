//! Application runner
//!
//! Wraps the replicator with signal handling so the binary (or an
//! embedding application) gets a complete start/run/stop lifecycle in a
//! single call.

use crate::config::Config;
use crate::error::{exit_codes, ExitError};
use crate::replicator::{Replicator, SystemConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run the streamer until a shutdown signal arrives.
///
/// Returns the process exit code to report.
pub async fn run_streamer_app(system_config: SystemConfig) -> i32 {
    let replicator = Replicator::new(system_config);

    if let Err(err) = replicator.start_replication().await {
        tracing::error!("Startup failed: {}", err);
        // Best-effort teardown of whatever already started.
        let _ = replicator.stop_replication().await;
        return err.code;
    }

    let shutdown = CancellationToken::new();
    let signal_handler = tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));
    shutdown.cancelled().await;
    signal_handler.abort();

    match replicator.stop_replication().await {
        Ok(()) => exit_codes::CLEAN,
        Err(ExitError { source, code }) => {
            tracing::error!("Shutdown finished with errors: {}", source);
            code
        }
    }
}

/// Convenience entry point from a plain [`Config`]
pub async fn run_streamer_app_with_config(config: Config) -> i32 {
    run_streamer_app(SystemConfig::new(config)).await
}

/// Resolve when SIGTERM/SIGINT (or Ctrl+C on Windows) arrives
async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
        }
        shutdown.cancel();
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.expect("Failed to listen for ctrl-c");
        info!("Received Ctrl+C, initiating graceful shutdown");
        shutdown.cancel();
    }
}
