use tokio::signal::unix::{signal, SignalKind};

/// Completes when SIGTERM or SIGINT is received.
///
/// The caller races this against the accept loop and begins a graceful stop
/// when it resolves. Handler installation failure is fatal: a server that
/// cannot be stopped cleanly should not start.
pub async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
}
