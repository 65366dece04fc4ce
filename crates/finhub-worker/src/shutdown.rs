//! Graceful shutdown on SIGINT / SIGTERM

use std::future::Future;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Resolves when Ctrl+C or SIGTERM arrives, naming the signal.
///
/// A handler that fails to install is logged and never fires, so a broken
/// handler cannot stop the worker by itself.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                if signal.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// Cancel `token` once `signal` resolves.
pub fn cancel_on<F>(signal: F, token: CancellationToken) -> JoinHandle<()>
where
    F: Future<Output = &'static str> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            name = signal => {
                info!(signal = name, "Received shutdown signal, draining in-flight deliveries");
                token.cancel();
            },
            _ = token.cancelled() => {},
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_cancels_token() {
        let token = CancellationToken::new();
        let handle = cancel_on(async { "SIGTERM" }, token.clone());

        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_signal_keeps_running() {
        let token = CancellationToken::new();
        let handle = cancel_on(std::future::pending(), token.clone());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!token.is_cancelled());
        assert!(!handle.is_finished());

        // Cancelling elsewhere releases the listener.
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_signal_waits_for_a_signal() {
        let waited = tokio::time::timeout(Duration::from_millis(50), shutdown_signal()).await;
        assert!(waited.is_err());
    }
}
