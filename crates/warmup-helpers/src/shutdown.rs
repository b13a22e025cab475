use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancels `token` on SIGTERM/SIGINT (ctrl-c on non-unix targets).
pub async fn listen_shutdown(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        let (mut sigterm, mut sigint) = match (sigterm, sigint) {
            (Ok(term), Ok(int)) => (term, int),
            (term, int) => {
                if let Err(err) = &term {
                    warn!("failed to install SIGTERM handler: error={err}");
                }
                if let Err(err) = &int {
                    warn!("failed to install SIGINT handler: error={err}");
                }
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("shutdown signal received: SIGINT");
                    token.cancel();
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => warn!("shutdown signal received: SIGTERM"),
            _ = sigint.recv() => warn!("shutdown signal received: SIGINT"),
        }

        token.cancel();
        return;
    }

    #[cfg(not(unix))]
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("shutdown signal received: SIGINT");
        token.cancel();
    }
}
