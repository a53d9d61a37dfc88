pub mod client;
pub mod server;
pub mod version;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Trip `cancel` on SIGINT or SIGTERM so sessions close gracefully.
pub fn cancel_on_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut term) = signal(SignalKind::terminate()) else {
                let _ = ctrl_c.await;
                info!("received shutdown signal");
                cancel.cancel();
                return;
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        info!("received shutdown signal");
        cancel.cancel();
    });
}
