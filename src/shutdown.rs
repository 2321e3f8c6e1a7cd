//! Shutdown broadcast shared by the server, its connections and the exporter

use tokio::sync::watch;

/// Resolve once the flag is set or every sender is gone
pub async fn signalled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
