//! Periodic dialer status: a one-line summary at info, the full snapshot
//! as JSON at debug.

use std::sync::Arc;
use std::time::Duration;

use kith_dialer::Dialer;

const INTERVAL: Duration = Duration::from_secs(30);

pub async fn snapshot_loop(dialer: Arc<Dialer>) {
    let mut interval = tokio::time::interval(INTERVAL);
    loop {
        interval.tick().await;
        let snap = dialer.snapshot();
        let online = snap
            .telephones
            .iter()
            .filter(|t| t.presence.maybe_online)
            .count();
        tracing::info!(
            friends = snap.telephones.len(),
            online,
            fd_in_use = snap.fd_in_use,
            fd_limit = snap.fd_limit,
            "dialer snapshot"
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            match serde_json::to_string(&snap) {
                Ok(json) => tracing::debug!(snapshot = %json, "dialer state"),
                Err(e) => tracing::warn!(error = %e, "failed to serialise snapshot"),
            }
        }
    }
}
