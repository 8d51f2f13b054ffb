//! Periodic quota status reporting
//!
//! Spawns a background task that publishes each credential's quota state as
//! gauges and logs a summary. The task only reads counters; it never admits
//! or adjusts anything, so it runs independently of the request path.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::coordinator::AccessCoordinator;

/// Spawn a background task that reports scheduler status every `interval`.
///
/// Returns a `JoinHandle` for the spawned task; abort it to stop reporting.
pub fn spawn_status_reporter<T>(
    coordinator: Arc<AccessCoordinator<T>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()>
where
    T: Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, the scheduler was just built
        ticker.tick().await;

        loop {
            ticker.tick().await;
            report_cycle(&coordinator);
        }
    })
}

/// Publish one round of gauges.
fn report_cycle<T>(coordinator: &AccessCoordinator<T>) {
    let status = coordinator.status();
    for credential in &status.credentials {
        metrics::gauge!("access_pool_available_units", "credential" => credential.id.clone())
            .set(credential.available);
        metrics::gauge!("access_pool_refill_rate", "credential" => credential.id.clone())
            .set(credential.refill_rate);
    }
    debug!(
        status = status.status,
        available = status.credentials_available,
        total = status.credentials_total,
        "quota status"
    );
}
