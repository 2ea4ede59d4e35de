//! Background expiry sweep.
//!
//! Checkouts are already expired lazily whenever an actor's checkouts are
//! read. The sweep additionally expires overdue checkouts of idle actors so
//! their quota reservations and audit records do not wait for the next
//! request.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use agentkey_core::broker::Broker;

/// Longest wait between attempts after repeated failures.
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Delay before the next sweep given the number of consecutive failures.
fn next_delay(interval: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return interval;
    }
    let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
    interval.saturating_mul(factor).min(MAX_BACKOFF.max(interval))
}

/// Run the sweep every `interval` until `shutdown` flips to `true`.
pub async fn run(broker: Broker, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(interval_secs = interval.as_secs(), "expiry sweep started");
    let mut failures: u32 = 0;

    loop {
        let delay = next_delay(interval, failures);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                info!("expiry sweep shutting down");
                return;
            }
        }

        match broker.sweep_expired().await {
            Ok(0) => {
                debug!("expiry sweep found nothing overdue");
                failures = 0;
            }
            Ok(count) => {
                info!(count, "expiry sweep expired checkouts");
                failures = 0;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!(
                    error = %e,
                    failures,
                    retry_in_secs = next_delay(interval, failures).as_secs(),
                    "expiry sweep failed"
                );
            }
        }
    }
}
