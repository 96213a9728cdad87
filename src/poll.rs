//! Cancellable periodic polling loop shared by the manager, scheduler and
//! trigger sync.

use std::future::Future;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

/// Run `f` immediately and then every `period` (sliding: the next sleep
/// starts after `f` returns) until `token` is cancelled.
///
/// `jitter_factor` in `0.0..=1.0` stretches each sleep by a random fraction
/// of the period so co-scheduled loops drift apart.
pub async fn poll_until<F, Fut>(
    period: Duration,
    jitter_factor: f64,
    token: CancellationToken,
    mut f: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if token.is_cancelled() {
            return;
        }
        f().await;
        let sleep = period.mul_f64(1.0 + jitter_factor.clamp(0.0, 1.0) * jitter());
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}

// Cheap uniform-ish value in [0, 1) from the clock's subsecond nanos.
fn jitter() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as f64 / 1_000_000_000.0)
        .unwrap_or(0.0)
}
