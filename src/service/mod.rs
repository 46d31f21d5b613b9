pub mod auth;
pub mod blob;
pub mod manifest;
pub mod repo;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Floor applied when a proxied fetch carries no usable size hint, so the
/// deadline never collapses to zero for an unknown-size transfer.
const MIN_FETCH_DEADLINE: Duration = Duration::from_secs(30);

/// Spec §5's per-remote-fetch deadline: twice the expected transfer size at
/// `proxy.min-throughput-bytes-per-sec`, floored at `MIN_FETCH_DEADLINE`.
pub(crate) fn fetch_deadline(size_hint: Option<u64>, min_throughput_bps: u64) -> Duration {
    match size_hint {
        Some(size) if size > 0 && min_throughput_bps > 0 => {
            let seconds = (2 * size).div_ceil(min_throughput_bps);
            Duration::from_secs(seconds).max(MIN_FETCH_DEADLINE)
        }
        _ => MIN_FETCH_DEADLINE,
    }
}

/// Cancels `cancel` once `deadline` elapses, unblocking whatever
/// `core::proxy` read is currently selecting on it. Aborts its own timer
/// task on drop, so a fetch that finishes (or is itself dropped on client
/// disconnect) before the deadline leaves nothing running behind it.
pub(crate) struct DeadlineGuard(tokio::task::JoinHandle<()>);

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) fn arm_fetch_deadline(cancel: CancellationToken, deadline: Duration) -> DeadlineGuard {
    DeadlineGuard(tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        cancel.cancel();
    }))
}
