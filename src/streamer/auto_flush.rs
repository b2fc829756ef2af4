use super::StreamerInner;
use std::sync::Weak;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Calls `try_flush` whenever `auto_flush_frequency` has passed since the
/// last flush. Exits when the frequency drops to zero, the token fires, or
/// the streamer is gone.
pub(super) fn spawn_auto_flusher(
    inner: Weak<StreamerInner>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let deadline = {
                let Some(streamer) = inner.upgrade() else {
                    break;
                };
                let Some(deadline) = streamer.next_flush_time() else {
                    break;
                };
                deadline
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let Some(streamer) = inner.upgrade() else {
                break;
            };
            // A manual flush may have pushed the deadline out while we slept
            match streamer.next_flush_time() {
                Some(next) if next <= Instant::now() => streamer.try_flush().await,
                Some(_) => {}
                None => break,
            }
        }
        debug!("Streamer auto-flush task stopped");
    })
}
