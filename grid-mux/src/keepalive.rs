//! Periodic keepalive for mux channels.
//!
//! Long idle periods get intermediate SSH hops dropping the session, so
//! each channel gets a background task that emits a no-op frame on a
//! fixed period until it is cancelled or the channel shuts down.

use crate::channel::Channel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default keepalive period.
pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Handle to a running keepalive task.
///
/// Dropping the handle cancels the task.
#[derive(Debug)]
pub struct Keepalive {
    handle: JoinHandle<()>,
}

impl Keepalive {
    /// Stop sending keepalives.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn a keepalive task for `channel`.
///
/// The `suspended` flag is checked right before each send; while it is set
/// the tick is skipped, so teardown can quiesce the channel without racing
/// a no-op frame onto a half-closed stream. The task exits on its own when
/// a send fails, which includes the channel being shut down.
pub fn spawn_keepalive(
    channel: Channel,
    period: Duration,
    suspended: Arc<AtomicBool>,
) -> Keepalive {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; the first keepalive waits a full period.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if suspended.load(Ordering::Acquire) {
                continue;
            }
            if let Err(err) = channel.send_noop().await {
                tracing::debug!(error = %err, "keepalive stopping");
                break;
            }
        }
    });
    Keepalive { handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConnectionIds;
    use crate::frame::Request;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn sends_noops_on_the_period() {
        let (local, remote) = tokio::io::duplex(4096);
        let (lr, lw) = tokio::io::split(local);
        let channel = Channel::new(lw, lr, Arc::new(ConnectionIds::new()));
        let (rr, _rw) = tokio::io::split(remote);
        let mut reader = BufReader::new(rr);

        let keepalive = spawn_keepalive(
            channel,
            Duration::from_millis(10),
            Arc::new(AtomicBool::new(false)),
        );

        for _ in 0..2 {
            let frame = Request::read_from(&mut reader).await.unwrap();
            assert_eq!(frame, Request::Noop);
        }
        keepalive.cancel();
    }

    #[tokio::test]
    async fn suspension_skips_ticks() {
        let (local, remote) = tokio::io::duplex(4096);
        let (lr, lw) = tokio::io::split(local);
        let channel = Channel::new(lw, lr, Arc::new(ConnectionIds::new()));
        let (rr, _rw) = tokio::io::split(remote);
        let mut reader = BufReader::new(rr);

        let suspended = Arc::new(AtomicBool::new(true));
        let keepalive = spawn_keepalive(
            channel,
            Duration::from_millis(5),
            Arc::clone(&suspended),
        );

        // Nothing arrives while suspended.
        let quiet = tokio::time::timeout(
            Duration::from_millis(40),
            Request::read_from(&mut reader),
        )
        .await;
        assert!(quiet.is_err());

        suspended.store(false, Ordering::Release);
        let frame = Request::read_from(&mut reader).await.unwrap();
        assert_eq!(frame, Request::Noop);
        keepalive.cancel();
    }

    #[tokio::test]
    async fn stops_after_channel_shutdown() {
        let (local, remote) = tokio::io::duplex(4096);
        let (lr, lw) = tokio::io::split(local);
        let channel = Channel::new(lw, lr, Arc::new(ConnectionIds::new()));
        let (rr, _rw) = tokio::io::split(remote);
        let mut reader = BufReader::new(rr);

        let _keepalive = spawn_keepalive(
            channel.clone(),
            Duration::from_millis(20),
            Arc::new(AtomicBool::new(false)),
        );
        channel.send_quit().await.unwrap();
        assert_eq!(Request::read_from(&mut reader).await.unwrap(), Request::Quit);

        // Sends fail once the channel is shut down, so nothing follows.
        let quiet = tokio::time::timeout(
            Duration::from_millis(80),
            Request::read_from(&mut reader),
        )
        .await;
        assert!(quiet.is_err());
    }
}
