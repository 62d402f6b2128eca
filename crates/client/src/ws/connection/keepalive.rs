//! Ping/pong liveness probing.
//!
//! Two independent timers share one cancellation token: the pinger writes a
//! ping right away and then once per interval, the monitor checks once per
//! interval whether the last pong is older than the timeout.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Time of the last pong; written by the read side, read by the monitor.
#[derive(Debug)]
pub struct KeepAliveTracker {
    last_response: Mutex<Instant>,
}

impl KeepAliveTracker {
    pub fn new() -> Self {
        Self {
            last_response: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_response.lock() = Instant::now();
    }

    pub fn last_response(&self) -> Instant {
        *self.last_response.lock()
    }
}

impl Default for KeepAliveTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Calls `ping` immediately and then every `every` until cancelled.
pub(crate) async fn run_pinger<F, Fut>(every: Duration, cancel: CancellationToken, mut ping: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => ping().await,
        }
    }
}

/// Checks liveness every `timeout`; runs `on_stale` at most once.
///
/// Returns `true` if the connection went stale, `false` if cancelled first.
pub(crate) async fn watch_liveness<F>(
    tracker: &KeepAliveTracker,
    timeout: Duration,
    cancel: CancellationToken,
    on_stale: F,
) -> bool
where
    F: FnOnce(),
{
    let mut ticker = interval_at(Instant::now() + timeout, timeout);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            tick = ticker.tick() => {
                if tick.saturating_duration_since(tracker.last_response()) > timeout {
                    on_stale();
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn stale_connection_fires_once() {
        let tracker = KeepAliveTracker::new();
        let fired = AtomicUsize::new(0);
        let started = Instant::now();

        let stale = watch_liveness(
            &tracker,
            Duration::from_millis(100),
            CancellationToken::new(),
            || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert!(stale);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // The first check sees exactly one interval since the dial, which is not late yet.
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_connection_alive() {
        let tracker = Arc::new(KeepAliveTracker::new());
        let cancel = CancellationToken::new();

        let ponger = {
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_millis(40));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => tracker.touch(),
                    }
                }
            })
        };

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                cancel.cancel();
            })
        };

        let stale = watch_liveness(&tracker, Duration::from_millis(100), cancel, || {
            panic!("connection reported stale while pongs were arriving")
        })
        .await;

        assert!(!stale);
        canceller.await.unwrap();
        ponger.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pinger_pings_immediately_then_every_interval() {
        let pings = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let task = {
            let pings = pings.clone();
            let cancel = cancel.clone();
            tokio::spawn(run_pinger(Duration::from_millis(100), cancel, move || {
                let pings = pings.clone();
                async move {
                    pings.fetch_add(1, Ordering::SeqCst);
                }
            }))
        };

        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        task.await.unwrap();

        // t = 0, 100, 200
        assert_eq!(pings.load(Ordering::SeqCst), 3);
    }
}
