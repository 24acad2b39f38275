//! Delayed reclamation of finished jobs.
//!
//! [`Reaper::arm`] schedules a callback after a fixed delay and returns a
//! [`ReclaimTimer`] that cancels it. Every timer is a child of the reaper's
//! shutdown token, so [`Reaper::shutdown`] cancels all of them at once.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Handle to one armed reclamation callback.
#[derive(Debug)]
pub struct ReclaimTimer {
    token: CancellationToken,
}

impl ReclaimTimer {
    /// Cancel the callback if it has not fired yet. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Source of cancellable delayed callbacks.
#[derive(Debug, Default)]
pub struct Reaper {
    shutdown: CancellationToken,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_expire` after `ttl` unless the returned timer is cancelled
    /// (or the reaper shut down) first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm<F, Fut>(&self, ttl: Duration, on_expire: F) -> ReclaimTimer
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let guard = token.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(ttl) => on_expire().await,
            }
        });

        ReclaimTimer { token }
    }

    /// Cancel every timer armed so far and any armed afterwards.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> futures::future::Ready<()> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        }
    }

    /// Let spawned timer tasks observe the current (paused) time.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_ttl() {
        let reaper = Reaper::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let _timer = reaper.arm(Duration::from_secs(600), counting(&fired));
        settle().await;

        tokio::time::advance(Duration::from_secs(599)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let reaper = Reaper::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = reaper.arm(Duration::from_secs(10), counting(&fired));

        timer.cancel();
        timer.cancel();
        assert!(timer.is_cancelled());

        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_all_timers() {
        let reaper = Reaper::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let first = reaper.arm(Duration::from_secs(10), counting(&fired));
        let second = reaper.arm(Duration::from_secs(20), counting(&fired));

        reaper.shutdown();
        assert!(reaper.is_shut_down());
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
