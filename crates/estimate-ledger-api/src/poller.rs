use std::future::Future;
use std::time::Duration;

use anyhow::{ensure, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a periodic task. Dropping it cancels the task.
#[derive(Debug)]
pub struct PollHandle {
    period: Duration,
    task: JoinHandle<()>,
}

impl PollHandle {
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel the task. A tick that is already executing is abandoned at its next await point.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Invoke `tick` once immediately and then every `period`.
///
/// Ticks never overlap; a tick that overruns delays the next one instead of bursting.
///
/// # Errors
/// Returns an error when `period` is zero.
pub fn spawn_poller<F, Fut>(period: Duration, mut tick: F) -> Result<PollHandle>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    ensure!(!period.is_zero(), "poll interval MUST be greater than zero");

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tick().await;
        }
    });

    tracing::debug!(period = ?period, "poller started");
    Ok(PollHandle { period, task })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn counting_poller(period: Duration) -> (PollHandle, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_poller(period, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        match handle {
            Ok(handle) => (handle, ticks),
            Err(err) => panic!("poller should start: {err}"),
        }
    }

    // Test IDs: TPOL-001
    #[tokio::test]
    async fn poller_ticks_immediately_and_repeatedly() {
        let (handle, ticks) = counting_poller(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(55)).await;

        assert!(handle.is_running());
        assert_eq!(handle.period(), Duration::from_millis(10));
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    // Test IDs: TPOL-002
    #[tokio::test]
    async fn stop_halts_further_ticks() {
        let (handle, ticks) = counting_poller(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(35)).await;
        handle.stop();

        tokio::time::sleep(Duration::from_millis(15)).await;
        let settled = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), settled);
    }

    // Test IDs: TPOL-003
    #[tokio::test]
    async fn dropping_handle_cancels_task() {
        let (handle, ticks) = counting_poller(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(25)).await;
        {
            let _scoped = handle;
        }

        tokio::time::sleep(Duration::from_millis(15)).await;
        let settled = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), settled);
    }

    // Test IDs: TPOL-004
    #[tokio::test]
    async fn zero_period_is_rejected() {
        let result = spawn_poller(Duration::ZERO, || async {});
        assert!(result.is_err());
    }
}
