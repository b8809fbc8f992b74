//! Periodic task scheduling.
//!
//! One abstraction runs every background cycle in the bridge: execute the
//! cycle, log any escaping error with the task name, wait the interval,
//! repeat until cancelled. There is deliberately no backoff, jitter, or
//! retry cutoff; a persistently failing task logs on every interval and the
//! next cycle starts from scratch.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::SyncResult;

/// Run `cycle` forever at `interval` until `cancel` fires.
///
/// The first cycle runs immediately. Cancellation is observed between
/// cycles and during the wait, never inside a running cycle; shutdown is
/// coarse by design.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut cycle: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<()>>,
{
    info!(
        task = name,
        interval_ms = interval.as_millis() as u64,
        "periodic task started"
    );

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if let Err(e) = cycle().await {
            warn!(task = name, error = %e, "cycle failed");
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!(task = name, "periodic task stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_runs_immediately_then_per_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let task = {
            let count = count.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_periodic("tick", Duration::from_secs(5), cancel, move || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await;
            })
        };

        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // three more intervals, three more cycles
        for expected in 2..=4 {
            tokio::time::advance(Duration::from_secs(5)).await;
            tokio::task::yield_now().await;
            assert_eq!(count.load(Ordering::SeqCst), expected);
        }

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_cycle_keeps_repeating() {
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let task = {
            let count = count.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_periodic("flaky", Duration::from_secs(1), cancel, move || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Err(SyncError::Protocol("always broken".into()))
                    }
                })
                .await;
            })
        };

        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert!(count.load(Ordering::SeqCst) >= 10);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_the_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let task = {
            let count = count.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_periodic("stoppable", Duration::from_secs(1), cancel, move || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await;
            })
        };

        tokio::time::advance(Duration::from_millis(1)).await;
        cancel.cancel();
        task.await.unwrap();

        let after_cancel = count.load(Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }
}
