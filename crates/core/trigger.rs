//! Fixed-cadence loop trigger.

use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant};

use crate::error::Result;

/// Runs a tick function on a fixed cadence.
///
/// Each iteration sleeps `max(0, interval - elapsed)`, so a slow tick delays
/// the next one instead of causing a burst of catch-up ticks.
#[derive(Debug, Clone, Copy)]
pub struct LoopTimeTrigger {
    interval: Duration,
}

impl LoopTimeTrigger {
    /// Create a trigger firing every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// The configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `tick` forever.
    pub async fn start<F, Fut>(&self, tick: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.run_until(tick, std::future::pending()).await
    }

    /// Run `tick` until `shutdown` resolves.
    ///
    /// A tick in progress is allowed to finish; shutdown is observed while
    /// sleeping between ticks.
    pub async fn run_until<F, Fut, S>(&self, mut tick: F, shutdown: S)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::debug!(interval_ms = self.interval.as_millis() as u64, "Loop trigger started");

        loop {
            let started = Instant::now();

            if let Err(e) = tick().await {
                tracing::error!(error = %e, "Tick failed");
            }

            let elapsed = started.elapsed();
            if elapsed > self.interval {
                tracing::debug!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Tick overran interval, firing next tick immediately"
                );
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = time::sleep(self.interval.saturating_sub(elapsed)) => {}
            }
        }

        tracing::debug!("Loop trigger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DroverError;
    use std::sync::{Arc, Mutex};

    async fn record_ticks(tick_cost: Duration, fail: bool) -> Vec<Duration> {
        let origin = Instant::now();
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let trigger = LoopTimeTrigger::new(Duration::from_secs(10));

        let recorded = ticks.clone();
        trigger
            .run_until(
                move || {
                    let recorded = recorded.clone();
                    async move {
                        recorded.lock().unwrap().push(origin.elapsed());
                        time::sleep(tick_cost).await;
                        if fail {
                            return Err(DroverError::Store("unreachable".to_string()));
                        }
                        Ok(())
                    }
                },
                time::sleep(Duration::from_secs(35)),
            )
            .await;

        let ticks = ticks.lock().unwrap().clone();
        ticks
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_tick_keeps_cadence() {
        let ticks = record_ticks(Duration::from_secs(2), false).await;
        assert_eq!(
            ticks,
            vec![
                Duration::ZERO,
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(30),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tick_does_not_catch_up() {
        let ticks = record_ticks(Duration::from_secs(15), false).await;
        assert_eq!(
            ticks,
            vec![
                Duration::ZERO,
                Duration::from_secs(15),
                Duration::from_secs(30),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_errors_do_not_stop_loop() {
        let ticks = record_ticks(Duration::ZERO, true).await;
        assert_eq!(ticks.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_never_returns() {
        let trigger = LoopTimeTrigger::new(Duration::from_secs(1));
        let result = time::timeout(Duration::from_secs(60), trigger.start(|| async { Ok(()) })).await;
        assert!(result.is_err());
    }
}
