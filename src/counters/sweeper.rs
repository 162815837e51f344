use super::RateCounters;
use crate::clock::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Periodically evict idle counters
pub fn spawn_sweeper(
    counters: Arc<RateCounters>,
    clock: Arc<dyn Clock>,
    interval: Duration,
) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "Counter sweeper started");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            counters.sweep(clock.now());
        }
    })
}
