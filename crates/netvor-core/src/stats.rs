//! Traffic sampler
//!
//! Periodically reads cumulative byte counters and publishes the traffic
//! seen since the session started. Counters are read through
//! [`TrafficSource`] so tests and other platforms can supply their own.

use crate::bus::{SessionStatus, StatusBus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::Networks;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default sampling period
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(1000);

/// Shortest sampling period; shorter requests are raised to this
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Cumulative byte counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficTotals {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl TrafficTotals {
    /// Bytes moved since `baseline`, never negative
    pub fn since(&self, baseline: &TrafficTotals) -> TrafficTotals {
        TrafficTotals {
            rx_bytes: self.rx_bytes.saturating_sub(baseline.rx_bytes),
            tx_bytes: self.tx_bytes.saturating_sub(baseline.tx_bytes),
        }
    }
}

/// Source of cumulative traffic counters
pub trait TrafficSource: Send + Sync {
    /// Current totals, or `None` if the counters cannot be read
    fn totals(&self) -> Option<TrafficTotals>;
}

/// Network interface counters via `sysinfo`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    /// Count only this interface; all interfaces when `None`
    interface: Option<String>,
}

impl InterfaceCounters {
    /// Sum over every interface
    pub fn all() -> Self {
        Self { interface: None }
    }

    /// Only the named interface
    pub fn for_interface(name: impl Into<String>) -> Self {
        Self {
            interface: Some(name.into()),
        }
    }
}

impl TrafficSource for InterfaceCounters {
    fn totals(&self) -> Option<TrafficTotals> {
        let networks = Networks::new_with_refreshed_list();
        let mut totals = TrafficTotals::default();
        let mut seen = false;

        for (name, data) in networks.list() {
            if let Some(wanted) = &self.interface {
                if name != wanted {
                    continue;
                }
            }
            totals.rx_bytes = totals.rx_bytes.saturating_add(data.total_received());
            totals.tx_bytes = totals.tx_bytes.saturating_add(data.total_transmitted());
            seen = true;
        }

        seen.then_some(totals)
    }
}

/// Publishes traffic deltas while a session runs
pub struct StatsSampler {
    source: Arc<dyn TrafficSource>,
    bus: StatusBus,
    interval: Duration,
}

impl StatsSampler {
    pub fn new(source: Arc<dyn TrafficSource>, bus: StatusBus, interval: Duration) -> Self {
        Self {
            source,
            bus,
            interval: interval.max(MIN_SAMPLE_INTERVAL),
        }
    }

    /// Current counters, or zero when unavailable
    pub fn baseline(&self) -> TrafficTotals {
        self.source.totals().unwrap_or_default()
    }

    /// Start sampling against `baseline` for the session that began at
    /// `start_time_ms`
    pub fn spawn(&self, baseline: TrafficTotals, start_time_ms: u64) -> SamplerHandle {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let source = self.source.clone();
        let bus = self.bus.clone();
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick fires immediately; the connect status already covers it.
            interval.tick().await;

            loop {
                interval.tick().await;

                if !flag.load(Ordering::Relaxed) {
                    break;
                }

                let Some(totals) = source.totals() else {
                    debug!("Traffic counters unavailable, skipping sample");
                    continue;
                };
                let delta = totals.since(&baseline);

                bus.publish_status(
                    SessionStatus::connected_at(start_time_ms)
                        .with_traffic(delta.rx_bytes, delta.tx_bytes),
                );
            }
        });

        SamplerHandle { running, task }
    }
}

/// Handle to a running sampler task
pub struct SamplerHandle {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SamplerHandle {
    /// Check if the sampler is still active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed) && !self.task.is_finished()
    }

    /// Stop sampling; no status is published after this returns
    pub fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays a fixed sequence of readings, repeating the last one
    struct Scripted {
        readings: Mutex<Vec<Option<TrafficTotals>>>,
    }

    impl Scripted {
        fn new(mut readings: Vec<Option<TrafficTotals>>) -> Self {
            readings.reverse();
            Self {
                readings: Mutex::new(readings),
            }
        }
    }

    impl TrafficSource for Scripted {
        fn totals(&self) -> Option<TrafficTotals> {
            let mut readings = self.readings.lock().unwrap();
            if readings.len() > 1 {
                readings.pop().unwrap()
            } else {
                readings.last().copied().flatten()
            }
        }
    }

    fn totals(rx: u64, tx: u64) -> TrafficTotals {
        TrafficTotals {
            rx_bytes: rx,
            tx_bytes: tx,
        }
    }

    #[test]
    fn test_delta_never_negative() {
        let baseline = totals(1000, 500);
        assert_eq!(totals(1500, 700).since(&baseline), totals(500, 200));
        // Counter reset below the baseline
        assert_eq!(totals(10, 10).since(&baseline), totals(0, 0));
    }

    #[test]
    fn test_interface_filter_unknown() {
        let counters = InterfaceCounters::for_interface("netvor-test-does-not-exist");
        assert!(counters.totals().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_publishes_deltas() {
        let bus = StatusBus::new();
        let source = Arc::new(Scripted::new(vec![
            Some(totals(100, 50)),
            None,
            Some(totals(400, 90)),
        ]));
        let sampler = StatsSampler::new(source, bus.clone(), DEFAULT_SAMPLE_INTERVAL);

        let baseline = sampler.baseline();
        assert_eq!(baseline, totals(100, 50));

        bus.publish_status(SessionStatus::connected_at(42));
        let handle = sampler.spawn(baseline, 42);

        // Unavailable reading: nothing published
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(bus.status(), SessionStatus::connected_at(42));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let status = bus.status();
        assert!(status.connected);
        assert_eq!(status.start_time_ms, 42);
        assert_eq!((status.rx_bytes, status.tx_bytes), (300, 40));

        assert!(handle.is_running());
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_publish_after_stop() {
        let bus = StatusBus::new();
        let source = Arc::new(Scripted::new(vec![Some(totals(0, 0)), Some(totals(10, 10))]));
        let sampler = StatsSampler::new(source, bus.clone(), DEFAULT_SAMPLE_INTERVAL);

        let handle = sampler.spawn(sampler.baseline(), 1);
        handle.stop();
        bus.publish_status(SessionStatus::DISCONNECTED);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(bus.status(), SessionStatus::DISCONNECTED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let bus = StatusBus::new();
        let source = Arc::new(Scripted::new(vec![Some(totals(0, 0)), Some(totals(5, 7))]));
        let sampler = StatsSampler::new(source, bus.clone(), Duration::ZERO);

        let handle = sampler.spawn(sampler.baseline(), 9);
        tokio::time::sleep(MIN_SAMPLE_INTERVAL * 5).await;

        let status = bus.status();
        assert!(status.connected);
        assert_eq!((status.rx_bytes, status.tx_bytes), (5, 7));
        assert!(handle.is_running());
        handle.stop();
    }
}
