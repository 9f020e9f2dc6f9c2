//! Fixed-interval sweep scheduler.
//!
//! Meant to sit inside a `tokio::select!` loop:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         due = schedule.wait_for_sweep() => {
//!             monitor.sweep(&registry);
//!             schedule.record_sweep_end();
//!         }
//!         _ = shutdown.changed() => break,
//!     }
//! }
//! ```

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::{self, Instant as TokioInstant};
use tracing::{debug, warn};

/// Information about a sweep that is due.
#[derive(Debug, Clone)]
pub struct SweepInfo {
    /// Starts at 1.
    pub sweep: u64,
    /// `true` if the sweep fired more than a tenth of an interval late.
    pub overrun: bool,
    /// Whole intervals skipped because of the delay.
    pub skipped: u64,
}

/// Counters kept across sweeps.
#[derive(Debug, Clone, Default)]
pub struct SweepMetrics {
    pub total_sweeps: u64,
    pub total_overruns: u64,
    pub total_skipped: u64,
    /// Longest time spent inside one sweep.
    pub max_sweep_time: Duration,
}

/// Fires once per interval. Missed sweeps are skipped, never replayed.
pub struct SweepSchedule {
    interval: Option<Duration>,
    next: Option<TokioInstant>,
    count: u64,
    sweep_start: Option<Instant>,
    metrics: SweepMetrics,
}

impl SweepSchedule {
    /// A zero `interval` disables sweeping: [`wait_for_sweep`] never
    /// resolves. The first sweep is delayed by up to `jitter` extra.
    ///
    /// [`wait_for_sweep`]: Self::wait_for_sweep
    pub fn new(interval: Duration, jitter: Duration) -> Self {
        let interval = (!interval.is_zero()).then_some(interval);
        let next = interval.map(|d| {
            let extra = if jitter.is_zero() {
                Duration::ZERO
            } else {
                let us = rand::rng().random_range(0..jitter.as_micros().max(1) as u64);
                Duration::from_micros(us)
            };
            TokioInstant::now() + d + extra
        });
        match interval {
            Some(d) => debug!(interval_ms = d.as_millis() as u64, "sweep schedule created"),
            None => debug!("sweep schedule disabled"),
        }
        Self {
            interval,
            next,
            count: 0,
            sweep_start: None,
            metrics: SweepMetrics::default(),
        }
    }

    /// Waits until the next sweep is due.
    pub async fn wait_for_sweep(&mut self) -> SweepInfo {
        let (next, interval) = match (self.next, self.interval) {
            (Some(next), Some(interval)) => (next, interval),
            _ => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        };

        time::sleep_until(next).await;

        let now = TokioInstant::now();
        self.count += 1;
        self.sweep_start = Some(Instant::now());

        let late_by = now.saturating_duration_since(next);
        let overrun = late_by > interval / 10;
        let skipped = if overrun {
            (late_by.as_nanos() / interval.as_nanos()) as u64
        } else {
            0
        };
        if skipped > 0 {
            warn!(
                sweep = self.count,
                skipped,
                late_ms = late_by.as_millis() as u64,
                "monitor sweep late; skipping ahead"
            );
        }
        self.next = Some(now + interval);

        if overrun {
            self.metrics.total_overruns += 1;
        }
        self.metrics.total_skipped += skipped;
        self.metrics.total_sweeps += 1;

        SweepInfo {
            sweep: self.count,
            overrun,
            skipped,
        }
    }

    /// Call after the sweep's work is done.
    pub fn record_sweep_end(&mut self) {
        let Some(start) = self.sweep_start.take() else {
            return;
        };
        let elapsed = start.elapsed();
        if elapsed > self.metrics.max_sweep_time {
            self.metrics.max_sweep_time = elapsed;
        }
        if let Some(interval) = self.interval {
            if elapsed >= interval {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    interval_ms = interval.as_millis() as u64,
                    "monitor sweep took longer than its interval"
                );
            }
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.interval.is_none()
    }

    pub fn metrics(&self) -> &SweepMetrics {
        &self.metrics
    }
}
