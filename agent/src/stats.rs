//! Rolling tick-rate statistics
//!
//! Every `sample_interval_ticks` ticks the wall time since the previous
//! sample is turned into an instantaneous tick rate, which is folded into a
//! set of fixed-size, time-weighted rolling windows (5s, 10s, 1m, 5m, 15m by
//! default).
//!
//! Running totals are kept in arbitrary-precision decimal. They are updated
//! by subtract-then-add for the whole lifetime of the host, and binary
//! floating point would drift over days of uptime.

use crate::clock::Clock;
use crate::config::StatisticsConfig;
use bigdecimal::{BigDecimal, RoundingMode};
use num_traits::{ToPrimitive, Zero};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tickscope_shared::types::tps::{TpsReading, TpsSnapshot};
use tickscope_shared::utils::window_label;
use tracing::debug;

/// Fractional digits kept by every decimal division
const DECIMAL_SCALE: i64 = 30;

/// Anything that can report the short-term tick rate
pub trait TpsSource: Send + Sync {
    /// Average over the shortest configured window, in ticks per second
    fn short_term_tps(&self) -> f64;
}

/// Fixed-size time-weighted rolling average
///
/// Holds exactly `size` (rate, duration) pairs at all times. `total` and
/// `time` always equal the sums over those pairs.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    size: usize,
    index: usize,
    samples: Vec<BigDecimal>,
    times: Vec<u64>,
    total: BigDecimal,
    time: u64,
}

impl RollingWindow {
    /// A window pre-filled with `size` samples of `baseline` ticks/s, each
    /// covering `baseline_nanos`.
    pub fn new(size: usize, baseline: u32, baseline_nanos: u64) -> Self {
        let size = size.max(1);
        let baseline = BigDecimal::from(baseline);
        let contribution = &baseline * &BigDecimal::from(baseline_nanos);
        let total = &contribution * &BigDecimal::from(size as u64);

        Self {
            size,
            index: 0,
            samples: vec![baseline; size],
            times: vec![baseline_nanos; size],
            total,
            time: baseline_nanos.saturating_mul(size as u64),
        }
    }

    /// Replace the oldest sample. O(1).
    pub fn add(&mut self, value: BigDecimal, nanos: u64) {
        let evicted_nanos = self.times[self.index];
        let evicted = &self.samples[self.index] * &BigDecimal::from(evicted_nanos);
        self.time -= evicted_nanos;
        self.total = &self.total - &evicted;

        let added = &value * &BigDecimal::from(nanos);
        self.samples[self.index] = value;
        self.times[self.index] = nanos;
        self.time = self.time.saturating_add(nanos);
        self.total = &self.total + &added;

        self.index += 1;
        if self.index == self.size {
            self.index = 0;
        }
    }

    /// Time-weighted mean of the samples in the window
    pub fn average(&self) -> BigDecimal {
        if self.time == 0 {
            return BigDecimal::zero();
        }
        (&self.total / &BigDecimal::from(self.time))
            .with_scale_round(DECIMAL_SCALE, RoundingMode::HalfUp)
    }

    pub fn average_f64(&self) -> f64 {
        self.average().to_f64().unwrap_or(0.0)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sum of sample durations currently in the window
    pub fn covered(&self) -> Duration {
        Duration::from_nanos(self.time)
    }
}

struct TpsWindow {
    secs: u64,
    window: RwLock<RollingWindow>,
}

#[derive(Default)]
struct LastSample {
    at: Option<Duration>,
    instantaneous: Option<f64>,
}

/// Tick-rate averages over several horizons
///
/// `on_tick` is the single writer; any number of threads may read averages
/// concurrently. Each window sits behind its own lock, so a reader always
/// sees the totals of a complete `add`.
pub struct TickStatistics {
    sample_interval: u64,
    nominal_tps: u32,
    /// `sample_interval` ticks expressed in tick-nanoseconds
    tps_base: BigDecimal,
    windows: Vec<TpsWindow>,
    last: Mutex<LastSample>,
    clock: Arc<dyn Clock>,
}

impl TickStatistics {
    pub fn new(config: &StatisticsConfig, clock: Arc<dyn Clock>) -> Self {
        let sample_interval = config.sample_interval_ticks.max(1);
        let baseline_nanos = config.nominal_sample_nanos();
        let mut secs = config.windows_secs.clone();
        secs.sort_unstable();
        secs.dedup();

        let windows = secs
            .into_iter()
            .map(|secs| TpsWindow {
                secs,
                window: RwLock::new(RollingWindow::new(
                    config.window_capacity(secs),
                    config.nominal_tps,
                    baseline_nanos,
                )),
            })
            .collect();

        Self {
            sample_interval,
            nominal_tps: config.nominal_tps,
            tps_base: BigDecimal::from(1_000_000_000u64) * BigDecimal::from(sample_interval),
            windows,
            last: Mutex::new(LastSample::default()),
            clock,
        }
    }

    /// Called once per tick from the tick thread
    pub fn on_tick(&self, tick: u64) {
        if tick % self.sample_interval != 0 {
            return;
        }

        let now = self.clock.now();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let Some(previous) = last.at else {
            last.at = Some(now);
            return;
        };

        let elapsed = now.saturating_sub(previous).as_nanos().min(u128::from(u64::MAX)) as u64;
        if elapsed == 0 {
            // Two samples at the same instant carry no rate information.
            return;
        }

        let current = (&self.tps_base / &BigDecimal::from(elapsed))
            .with_scale_round(DECIMAL_SCALE, RoundingMode::HalfUp);
        last.instantaneous = current.to_f64();
        last.at = Some(now);
        drop(last);

        debug!(tick, elapsed_ns = elapsed, tps = %current.round(2), "tick rate sample");

        for w in &self.windows {
            let mut window = w.window.write().unwrap_or_else(|e| e.into_inner());
            window.add(current.clone(), elapsed);
        }
    }

    /// Average over the window of exactly `window_secs`, if configured
    pub fn average(&self, window_secs: u64) -> Option<f64> {
        self.windows
            .iter()
            .find(|w| w.secs == window_secs)
            .map(|w| read_average(&w.window))
    }

    /// Most recent instantaneous rate, if two samples have been taken
    pub fn instantaneous(&self) -> Option<f64> {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .instantaneous
    }

    /// Configured window lengths, shortest first
    pub fn windows(&self) -> Vec<u64> {
        self.windows.iter().map(|w| w.secs).collect()
    }

    pub fn nominal_tps(&self) -> u32 {
        self.nominal_tps
    }

    /// Every window as an operator-facing reading
    pub fn snapshot(&self) -> TpsSnapshot {
        let nominal = f64::from(self.nominal_tps);
        TpsSnapshot {
            readings: self
                .windows
                .iter()
                .map(|w| TpsReading::new(w.secs, read_average(&w.window), nominal))
                .collect(),
        }
    }

    /// "5s: 20, 10s: 19.87, ..." for logs
    pub fn describe(&self) -> String {
        self.snapshot()
            .readings
            .iter()
            .map(|r| format!("{}: {}", window_label(r.window_secs), r))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl TpsSource for TickStatistics {
    fn short_term_tps(&self) -> f64 {
        self.windows
            .first()
            .map(|w| read_average(&w.window))
            .unwrap_or(f64::from(self.nominal_tps))
    }
}

fn read_average(window: &RwLock<RollingWindow>) -> f64 {
    window
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .average_f64()
}
