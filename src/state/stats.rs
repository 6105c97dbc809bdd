//! In-memory job statistics.
//!
//! A [`Histogram`] keeps a bounded reservoir of completion durations plus
//! running totals; a [`Meter`] counts events and tracks exponentially weighted
//! rates. Both export a plain snapshot that serializes to JSON for the
//! control surface.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Number of most recent samples kept for percentile estimates.
const RESERVOIR_SIZE: usize = 1028;

/// EWMA tick period.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Histogram {
    samples: VecDeque<f64>,
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(64),
            count: 0,
            sum: 0.0,
            min: None,
            max: None,
        }
    }

    pub fn update(&mut self, value: f64) {
        if self.samples.len() == RESERVOIR_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        if self.count == 0 {
            return HistogramSnapshot::default();
        }

        let mut values: Vec<f64> = self.samples.iter().copied().collect();
        values.sort_by(|a, b| a.total_cmp(b));
        let percentile = |p: f64| {
            let idx = ((values.len() as f64 * p) as usize).min(values.len() - 1);
            values[idx]
        };

        HistogramSnapshot {
            count: self.count,
            min: self.min.unwrap_or_default(),
            max: self.max.unwrap_or_default(),
            sum: self.sum,
            mean: self.sum / self.count as f64,
            median: percentile(0.5),
            p75: percentile(0.75),
            p95: percentile(0.95),
            p99: percentile(0.99),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub mean: f64,
    pub median: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone)]
struct Ewma {
    alpha: f64,
    rate: Option<f64>,
    uncounted: u64,
}

impl Ewma {
    fn minutes(minutes: f64) -> Self {
        let alpha = 1.0 - (-TICK_INTERVAL.as_secs_f64() / (60.0 * minutes)).exp();
        Self {
            alpha,
            rate: None,
            uncounted: 0,
        }
    }

    fn tick(&mut self) {
        let instant_rate = self.uncounted as f64 / TICK_INTERVAL.as_secs_f64();
        self.uncounted = 0;
        self.rate = Some(match self.rate {
            Some(rate) => rate + self.alpha * (instant_rate - rate),
            None => instant_rate,
        });
    }

    fn per_second(&self) -> f64 {
        self.rate.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct Meter {
    count: u64,
    started: Instant,
    last_tick: Instant,
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

impl Meter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            count: 0,
            started: now,
            last_tick: now,
            m1: Ewma::minutes(1.0),
            m5: Ewma::minutes(5.0),
            m15: Ewma::minutes(15.0),
        }
    }

    pub fn mark(&mut self) {
        self.tick_if_due(Instant::now());
        self.count += 1;
        self.m1.uncounted += 1;
        self.m5.uncounted += 1;
        self.m15.uncounted += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    fn tick_if_due(&mut self, now: Instant) {
        while now.duration_since(self.last_tick) >= TICK_INTERVAL {
            self.m1.tick();
            self.m5.tick();
            self.m15.tick();
            self.last_tick += TICK_INTERVAL;
        }
    }

    /// Snapshot taken without mutating the meter, so rates include only
    /// completed ticks.
    pub fn snapshot(&self) -> MeterSnapshot {
        let elapsed = self.started.elapsed().as_secs_f64();
        MeterSnapshot {
            count: self.count,
            mean_rate: if elapsed > 0.0 {
                self.count as f64 / elapsed
            } else {
                0.0
            },
            one_minute_rate: self.m1.per_second(),
            five_minute_rate: self.m5.per_second(),
            fifteen_minute_rate: self.m15.per_second(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterSnapshot {
    pub count: u64,
    pub mean_rate: f64,
    #[serde(rename = "1MinuteRate")]
    pub one_minute_rate: f64,
    #[serde(rename = "5MinuteRate")]
    pub five_minute_rate: f64,
    #[serde(rename = "15MinuteRate")]
    pub fifteen_minute_rate: f64,
}

/// Completion and timeout statistics kept per job type, per agent, and per
/// agent × job type pair. Only ever accumulated.
#[derive(Debug, Clone, Default)]
pub struct JobTypeStats {
    pub completion: Histogram,
    pub completions: Meter,
    pub timeouts: Meter,
}

impl JobTypeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completion(&mut self, duration_ms: f64) {
        self.completion.update(duration_ms);
        self.completions.mark();
    }

    pub fn record_timeout(&mut self) {
        self.timeouts.mark();
    }

    pub fn snapshot(&self) -> JobTypeStatsSnapshot {
        JobTypeStatsSnapshot {
            histogram: self.completion.snapshot(),
            meter: self.completions.snapshot(),
            timeouts: self.timeouts.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct JobTypeStatsSnapshot {
    pub histogram: HistogramSnapshot,
    pub meter: MeterSnapshot,
    pub timeouts: MeterSnapshot,
}
