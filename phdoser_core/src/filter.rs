//! Reading filter: median smoothing, stability and jump rejection, and the
//! rolling average used for the range check.
//!
//! Thresholds arrive with every call (`FilterParams`) so edits to the hot
//! settings apply on the next reading.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use phdoser_config::PhRange;

/// Readings averaged for the range status.
pub const ROLLING_WINDOW: usize = 20;
/// Window over which large jumps are counted.
pub const JUMP_WINDOW: Duration = Duration::from_secs(60);
/// More jumps than this inside `JUMP_WINDOW` is persistent instability.
pub const MAX_JUMPS_IN_WINDOW: usize = 5;
/// Raw samples compared by the stability check.
const STABILITY_SPAN: usize = 3;
/// Readings below this are treated as noise and dropped silently.
const PH_FLOOR: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub jump_threshold: f64,
    pub median_window: usize,
    pub stability_threshold: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            jump_threshold: 1.0,
            median_window: 5,
            stability_threshold: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeCheck {
    pub average: f64,
    pub in_range: bool,
}

/// What the filter decided about one raw reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Exactly 0 or 14: the probe is most likely disconnected.
    Unrealistic(f64),
    BelowFloor(f64),
    /// Median window not full yet.
    Holding { have: usize, need: usize },
    Unstable { spread: f64 },
    Jump {
        delta: f64,
        recent_jumps: usize,
        /// Set on the jump that pushes the count over the limit.
        alert: bool,
    },
    Accepted {
        ph: f64,
        /// Present once the rolling window is full.
        range: Option<RangeCheck>,
    },
}

#[derive(Debug, Clone)]
pub struct ReadingFilter {
    median: VecDeque<f64>,
    last_accepted: Option<f64>,
    jumps: VecDeque<Instant>,
    jump_alert_armed: bool,
    rolling: VecDeque<f64>,
}

impl Default for ReadingFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingFilter {
    pub fn new() -> Self {
        Self {
            median: VecDeque::new(),
            last_accepted: None,
            jumps: VecDeque::new(),
            jump_alert_armed: true,
            rolling: VecDeque::with_capacity(ROLLING_WINDOW),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn last_accepted(&self) -> Option<f64> {
        self.last_accepted
    }

    pub fn median_len(&self) -> usize {
        self.median.len()
    }

    pub fn rolling_len(&self) -> usize {
        self.rolling.len()
    }

    pub fn observe(
        &mut self,
        ph: f64,
        params: &FilterParams,
        range: PhRange,
        now: Instant,
    ) -> Verdict {
        if ph == 0.0 || ph == 14.0 {
            return Verdict::Unrealistic(ph);
        }
        if ph < PH_FLOOR {
            return Verdict::BelowFloor(ph);
        }

        let size = params.median_window.max(1);
        self.median.push_back(ph);
        while self.median.len() > size {
            self.median.pop_front();
        }
        if self.median.len() < size {
            return Verdict::Holding {
                have: self.median.len(),
                need: size,
            };
        }
        let filtered = median_of(&self.median);

        if self.median.len() >= STABILITY_SPAN {
            let spread = spread_of(self.median.iter().rev().take(STABILITY_SPAN).copied());
            if spread > params.stability_threshold {
                tracing::debug!(target: "phdoser::probe", spread, "discarded unstable reading");
                return Verdict::Unstable { spread };
            }
        }

        if let Some(prev) = self.last_accepted {
            let delta = (filtered - prev).abs();
            if delta > params.jump_threshold {
                self.jumps.push_back(now);
                let recent_jumps = self.prune_jumps(now);
                let alert = recent_jumps > MAX_JUMPS_IN_WINDOW && self.jump_alert_armed;
                if alert {
                    self.jump_alert_armed = false;
                }
                tracing::debug!(target: "phdoser::probe", delta, recent_jumps, "ignored jump");
                return Verdict::Jump {
                    delta,
                    recent_jumps,
                    alert,
                };
            }
        }
        self.prune_jumps(now);

        self.last_accepted = Some(filtered);
        self.rolling.push_back(filtered);
        while self.rolling.len() > ROLLING_WINDOW {
            self.rolling.pop_front();
        }
        let range = (self.rolling.len() >= ROLLING_WINDOW).then(|| {
            let average = self.rolling.iter().sum::<f64>() / self.rolling.len() as f64;
            RangeCheck {
                average,
                in_range: range.contains(average),
            }
        });
        Verdict::Accepted {
            ph: filtered,
            range,
        }
    }

    /// Drop jumps older than the window, re-arm the alert once the count is
    /// back at or under the limit, and return the remaining count.
    fn prune_jumps(&mut self, now: Instant) -> usize {
        while let Some(&t) = self.jumps.front() {
            if now.saturating_duration_since(t) > JUMP_WINDOW {
                self.jumps.pop_front();
            } else {
                break;
            }
        }
        if self.jumps.len() <= MAX_JUMPS_IN_WINDOW {
            self.jump_alert_armed = true;
        }
        self.jumps.len()
    }
}

/// `sorted[len / 2]`: the lower median for even lengths.
pub fn median_of(window: &VecDeque<f64>) -> f64 {
    let mut v: Vec<f64> = window.iter().copied().collect();
    v.sort_by(f64::total_cmp);
    v.get(v.len() / 2).copied().unwrap_or(f64::NAN)
}

fn spread_of(values: impl Iterator<Item = f64>) -> f64 {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    hi - lo
}
