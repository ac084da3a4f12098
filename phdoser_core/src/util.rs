//! Small numeric and time helpers.

/// Number of milliseconds in one second.
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Round to two decimal places (half away from zero).
#[inline]
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Longest schedule offset we hand out (about a century); keeps date
/// arithmetic on `DateTime` from overflowing.
const MAX_OFFSET_MS: f64 = 100.0 * 365.0 * 24.0 * 3600.0 * 1000.0;

/// Convert fractional hours into a chrono duration, capped at
/// `MAX_OFFSET_MS` and mapping non-finite or negative input to zero.
pub fn hours(h: f64) -> chrono::Duration {
    if !h.is_finite() || h <= 0.0 {
        return chrono::Duration::zero();
    }
    let ms = (h * 3600.0 * MILLIS_PER_SEC as f64).round().min(MAX_OFFSET_MS);
    chrono::Duration::milliseconds(ms as i64)
}

/// Convert fractional minutes into a chrono duration (see [`hours`]).
pub fn minutes(m: f64) -> chrono::Duration {
    hours(m / 60.0)
}
