//! Runtime knobs for the background loops.
//!
//! These are the resolved `Duration`-typed forms of the TOML bootstrap
//! sections in `phdoser_config` (see `conversions.rs`).
use std::time::Duration;

/// Probe reader timing and failure-recovery policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderPolicy {
    /// Delay before reopening the port after a failure.
    pub reconnect_delay: Duration,
    /// Idle period while no probe device is assigned.
    pub unassigned_poll: Duration,
    /// Consecutive empty reads tolerated before a forced reconnect.
    pub empty_read_threshold: u32,
    /// Consecutive read errors tolerated before a forced reconnect.
    pub fatal_error_threshold: u32,
    /// Failed opens before the communication status goes to error.
    pub max_connect_failures: u32,
    /// Silence after which the reading status errors (and re-raise period).
    pub stale_after: Duration,
    pub slope_timeout: Duration,
}

impl Default for ReaderPolicy {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            unassigned_poll: Duration::from_secs(5),
            empty_read_threshold: 10,
            fatal_error_threshold: 2,
            max_connect_failures: 5,
            stale_after: Duration::from_secs(30),
            slope_timeout: Duration::from_secs(10),
        }
    }
}

/// Periods of the scheduler and health loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPeriods {
    pub auto_dose_tick: Duration,
    pub pump_poll: Duration,
    pub health_check: Duration,
}

impl Default for LoopPeriods {
    fn default() -> Self {
        Self {
            auto_dose_tick: Duration::from_secs(5),
            pump_poll: Duration::from_secs(5),
            health_check: Duration::from_secs(10),
        }
    }
}
