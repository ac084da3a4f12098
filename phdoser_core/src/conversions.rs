//! `From` implementations bridging `phdoser_config` types to core types.

use std::time::Duration;

use crate::config::{LoopPeriods, ReaderPolicy};
use crate::filter::FilterParams;

impl From<&phdoser_config::ProbeCfg> for ReaderPolicy {
    fn from(c: &phdoser_config::ProbeCfg) -> Self {
        Self {
            reconnect_delay: Duration::from_millis(c.reconnect_delay_ms),
            unassigned_poll: Duration::from_millis(c.unassigned_poll_ms),
            empty_read_threshold: c.empty_read_threshold,
            fatal_error_threshold: c.fatal_error_threshold,
            max_connect_failures: c.max_connect_failures,
            stale_after: Duration::from_secs(c.stale_reading_secs),
            slope_timeout: Duration::from_millis(c.slope_timeout_ms),
        }
    }
}

impl From<&phdoser_config::SchedulerCfg> for LoopPeriods {
    fn from(c: &phdoser_config::SchedulerCfg) -> Self {
        Self {
            auto_dose_tick: Duration::from_millis(c.auto_dose_tick_ms),
            pump_poll: Duration::from_millis(c.pump_poll_ms),
            health_check: Duration::from_millis(c.health_check_ms),
        }
    }
}

// Hot thresholds; rebuilt from the settings document on every parse pass.
impl From<&phdoser_config::Settings> for FilterParams {
    fn from(s: &phdoser_config::Settings) -> Self {
        Self {
            jump_threshold: s.ph_jump_threshold,
            median_window: s.ph_median_window,
            stability_threshold: s.ph_stability_threshold,
        }
    }
}
