#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas for the pH dosing controller.
//!
//! Two layers live here:
//! - `AppConfig` is the TOML bootstrap file read once at startup (paths,
//!   logging, loop periods, serial timing). Deserialized and validated.
//! - `Settings` is the hot JSON document the operator edits at runtime. It is
//!   re-read through a `SettingsProvider` before every decision.
use serde::Deserialize;

pub mod atomic;
pub mod settings;
pub mod store;

pub use settings::{
    CalibrationStore, DosageStrength, PhRange, ProbeCalibration, PumpCalibration, PumpTrigger,
    RelayPorts, Settings, SlopeResult, UsbRoles,
};
pub use store::{JsonFileSettings, MemorySettings, SettingsProvider};

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Paths {
    /// Hot settings document (JSON).
    pub settings: String,
    /// Append-only dosing event log (JSON lines).
    pub event_log: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            settings: "data/settings.json".into(),
            event_log: "data/logs/sensor_log.jsonl".into(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

/// Serial timing and failure-recovery policy for the probe reader.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProbeCfg {
    pub baud: u32,
    /// Per-read timeout; an empty read after this long counts as a glitch.
    pub read_timeout_ms: u64,
    /// Delay before reopening the port after a connection failure.
    pub reconnect_delay_ms: u64,
    /// Idle period while no probe device is assigned.
    pub unassigned_poll_ms: u64,
    /// Consecutive empty reads tolerated before forcing a reconnect.
    pub empty_read_threshold: u32,
    /// Consecutive read exceptions tolerated before forcing a reconnect.
    pub fatal_error_threshold: u32,
    /// Failed opens before the communication status goes to error.
    pub max_connect_failures: u32,
    /// Seconds without an accepted reading before the reading status errors.
    pub stale_reading_secs: u64,
    /// Bounded wait for a `?SLOPE` answer.
    pub slope_timeout_ms: u64,
}

impl Default for ProbeCfg {
    fn default() -> Self {
        Self {
            baud: 9600,
            read_timeout_ms: 1000,
            reconnect_delay_ms: 5000,
            unassigned_poll_ms: 5000,
            empty_read_threshold: 10,
            fatal_error_threshold: 2,
            max_connect_failures: 5,
            stale_reading_secs: 30,
            slope_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RelayCfg {
    pub baud: u32,
    pub timeout_ms: u64,
}

impl Default for RelayCfg {
    fn default() -> Self {
        Self {
            baud: 9600,
            timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerCfg {
    /// Tick of the fixed-interval auto-dose loop.
    pub auto_dose_tick_ms: u64,
    /// Poll period of the pump-state source.
    pub pump_poll_ms: u64,
    /// Period of the relay presence check.
    pub health_check_ms: u64,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            auto_dose_tick_ms: 5000,
            pump_poll_ms: 5000,
            health_check_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: Paths,
    pub logging: Logging,
    pub probe: ProbeCfg,
    pub relay: RelayCfg,
    pub scheduler: SchedulerCfg,
}

pub fn load_toml(s: &str) -> Result<AppConfig, toml::de::Error> {
    toml::from_str::<AppConfig>(s)
}

impl AppConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        // Paths
        if self.paths.settings.trim().is_empty() {
            eyre::bail!("paths.settings must not be empty");
        }
        if self.paths.event_log.trim().is_empty() {
            eyre::bail!("paths.event_log must not be empty");
        }

        // Logging
        if let Some(rot) = self.logging.rotation.as_deref() {
            if !matches!(rot, "never" | "daily" | "hourly") {
                eyre::bail!("logging.rotation must be one of never|daily|hourly");
            }
        }

        // Probe
        if self.probe.baud == 0 {
            eyre::bail!("probe.baud must be > 0");
        }
        if self.probe.read_timeout_ms == 0 {
            eyre::bail!("probe.read_timeout_ms must be >= 1");
        }
        if self.probe.empty_read_threshold == 0 {
            eyre::bail!("probe.empty_read_threshold must be >= 1");
        }
        if self.probe.fatal_error_threshold == 0 {
            eyre::bail!("probe.fatal_error_threshold must be >= 1");
        }
        if self.probe.max_connect_failures == 0 {
            eyre::bail!("probe.max_connect_failures must be >= 1");
        }
        if self.probe.slope_timeout_ms == 0 {
            eyre::bail!("probe.slope_timeout_ms must be >= 1");
        }
        if self.probe.slope_timeout_ms > 5 * 60 * 1000 {
            eyre::bail!("probe.slope_timeout_ms is unreasonably large (>5min)");
        }

        // Relay
        if self.relay.baud == 0 {
            eyre::bail!("relay.baud must be > 0");
        }
        if self.relay.timeout_ms == 0 {
            eyre::bail!("relay.timeout_ms must be >= 1");
        }

        // Scheduler
        if self.scheduler.auto_dose_tick_ms == 0 {
            eyre::bail!("scheduler.auto_dose_tick_ms must be >= 1");
        }
        if self.scheduler.pump_poll_ms == 0 {
            eyre::bail!("scheduler.pump_poll_ms must be >= 1");
        }
        if self.scheduler.health_check_ms == 0 {
            eyre::bail!("scheduler.health_check_ms must be >= 1");
        }

        Ok(())
    }
}
