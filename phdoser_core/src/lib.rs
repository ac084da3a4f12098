#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core pH dosing logic (hardware-agnostic).
//!
//! All hardware goes through the `phdoser_traits` seams (`RelayDriver`,
//! `ProbeConnector`/`ProbeLink`); all tunables are read from a
//! `phdoser_config::SettingsProvider` at the point of use.
//!
//! ## Architecture
//!
//! - **Framing**: carriage-return line framer with an overflow guard (`framer`)
//! - **Protocol**: one-in-flight command queue and line classification (`protocol`)
//! - **Filtering**: median, stability, jump and rolling-range checks (`filter`)
//! - **Probe**: reader thread with reconnect policy and slope queries (`probe`)
//! - **Dosing**: single-active-dispense coordinator (`coordinator`, `dosage`)
//! - **Scheduling**: interval and pump-triggered auto-dosing (`scheduler`)
//! - **Notifications**: transition/condition alerts with muting (`notify`)
//! - **Observability**: status bus, error flags, health monitor, event log

pub mod config;
pub mod conversions;
pub mod coordinator;
pub mod dosage;
pub mod error;
pub mod event_log;
pub mod events;
pub mod filter;
pub mod framer;
pub mod health;
pub mod hw_error;
pub mod mocks;
pub mod notify;
pub mod probe;
pub mod protocol;
pub mod scheduler;
pub mod status;
pub mod util;
pub mod worker;

pub use config::{LoopPeriods, ReaderPolicy};
pub use coordinator::{
    ActiveDoseInfo, CoordinatorBuilder, DoseTicket, DosingCoordinator, ReadingSource, SharedRelay,
    shared_relay,
};
pub use dosage::{DosageInfo, DoseKind, DosePlan, DoseSource, compute_dosage, plan_dose};
pub use error::{BuildError, DoserError, Report, Result};
pub use event_log::{DoseRecord, EventLog, JsonlEventLog};
pub use events::{EventBus, StatusEvent, StatusSnapshot};
pub use filter::{FilterParams, ReadingFilter, Verdict};
pub use framer::{Framed, LineFramer, MAX_BUFFER_LENGTH};
pub use health::spawn_health_monitor;
pub use hw_error::map_hw_error;
pub use notify::{NotificationSink, NotificationThrottle, NotificationView, StatusState};
pub use probe::{CalibrationLevel, ProbeService, SlopeHealth, slope_health};
pub use protocol::{Command, CommandKind, PROBE_DEVICE, ProbeEvent, ProtocolEngine};
pub use scheduler::{
    AutoDoseState, PumpStateSource, PumpTriggerState, spawn_interval_loop,
    spawn_pump_trigger_loop,
};
pub use status::{ErrorCode, ErrorFlags};
pub use worker::{Shutdown, Worker};
