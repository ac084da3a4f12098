//! Probe service: command queue front-end plus the serial reader thread.
//!
//! The reader owns the link and the line framer. Every pass it re-reads the
//! hot settings, frames whatever bytes arrived, runs them through the
//! `ProtocolEngine` under its lock and then performs the resulting events
//! (writes, alerts, persistence) with the lock released.
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel as xch;
use phdoser_config::{Settings, SettingsProvider, SlopeResult};
use phdoser_traits::{ProbeConnector, ProbeLink};

use crate::config::ReaderPolicy;
use crate::coordinator::ReadingSource;
use crate::error::DoserError;
use crate::events::{EventBus, StatusEvent};
use crate::filter::FilterParams;
use crate::framer::{LineFramer, MAX_BUFFER_LENGTH};
use crate::notify::{NotificationThrottle, StatusState};
use crate::protocol::{Command, CommandKind, PROBE_DEVICE, ProbeEvent, ProtocolEngine};
use crate::status::{ErrorCode, ErrorFlags};
use crate::worker::{Shutdown, Worker};

/// Slopes below this percentage mean the probe needs cleaning or replacing.
pub const MIN_HEALTHY_SLOPE: f64 = 90.0;
/// One read never carries more than the framer holds.
const READ_CHUNK: usize = MAX_BUFFER_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationLevel {
    Low,
    Mid,
    High,
    Clear,
}

impl CalibrationLevel {
    pub fn command(self) -> &'static str {
        match self {
            Self::Low => "Cal,low,4.00",
            Self::Mid => "Cal,mid,7.00",
            Self::High => "Cal,high,10.00",
            Self::Clear => "Cal,clear",
        }
    }
}

impl FromStr for CalibrationLevel {
    type Err = DoserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "mid" => Ok(Self::Mid),
            "high" => Ok(Self::High),
            "clear" => Ok(Self::Clear),
            other => Err(DoserError::Config(format!(
                "unknown calibration level '{other}' (valid: low, mid, high, clear)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlopeHealth {
    pub healthy: bool,
    pub message: String,
}

pub fn slope_health(slope: &SlopeResult) -> SlopeHealth {
    if slope.acid_slope < MIN_HEALTHY_SLOPE || slope.base_slope < MIN_HEALTHY_SLOPE {
        SlopeHealth {
            healthy: false,
            message: format!(
                "Probe needs service: acid slope {:.1}%, base slope {:.1}% (minimum {MIN_HEALTHY_SLOPE:.0}%).",
                slope.acid_slope, slope.base_slope
            ),
        }
    } else {
        SlopeHealth {
            healthy: true,
            message: format!(
                "Probe slopes healthy: acid {:.1}%, base {:.1}%, offset {:.2} mV.",
                slope.acid_slope, slope.base_slope, slope.offset
            ),
        }
    }
}

fn probe_path(settings: &Settings) -> Option<String> {
    settings
        .usb_roles
        .ph_probe
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

struct SlopeWaiter {
    generation: u64,
    tx: xch::Sender<SlopeResult>,
}

struct Inner {
    engine: Mutex<ProtocolEngine>,
    latest: Mutex<Option<f64>>,
    settings: Arc<dyn SettingsProvider>,
    throttle: Arc<NotificationThrottle>,
    flags: Arc<ErrorFlags>,
    bus: EventBus,
    policy: ReaderPolicy,
    waiter: Mutex<Option<SlopeWaiter>>,
    generation: AtomicU64,
}

/// Why a connected session ended.
enum SessionEnd {
    Shutdown,
    Reconnect(String),
}

#[derive(Clone)]
pub struct ProbeService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProbeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeService")
            .field("policy", &self.inner.policy)
            .field("latest", &*self.inner.latest())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn engine(&self) -> MutexGuard<'_, ProtocolEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn latest(&self) -> MutexGuard<'_, Option<f64>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn waiter(&self) -> MutexGuard<'_, Option<SlopeWaiter>> {
        self.waiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self) -> Settings {
        self.settings.load().unwrap_or_else(|e| {
            tracing::warn!(target: "phdoser::probe", error = %e, "settings unavailable; using defaults");
            Settings::default()
        })
    }

    fn comm_status(&self, state: StatusState, message: &str) {
        self.throttle
            .set_status(PROBE_DEVICE, "communication", state, message);
    }

    /// No probe assigned: drop every probe status so nothing stale lingers.
    fn unassigned(&self) {
        *self.latest() = None;
        for key in ["communication", "reading", "ph_value"] {
            self.throttle.clear_status(PROBE_DEVICE, key);
        }
    }

    fn on_connect(&self, link: &mut dyn ProbeLink, path: &str) -> Result<(), String> {
        let cmd = Command::general("C,1");
        {
            let mut engine = self.engine();
            engine.reset_stream();
            engine.mark_sent(cmd.clone());
        }
        *self.latest() = None;
        self.flags.clear(ErrorCode::PhUsbOffline);
        self.comm_status(StatusState::Ok, &format!("Connected to {path}."));
        tracing::info!(target: "phdoser::probe", path, "probe connected; enabling continuous mode");
        link.write(format!("{}\r", cmd.text).as_bytes())
            .map_err(|e| format!("write '{}' failed: {e}", cmd.text))
    }

    fn deliver_slope(&self, slope: SlopeResult) {
        if let Err(e) = self.settings.update(&mut |s: &mut Settings| s.set_probe_slope(slope)) {
            tracing::warn!(target: "phdoser::probe", error = %e, "failed to persist slope");
        }
        match self.waiter().take() {
            Some(w) => {
                let _ = w.tx.try_send(slope);
            }
            None => {
                tracing::debug!(target: "phdoser::probe", ?slope, "slope arrived with no waiter");
            }
        }
    }

    /// Carry out engine output in order. A failed write ends the session.
    /// Returns whether a reading made it through the filter.
    fn perform(&self, events: Vec<ProbeEvent>, link: &mut dyn ProbeLink) -> Result<bool, String> {
        let mut accepted = false;
        for ev in events {
            match ev {
                ProbeEvent::Send(text) => {
                    tracing::debug!(target: "phdoser::probe", command = %text, "sending");
                    link.write(format!("{text}\r").as_bytes())
                        .map_err(|e| format!("write '{text}' failed: {e}"))?;
                }
                ProbeEvent::Condition { key, message } => {
                    self.throttle.report_condition(PROBE_DEVICE, key, &message);
                }
                ProbeEvent::Status {
                    key,
                    state,
                    message,
                } => {
                    if key == "out_of_range" {
                        match state {
                            StatusState::Ok => self.flags.clear(ErrorCode::PhOutOfRange),
                            StatusState::Error => self.flags.set(ErrorCode::PhOutOfRange),
                        };
                    }
                    self.throttle.set_status(PROBE_DEVICE, key, state, &message);
                }
                ProbeEvent::SlopeReceived(slope) => self.deliver_slope(slope),
                ProbeEvent::ReadingAccepted(ph) => {
                    accepted = true;
                    *self.latest() = Some(ph);
                    self.bus.publish(StatusEvent::PhUpdate { ph });
                }
            }
        }
        Ok(accepted)
    }

    fn run(&self, mut connector: Box<dyn ProbeConnector + Send>, shutdown: &Shutdown) {
        let mut failures = 0u32;
        loop {
            if shutdown.is_signalled() {
                return;
            }
            let Some(path) = probe_path(&self.settings()) else {
                self.unassigned();
                if !shutdown.sleep(self.policy.unassigned_poll) {
                    return;
                }
                continue;
            };

            let mut link = match connector.open(&path) {
                Ok(link) => link,
                Err(e) => {
                    failures += 1;
                    self.flags.set(ErrorCode::PhUsbOffline);
                    tracing::warn!(target: "phdoser::probe", path, failures, error = %e, "probe open failed");
                    if failures >= self.policy.max_connect_failures {
                        self.comm_status(
                            StatusState::Error,
                            &format!("Failed to open {path} after {failures} attempts: {e}"),
                        );
                    }
                    if !shutdown.sleep(self.policy.reconnect_delay) {
                        return;
                    }
                    continue;
                }
            };
            failures = 0;

            let end = match self.on_connect(link.as_mut(), &path) {
                Ok(()) => self.session(link.as_mut(), &path, shutdown),
                Err(reason) => SessionEnd::Reconnect(reason),
            };
            drop(link);
            match end {
                SessionEnd::Shutdown => return,
                SessionEnd::Reconnect(reason) => {
                    tracing::warn!(target: "phdoser::probe", path, %reason, "probe link lost; reconnecting");
                    self.flags.set(ErrorCode::PhUsbOffline);
                    self.comm_status(StatusState::Error, &reason);
                    if !shutdown.sleep(self.policy.reconnect_delay) {
                        return;
                    }
                }
            }
        }
    }

    fn session(&self, link: &mut dyn ProbeLink, path: &str, shutdown: &Shutdown) -> SessionEnd {
        let mut framer = LineFramer::new();
        let mut buf = [0u8; READ_CHUNK];
        let mut empty_reads = 0u32;
        let mut read_errors = 0u32;
        let mut framing_ok = true;
        let mut last_reading = Instant::now();
        let mut last_stale_alert: Option<Instant> = None;

        loop {
            if shutdown.is_signalled() {
                return SessionEnd::Shutdown;
            }
            let settings = self.settings();
            if probe_path(&settings).as_deref() != Some(path) {
                return SessionEnd::Reconnect(format!("probe role moved away from {path}"));
            }
            let params = FilterParams::from(&settings);

            let lines = match link.read(&mut buf) {
                Ok(0) => {
                    empty_reads += 1;
                    if empty_reads >= self.policy.empty_read_threshold {
                        return SessionEnd::Reconnect(format!(
                            "{empty_reads} consecutive empty reads"
                        ));
                    }
                    Vec::new()
                }
                Ok(n) => {
                    empty_reads = 0;
                    read_errors = 0;
                    let framed = framer.push(&buf[..n]);
                    if framed.overflowed == framing_ok {
                        framing_ok = !framed.overflowed;
                        if framed.overflowed {
                            tracing::warn!(target: "phdoser::probe", "line buffer overflow; data discarded");
                            self.comm_status(
                                StatusState::Error,
                                "Line buffer overflow; incoming data discarded.",
                            );
                        } else {
                            self.comm_status(StatusState::Ok, "Receiving data.");
                        }
                    }
                    framed.lines
                }
                Err(e) => {
                    read_errors += 1;
                    tracing::warn!(target: "phdoser::probe", read_errors, error = %e, "probe read failed");
                    if read_errors >= self.policy.fatal_error_threshold {
                        return SessionEnd::Reconnect(format!("read failed: {e}"));
                    }
                    Vec::new()
                }
            };

            let now = Instant::now();
            let events = self
                .engine()
                .process(&lines, &params, settings.ph_range, now);
            match self.perform(events, link) {
                Ok(true) => last_reading = now,
                Ok(false) => {}
                Err(reason) => return SessionEnd::Reconnect(reason),
            }

            let silent = now.saturating_duration_since(last_reading);
            let due = last_stale_alert
                .is_none_or(|t| now.saturating_duration_since(t) >= self.policy.stale_after);
            if silent >= self.policy.stale_after && due {
                last_stale_alert = Some(now);
                self.throttle.set_status(
                    PROBE_DEVICE,
                    "reading",
                    StatusState::Error,
                    &format!("No pH reading received for {}s.", silent.as_secs()),
                );
            }
        }
    }
}

impl ProbeService {
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        throttle: Arc<NotificationThrottle>,
        flags: Arc<ErrorFlags>,
        bus: EventBus,
        policy: ReaderPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine: Mutex::new(ProtocolEngine::new()),
                latest: Mutex::new(None),
                settings,
                throttle,
                flags,
                bus,
                policy,
                waiter: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start the reader thread. It runs until the returned `Worker` is dropped.
    pub fn spawn_reader(
        &self,
        connector: impl ProbeConnector + Send + 'static,
    ) -> std::io::Result<Worker> {
        let inner = self.inner.clone();
        let connector: Box<dyn ProbeConnector + Send> = Box::new(connector);
        Worker::spawn_loop("probe-reader", move |shutdown| {
            inner.run(connector, &shutdown);
        })
    }

    pub fn enqueue_command(&self, text: impl Into<String>, kind: CommandKind) {
        self.inner.engine().enqueue(Command::new(text, kind));
    }

    pub fn enqueue_calibration(&self, level: CalibrationLevel) {
        self.enqueue_command(level.command(), CommandKind::Calibration);
    }

    pub fn enqueue_enable_continuous(&self) {
        self.enqueue_command("C,1", CommandKind::General);
    }

    pub fn enqueue_disable_continuous(&self) {
        self.enqueue_command("C,0", CommandKind::General);
    }

    pub fn last_sent_command(&self) -> Option<String> {
        self.inner.engine().last_sent().map(str::to_string)
    }

    /// Ask the probe for its slope and wait for the answer.
    ///
    /// The waiter is single-use: a slope line that arrives after the timeout
    /// (or a second one) finds nobody waiting and is only persisted.
    pub fn query_slope(&self, timeout: Duration) -> Result<SlopeResult, DoserError> {
        if probe_path(&self.inner.settings()).is_none() {
            return Err(DoserError::NoDevice(PROBE_DEVICE.into()));
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = xch::bounded(1);
        *self.inner.waiter() = Some(SlopeWaiter { generation, tx });
        self.enqueue_command("Slope,?", CommandKind::SlopeQuery);

        let res = rx.recv_timeout(timeout);
        {
            let mut w = self.inner.waiter();
            if w.as_ref().is_some_and(|w| w.generation == generation) {
                *w = None;
            }
        }
        res.map_err(|_| {
            tracing::warn!(target: "phdoser::probe", ?timeout, "no slope response");
            DoserError::Timeout
        })
    }

    pub fn slope_timeout(&self) -> Duration {
        self.inner.policy.slope_timeout
    }
}

impl ReadingSource for ProbeService {
    /// Latest accepted reading; `None` while no probe role is assigned.
    fn latest_reading(&self) -> Option<f64> {
        probe_path(&self.inner.settings())?;
        *self.inner.latest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("low", "Cal,low,4.00")]
    #[case("MID", "Cal,mid,7.00")]
    #[case("high", "Cal,high,10.00")]
    #[case("clear", "Cal,clear")]
    fn calibration_levels(#[case] level: &str, #[case] cmd: &str) {
        assert_eq!(level.parse::<CalibrationLevel>().unwrap().command(), cmd);
    }

    #[test]
    fn unknown_level_lists_valid_ones() {
        let err = "medium".parse::<CalibrationLevel>().unwrap_err();
        assert!(err.to_string().contains("low, mid, high, clear"));
    }

    #[test]
    fn slope_health_threshold() {
        let good = SlopeResult {
            acid_slope: 99.7,
            base_slope: 100.3,
            offset: -0.89,
        };
        assert!(slope_health(&good).healthy);
        let worn = SlopeResult {
            acid_slope: 85.0,
            ..good
        };
        let h = slope_health(&worn);
        assert!(!h.healthy);
        assert!(h.message.starts_with("Probe needs service"));
    }
}
