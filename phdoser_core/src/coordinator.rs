//! Dosing coordinator.
//!
//! At most one dispense runs at a time, whichever path asked for it (manual,
//! interval, pump trigger). Start and stop are serialized against each other;
//! starting a new dose cancels the running one, waits for its relay-off
//! cleanup, then forces its port off before the new pump is switched on.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam_channel as xch;
use phdoser_config::{Settings, SettingsProvider};
use phdoser_traits::RelayDriver;
use serde::Serialize;

use crate::dosage::{DoseKind, DosePlan, DoseSource, compute_dosage, plan_dose};
use crate::error::{BuildError, DoserError};
use crate::event_log::{DoseRecord, EventLog};
use crate::events::{EventBus, StatusEvent};
use crate::hw_error::map_hw_error;
use crate::scheduler::AutoDoseState;
use crate::status::{ErrorCode, ErrorFlags};

/// Relay driver shared between the coordinator and the health monitor.
pub type SharedRelay = Arc<Mutex<Box<dyn RelayDriver + Send>>>;

pub fn shared_relay(relay: impl RelayDriver + Send + 'static) -> SharedRelay {
    Arc::new(Mutex::new(Box::new(relay)))
}

/// Source of the latest accepted pH reading.
pub trait ReadingSource: Send + Sync {
    fn latest_reading(&self) -> Option<f64>;
}

/// Snapshot of the running dose for status displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ActiveDoseInfo {
    pub active: bool,
    #[serde(rename = "type")]
    pub kind: Option<DoseKind>,
    pub amount: f64,
    pub remaining_seconds: f64,
}

/// Identifies a started dispense.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoseTicket {
    pub id: u64,
    pub plan: DosePlan,
}

struct ActiveDose {
    id: u64,
    plan: DosePlan,
    started_at: Instant,
    cancel_tx: xch::Sender<()>,
    done_rx: xch::Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    relay: SharedRelay,
    settings: Arc<dyn SettingsProvider>,
    event_log: Arc<dyn EventLog>,
    bus: EventBus,
    flags: Arc<ErrorFlags>,
    readings: Option<Arc<dyn ReadingSource>>,
    auto_state: Arc<Mutex<AutoDoseState>>,
    active: Mutex<Option<ActiveDose>>,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, Option<ActiveDose>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn switch(&self, port: u8, on: bool) -> Result<(), DoserError> {
        let mut relay = self.relay.lock().unwrap_or_else(PoisonError::into_inner);
        let res = if on {
            relay.turn_on(port)
        } else {
            relay.turn_off(port)
        };
        drop(relay);
        match res {
            Ok(()) => {
                self.flags.clear(ErrorCode::PumpRelayOffline);
                Ok(())
            }
            Err(e) => {
                self.flags.set(ErrorCode::PumpRelayOffline);
                tracing::error!(target: "phdoser::dosing", port, on, error = %e, "relay command failed");
                Err(map_hw_error(&*e))
            }
        }
    }

    /// Turn `port` off without touching the error flags.
    fn off_best_effort(&self, port: u8) {
        let res = self
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .turn_off(port);
        if let Err(e) = res {
            tracing::debug!(target: "phdoser::dosing", port, error = %e, "cleanup relay off failed");
        }
    }

    fn latest_reading(&self) -> Option<f64> {
        self.readings.as_ref().and_then(|r| r.latest_reading())
    }

    /// Clear the active record only if it still belongs to task `id`.
    fn finish(&self, id: u64) {
        let mut active = self.active();
        if active.as_ref().is_some_and(|a| a.id == id) {
            *active = None;
        }
    }
}

/// Turns the port off when dropped unless `release` already did.
struct RelayOffGuard<'a> {
    shared: &'a Shared,
    port: u8,
    armed: bool,
}

impl RelayOffGuard<'_> {
    fn release(mut self) -> Result<(), DoserError> {
        self.armed = false;
        self.shared.switch(self.port, false)
    }
}

impl Drop for RelayOffGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.shared.switch(self.port, false);
        }
    }
}

enum Outcome {
    Completed,
    Cancelled,
}

struct DoseTask {
    id: u64,
    plan: DosePlan,
    source: DoseSource,
    shared: Arc<Shared>,
    cancel_rx: xch::Receiver<()>,
    _done_tx: xch::Sender<()>,
}

impl DoseTask {
    fn run(self) {
        let sh = &self.shared;
        let plan = self.plan;
        sh.bus.publish(StatusEvent::DoseStart {
            kind: plan.kind,
            amount: plan.amount_ml,
            duration: plan.duration.as_secs_f64(),
            source: self.source,
        });
        tracing::info!(
            target: "phdoser::dosing",
            kind = %plan.kind,
            amount_ml = plan.amount_ml,
            port = plan.relay_port,
            secs = plan.duration.as_secs_f64(),
            source = ?self.source,
            "dispense started"
        );

        match self.dispense() {
            Ok(Outcome::Completed) => {
                let record = DoseRecord::now(sh.latest_reading(), plan.kind, plan.amount_ml);
                if let Err(e) = sh.event_log.record(&record) {
                    tracing::warn!(target: "phdoser::dosing", error = %e, "failed to log dose");
                }
                {
                    let mut st = sh.auto_state.lock().unwrap_or_else(PoisonError::into_inner);
                    st.record_dose(plan.kind, plan.amount_ml, Local::now());
                    if self.source == DoseSource::Manual {
                        st.next_dose_time = None;
                    }
                }
                tracing::info!(target: "phdoser::dosing", kind = %plan.kind, amount_ml = plan.amount_ml, "dispense complete");
                sh.bus.publish(StatusEvent::DoseComplete {
                    kind: plan.kind,
                    amount: plan.amount_ml,
                });
            }
            Ok(Outcome::Cancelled) => {
                tracing::info!(target: "phdoser::dosing", kind = %plan.kind, "dispense cancelled");
                sh.bus.publish(StatusEvent::DoseStopped { kind: plan.kind });
            }
            Err(e) => {
                tracing::error!(target: "phdoser::dosing", kind = %plan.kind, error = %e, "dispense failed");
                sh.bus.publish(StatusEvent::DoseError {
                    kind: plan.kind,
                    error: e.to_string(),
                });
            }
        }
        sh.finish(self.id);
    }

    fn dispense(&self) -> Result<Outcome, DoserError> {
        let port = self.plan.relay_port;
        if let Err(e) = self.shared.switch(port, true) {
            self.shared.off_best_effort(port);
            return Err(e);
        }
        let guard = RelayOffGuard {
            shared: &self.shared,
            port,
            armed: true,
        };
        let cancelled = !matches!(
            self.cancel_rx.recv_timeout(self.plan.duration),
            Err(xch::RecvTimeoutError::Timeout)
        );
        guard.release()?;
        Ok(if cancelled {
            Outcome::Cancelled
        } else {
            Outcome::Completed
        })
    }
}

pub struct DosingCoordinator {
    shared: Arc<Shared>,
    op_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for DosingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DosingCoordinator")
            .field("active", &self.query_active_dose())
            .finish_non_exhaustive()
    }
}

impl DosingCoordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn flags(&self) -> Arc<ErrorFlags> {
        self.shared.flags.clone()
    }

    pub fn auto_state(&self) -> Arc<Mutex<AutoDoseState>> {
        self.shared.auto_state.clone()
    }

    pub fn latest_reading(&self) -> Option<f64> {
        self.shared.latest_reading()
    }

    fn load_settings(&self) -> Result<Settings, DoserError> {
        self.shared
            .settings
            .load()
            .map_err(|e| DoserError::Config(format!("{e:#}")))
    }

    /// Start a dispense, cancelling whatever is running. Rejected without side
    /// effects when the computed run time is not positive.
    pub fn start_dispense(
        &self,
        kind: DoseKind,
        amount_ml: f64,
        source: DoseSource,
    ) -> Result<DoseTicket, DoserError> {
        let settings = self.load_settings()?;
        let plan = plan_dose(&settings, kind, amount_ml)?;

        let _op = self.op_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cancel_active();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel_tx, cancel_rx) = xch::bounded(1);
        let (done_tx, done_rx) = xch::bounded::<()>(0);
        let task = DoseTask {
            id,
            plan,
            source,
            shared: self.shared.clone(),
            cancel_rx,
            _done_tx: done_tx,
        };

        let mut active = self.shared.active();
        let handle = std::thread::Builder::new()
            .name(format!("dose-{id}"))
            .spawn(move || task.run())
            .map_err(|e| DoserError::State(format!("failed to spawn dose task: {e}")))?;
        *active = Some(ActiveDose {
            id,
            plan,
            started_at: Instant::now(),
            cancel_tx,
            done_rx,
            handle: Some(handle),
        });
        Ok(DoseTicket { id, plan })
    }

    /// Cancel the running dose (if any) and switch both pump ports off.
    /// Returns the kind of the dose that was cancelled.
    pub fn stop_dispense(&self) -> Option<DoseKind> {
        let _op = self.op_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let stopped = self.cancel_active();
        let ports = self
            .load_settings()
            .map(|s| s.relay_ports)
            .unwrap_or_default();
        for port in [ports.ph_up, ports.ph_down] {
            if let Err(e) = self.shared.switch(port, false) {
                tracing::warn!(target: "phdoser::dosing", port, error = %e, "safety-net relay off failed");
            }
        }
        stopped
    }

    /// Signal, join and force off the active task. Caller holds `op_lock`.
    fn cancel_active(&self) -> Option<DoseKind> {
        let taken = self.shared.active().take();
        let mut a = taken?;
        let _ = a.cancel_tx.try_send(());
        if let Some(h) = a.handle.take() {
            if h.join().is_err() {
                tracing::warn!(target: "phdoser::dosing", id = a.id, "dose task panicked");
            }
        }
        if let Err(e) = self.shared.switch(a.plan.relay_port, false) {
            tracing::warn!(target: "phdoser::dosing", port = a.plan.relay_port, error = %e, "forced relay off failed");
        }
        Some(a.plan.kind)
    }

    pub fn query_active_dose(&self) -> ActiveDoseInfo {
        let active = self.shared.active();
        match active.as_ref() {
            Some(a) => {
                let elapsed = a.started_at.elapsed();
                ActiveDoseInfo {
                    active: true,
                    kind: Some(a.plan.kind),
                    amount: a.plan.amount_ml,
                    remaining_seconds: a.plan.duration.saturating_sub(elapsed).as_secs_f64(),
                }
            }
            None => ActiveDoseInfo::default(),
        }
    }

    /// Block until no dose is running or `timeout` passes. Returns true when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let done_rx = match self.shared.active().as_ref() {
                Some(a) => a.done_rx.clone(),
                None => return true,
            };
            let left = deadline.saturating_duration_since(Instant::now());
            match done_rx.recv_timeout(left) {
                Err(xch::RecvTimeoutError::Timeout) => return false,
                _ => {
                    // The task may still be clearing its record; yield briefly.
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    /// Dose up below `min`, down above `max`, otherwise nothing.
    pub fn decide_and_dose(
        &self,
        ph: f64,
        min: f64,
        max: f64,
        up_ml: f64,
        down_ml: f64,
        source: DoseSource,
    ) -> Result<Option<DoseTicket>, DoserError> {
        if ph < min && up_ml > 0.0 {
            self.start_dispense(DoseKind::Up, up_ml, source).map(Some)
        } else if ph > max && down_ml > 0.0 {
            self.start_dispense(DoseKind::Down, down_ml, source).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Size and start a corrective dose from the latest reading.
    pub fn perform_auto_dose(&self, source: DoseSource) -> Result<Option<DoseTicket>, DoserError> {
        let Some(ph) = self.latest_reading() else {
            tracing::info!(target: "phdoser::autodose", "no pH reading available; skipping auto-dose");
            return Ok(None);
        };
        let settings = self.load_settings()?;
        let info = compute_dosage(&settings, Some(ph));
        let range = settings.ph_range;
        let ticket = self.decide_and_dose(
            ph,
            range.min,
            range.max,
            info.ph_up_amount,
            info.ph_down_amount,
            source,
        )?;
        match &ticket {
            Some(t) => tracing::info!(
                target: "phdoser::autodose",
                ph,
                kind = %t.plan.kind,
                amount_ml = t.plan.amount_ml,
                "auto-dose dispensing"
            ),
            None => tracing::info!(
                target: "phdoser::autodose",
                ph,
                min = range.min,
                max = range.max,
                "pH within range; no auto-dose"
            ),
        }
        Ok(ticket)
    }
}

impl Drop for DosingCoordinator {
    fn drop(&mut self) {
        let _op = self.op_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cancel_active();
    }
}

#[derive(Default)]
pub struct CoordinatorBuilder {
    relay: Option<SharedRelay>,
    settings: Option<Arc<dyn SettingsProvider>>,
    event_log: Option<Arc<dyn EventLog>>,
    bus: Option<EventBus>,
    flags: Option<Arc<ErrorFlags>>,
    readings: Option<Arc<dyn ReadingSource>>,
    auto_state: Option<Arc<Mutex<AutoDoseState>>>,
}

impl CoordinatorBuilder {
    pub fn relay(mut self, relay: SharedRelay) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn flags(mut self, flags: Arc<ErrorFlags>) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn readings(mut self, readings: Arc<dyn ReadingSource>) -> Self {
        self.readings = Some(readings);
        self
    }

    pub fn auto_state(mut self, state: Arc<Mutex<AutoDoseState>>) -> Self {
        self.auto_state = Some(state);
        self
    }

    pub fn try_build(self) -> Result<DosingCoordinator, BuildError> {
        let relay = self.relay.ok_or(BuildError::MissingRelay)?;
        let settings = self.settings.ok_or(BuildError::MissingSettings)?;
        let event_log = self.event_log.ok_or(BuildError::MissingEventLog)?;
        Ok(DosingCoordinator {
            shared: Arc::new(Shared {
                relay,
                settings,
                event_log,
                bus: self.bus.unwrap_or_default(),
                flags: self.flags.unwrap_or_default(),
                readings: self.readings,
                auto_state: self.auto_state.unwrap_or_default(),
                active: Mutex::new(None),
            }),
            op_lock: Mutex::new(()),
            next_id: AtomicU64::new(0),
        })
    }
}
