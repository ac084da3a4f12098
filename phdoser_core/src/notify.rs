//! Notification throttle.
//!
//! Two mechanisms share one mute rule (the fifth occurrence inside 24 hours
//! mutes the key for 24 hours):
//! - status transitions per `(device, key)`: alert on ok→error, "cleared" on
//!   error→ok, nothing while staying in error;
//! - condition reports per `(device, condition)`: one alert per report,
//!   skipped while a status with the same key is already in error.
//!
//! Decisions are taken under the state lock; sinks run after it is released.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use phdoser_config::{Settings, SettingsProvider};
use phdoser_traits::{BoxError, Clock};
use serde::Serialize;

use crate::events::{EventBus, StatusEvent};

pub const MUTE_AFTER: usize = 5;
pub const MUTE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

const STATUS_MUTE_SUFFIX: &str =
    "\n[muting this notification for 24 hours due to excessive triggering]";
const CONDITION_MUTE_SUFFIX: &str = "\n[muting this condition for 24 hours due to repeated triggers]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Ok,
    Error,
}

/// Outgoing channel for alert text (Telegram, Discord, ...).
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;
    /// Deliver `text`. Sinks check their own enable flags in `settings`.
    fn send(&self, settings: &Settings, text: &str) -> Result<(), BoxError>;
}

#[derive(Debug, Clone)]
struct Snapshot {
    state: StatusState,
    message: String,
    at: DateTime<Local>,
}

/// Serializable view of one status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationView {
    pub device: String,
    pub key: String,
    pub state: StatusState,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Default)]
struct Tracking {
    occurrences: VecDeque<Instant>,
    muted_until: Option<Instant>,
}

enum Occurrence {
    Muted,
    Send { mutes_now: bool },
}

impl Tracking {
    fn is_muted(&self, now: Instant) -> bool {
        self.muted_until.is_some_and(|until| now < until)
    }

    /// Count one occurrence unless muted. An expired mute is lifted first.
    fn register(&mut self, now: Instant) -> Occurrence {
        if self.is_muted(now) {
            return Occurrence::Muted;
        }
        self.muted_until = None;
        while let Some(&t) = self.occurrences.front() {
            if now.saturating_duration_since(t) >= MUTE_WINDOW {
                self.occurrences.pop_front();
            } else {
                break;
            }
        }
        self.occurrences.push_back(now);
        let mutes_now = self.occurrences.len() == MUTE_AFTER;
        if mutes_now {
            self.muted_until = Some(now + MUTE_WINDOW);
        }
        Occurrence::Send { mutes_now }
    }
}

type Key = (String, String);

#[derive(Default)]
struct ThrottleState {
    snapshots: BTreeMap<Key, Snapshot>,
    status_tracking: HashMap<Key, Tracking>,
    condition_tracking: HashMap<Key, Tracking>,
}

pub struct NotificationThrottle {
    state: Mutex<ThrottleState>,
    sinks: Vec<Box<dyn NotificationSink>>,
    settings: Arc<dyn SettingsProvider>,
    clock: Arc<dyn Clock + Send + Sync>,
    bus: Option<EventBus>,
    broadcast_enabled: AtomicBool,
}

impl std::fmt::Debug for NotificationThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationThrottle")
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("broadcast_enabled", &self.broadcast_enabled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl NotificationThrottle {
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            state: Mutex::new(ThrottleState::default()),
            sinks: Vec::new(),
            settings,
            clock,
            bus: None,
            broadcast_enabled: AtomicBool::new(true),
        }
    }

    pub fn with_sink(mut self, sink: impl NotificationSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Toggle `notifications_update` broadcasts to live observers.
    pub fn set_broadcast_enabled(&self, on: bool) {
        self.broadcast_enabled.store(on, Ordering::Relaxed);
    }

    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the latest state for `(device, key)` and alert on transitions.
    /// Returns the alert text handed to the sinks, if any.
    pub fn set_status(
        &self,
        device: &str,
        key: &str,
        state: StatusState,
        message: &str,
    ) -> Option<String> {
        let now = self.clock.now();
        let k = (device.to_string(), key.to_string());
        let alert = {
            let mut st = self.lock();
            let old = st.snapshots.get(&k).map_or(StatusState::Ok, |s| s.state);
            st.snapshots.insert(
                k.clone(),
                Snapshot {
                    state,
                    message: message.to_string(),
                    at: Local::now(),
                },
            );
            let track = st.status_tracking.entry(k).or_default();
            match (old, state) {
                (StatusState::Error, StatusState::Ok) => {
                    if track.is_muted(now) {
                        tracing::debug!(target: "phdoser::notify", device, key, "muted; skipping cleared notice");
                        None
                    } else {
                        Some(format!("Device={device}, Key={key}\nIssue cleared; now OK."))
                    }
                }
                (StatusState::Ok, StatusState::Error) => match track.register(now) {
                    Occurrence::Muted => {
                        tracing::debug!(target: "phdoser::notify", device, key, "muted; skipping error notice");
                        None
                    }
                    Occurrence::Send { mutes_now } => {
                        let suffix = if mutes_now { STATUS_MUTE_SUFFIX } else { "" };
                        Some(format!("Device={device}, Key={key}\n{message}{suffix}"))
                    }
                },
                _ => None,
            }
        };
        if let Some(text) = &alert {
            self.dispatch(text);
        }
        self.broadcast();
        alert
    }

    /// Drop the snapshot and counters for `(device, key)`.
    pub fn clear_status(&self, device: &str, key: &str) {
        let k = (device.to_string(), key.to_string());
        let removed = {
            let mut st = self.lock();
            st.status_tracking.remove(&k);
            st.snapshots.remove(&k).is_some()
        };
        if removed {
            tracing::debug!(target: "phdoser::notify", device, key, "status cleared");
            self.broadcast();
        }
    }

    pub fn is_active(&self, device: &str, key: &str) -> bool {
        self.lock()
            .snapshots
            .get(&(device.to_string(), key.to_string()))
            .is_some_and(|s| s.state != StatusState::Ok)
    }

    /// One-off condition alert. Returns the text sent, if any.
    pub fn report_condition(&self, device: &str, condition: &str, message: &str) -> Option<String> {
        let now = self.clock.now();
        let k = (device.to_string(), condition.to_string());
        let text = {
            let mut st = self.lock();
            if st.snapshots.get(&k).is_some_and(|s| s.state != StatusState::Ok) {
                tracing::debug!(target: "phdoser::notify", device, condition, "status already active; skipping");
                return None;
            }
            match st.condition_tracking.entry(k).or_default().register(now) {
                Occurrence::Muted => {
                    tracing::debug!(target: "phdoser::notify", device, condition, "condition muted");
                    return None;
                }
                Occurrence::Send { mutes_now } => {
                    let suffix = if mutes_now { CONDITION_MUTE_SUFFIX } else { "" };
                    format!("{device}/{condition}\n{message}{suffix}")
                }
            }
        };
        self.dispatch(&text);
        Some(text)
    }

    pub fn clear_condition(&self, device: &str, condition: &str) {
        self.lock()
            .condition_tracking
            .remove(&(device.to_string(), condition.to_string()));
        tracing::debug!(target: "phdoser::notify", device, condition, "condition counters cleared");
    }

    pub fn all_notifications(&self) -> Vec<NotificationView> {
        self.lock()
            .snapshots
            .iter()
            .map(|((device, key), s)| NotificationView {
                device: device.clone(),
                key: key.clone(),
                state: s.state,
                message: s.message.clone(),
                timestamp: s.at.format("%Y-%m-%d %H:%M:%S").to_string(),
            })
            .collect()
    }

    fn broadcast(&self) {
        let Some(bus) = &self.bus else { return };
        if !self.broadcast_enabled.load(Ordering::Relaxed) {
            return;
        }
        bus.publish(StatusEvent::NotificationsUpdate {
            notifications: self.all_notifications(),
        });
    }

    /// Prefix with the system name and hand to every sink; one failing sink
    /// does not stop the others.
    fn dispatch(&self, text: &str) {
        let settings = self.settings.load().unwrap_or_else(|e| {
            tracing::warn!(target: "phdoser::notify", error = %e, "settings unavailable; using defaults");
            Settings::default()
        });
        let final_text = format!("[{}] {text}", settings.system_name);
        tracing::info!(target: "phdoser::notify", text = %final_text, "notification");
        for sink in &self.sinks {
            if let Err(e) = sink.send(&settings, &final_text) {
                tracing::warn!(target: "phdoser::notify", sink = sink.name(), error = %e, "notification send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::RecordingSink;
    use phdoser_config::MemorySettings;
    use phdoser_traits::clock::test_clock::TestClock;

    fn throttle() -> (NotificationThrottle, RecordingSink, TestClock) {
        let sink = RecordingSink::new();
        let clock = TestClock::new();
        let t = NotificationThrottle::new(
            Arc::new(MemorySettings::default()),
            Arc::new(clock.clone()),
        )
        .with_sink(sink.clone());
        (t, sink, clock)
    }

    #[test]
    fn error_to_error_sends_once() {
        let (t, sink, _) = throttle();
        t.set_status("ph_probe", "communication", StatusState::Error, "down");
        t.set_status("ph_probe", "communication", StatusState::Error, "still down");
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(
            sink.sent()[0],
            "[Garden] Device=ph_probe, Key=communication\ndown"
        );
        let views = t.all_notifications();
        assert_eq!(views[0].message, "still down");
    }

    #[test]
    fn cleared_notice_on_recovery() {
        let (t, sink, _) = throttle();
        t.set_status("relay", "link", StatusState::Error, "gone");
        t.set_status("relay", "link", StatusState::Ok, "back");
        assert_eq!(
            sink.sent()[1],
            "[Garden] Device=relay, Key=link\nIssue cleared; now OK."
        );
        assert!(!t.is_active("relay", "link"));
    }

    #[test]
    fn ok_to_ok_is_silent() {
        let (t, sink, _) = throttle();
        assert!(t.set_status("ph_probe", "reading", StatusState::Ok, "fine").is_none());
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn condition_skipped_while_status_active() {
        let (t, sink, _) = throttle();
        t.set_status("ph_probe", "out_of_range", StatusState::Error, "avg high");
        assert!(t.report_condition("ph_probe", "out_of_range", "again").is_none());
        assert!(t.report_condition("ph_probe", "voltage_issue", "Voltage error: *OV").is_some());
        assert_eq!(sink.sent().len(), 2);
    }

    #[test]
    fn clear_status_resets_counters() {
        let (t, sink, _) = throttle();
        for _ in 0..MUTE_AFTER {
            t.set_status("d", "k", StatusState::Error, "bad");
            t.set_status("d", "k", StatusState::Ok, "good");
        }
        let before = sink.sent().len();
        t.set_status("d", "k", StatusState::Error, "bad");
        assert_eq!(sink.sent().len(), before, "muted");
        t.clear_status("d", "k");
        assert!(t.all_notifications().is_empty());
        t.set_status("d", "k", StatusState::Error, "bad");
        assert_eq!(sink.sent().len(), before + 1);
    }
}
