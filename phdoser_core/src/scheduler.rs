//! Automatic dosing triggers: a fixed interval and a "circulation pump just
//! came on" trigger, limited to one dose per calendar day.
//!
//! Decisions are pure step functions over small state structs; the loop
//! spawners only read settings, call the step and act on its answer.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate};
use phdoser_config::SettingsProvider;
use phdoser_traits::BoxError;
use serde::Serialize;
use serde_json::Value;

use crate::coordinator::DosingCoordinator;
use crate::dosage::{DoseKind, DoseSource};
use crate::util::{hours, minutes};
use crate::worker::Worker;

/// Bookkeeping for automatic dosing, shared with the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AutoDoseState {
    pub last_dose_time: Option<DateTime<Local>>,
    pub last_dose_type: Option<DoseKind>,
    pub last_dose_amount: f64,
    pub next_dose_time: Option<DateTime<Local>>,
    /// Interval (hours) the current `next_dose_time` was computed with.
    pub last_interval: Option<f64>,
}

impl AutoDoseState {
    pub fn record_dose(&mut self, kind: DoseKind, amount_ml: f64, at: DateTime<Local>) {
        self.last_dose_time = Some(at);
        self.last_dose_type = Some(kind);
        self.last_dose_amount = amount_ml;
    }

    /// Forget the schedule; the next enabled tick starts a fresh interval.
    pub fn reset_timer(&mut self) {
        self.next_dose_time = None;
        self.last_interval = None;
    }

    pub fn schedule_next(&mut self, now: DateTime<Local>, interval_h: f64) {
        self.next_dose_time = Some(now + hours(interval_h));
        self.last_interval = Some(interval_h);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalAction {
    Idle,
    Waiting(DateTime<Local>),
    Due,
}

/// One interval-scheduler tick. Disabled or non-positive intervals reset
/// the schedule; an interval change reschedules from `now`.
pub fn interval_tick(
    state: &mut AutoDoseState,
    enabled: bool,
    interval_h: f64,
    now: DateTime<Local>,
) -> IntervalAction {
    if !enabled || interval_h.is_nan() || interval_h <= 0.0 {
        state.reset_timer();
        return IntervalAction::Idle;
    }
    let changed = state
        .last_interval
        .is_some_and(|prev| (prev - interval_h).abs() > f64::EPSILON);
    match state.next_dose_time {
        Some(next) if !changed => {
            if now >= next {
                IntervalAction::Due
            } else {
                IntervalAction::Waiting(next)
            }
        }
        _ => {
            state.schedule_next(now, interval_h);
            IntervalAction::Waiting(now + hours(interval_h))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpAction {
    Idle,
    Scheduled(DateTime<Local>),
    Cancelled,
    Dose,
}

/// Edge detector for the circulation pump trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpTriggerState {
    last_pump_on: Option<bool>,
    scheduled: Option<DateTime<Local>>,
    last_dosed: Option<NaiveDate>,
}

impl PumpTriggerState {
    pub fn scheduled(&self) -> Option<DateTime<Local>> {
        self.scheduled
    }

    pub fn last_dosed(&self) -> Option<NaiveDate> {
        self.last_dosed
    }

    /// Feed one pump observation. `pump_on` is `None` when the state could
    /// not be read; such ticks change nothing.
    pub fn step(
        &mut self,
        enabled: bool,
        pump_on: Option<bool>,
        delay: chrono::Duration,
        now: DateTime<Local>,
    ) -> PumpAction {
        if !enabled {
            self.scheduled = None;
            self.last_pump_on = None;
            return PumpAction::Idle;
        }
        let today = now.date_naive();
        if self.last_dosed.is_some_and(|d| d != today) {
            self.last_dosed = None;
        }
        let Some(on) = pump_on else {
            return PumpAction::Idle;
        };

        let mut action = PumpAction::Idle;
        if self.last_pump_on == Some(false) && on {
            let at = now + delay;
            self.scheduled = Some(at);
            action = PumpAction::Scheduled(at);
        }
        if !on && self.scheduled.is_some() {
            self.scheduled = None;
            action = PumpAction::Cancelled;
        }
        if on
            && self.last_dosed != Some(today)
            && self.scheduled.is_some_and(|at| now >= at)
        {
            self.scheduled = None;
            action = PumpAction::Dose;
        }
        self.last_pump_on = Some(on);
        action
    }

    pub fn record_dosed(&mut self, now: DateTime<Local>) {
        self.last_dosed = Some(now.date_naive());
    }
}

/// Where circulation pump state comes from (an external API or a file).
pub trait PumpStateSource: Send + Sync {
    fn snapshot(&self) -> Result<Value, BoxError>;
}

/// Flatten nested objects/arrays into dotted keys: `{"a":{"b":[1]}}` becomes
/// `{"a.b.0": 1}`.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    fn walk(prefix: &str, v: &Value, out: &mut BTreeMap<String, Value>) {
        let key = |k: &str| {
            if prefix.is_empty() {
                k.to_string()
            } else {
                format!("{prefix}.{k}")
            }
        };
        match v {
            Value::Object(map) => {
                for (k, child) in map {
                    walk(&key(k), child, out);
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    walk(&key(&i.to_string()), child, out);
                }
            }
            leaf => {
                out.insert(prefix.to_string(), leaf.clone());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk("", value, &mut out);
    out
}

/// Read pump `id` (`pump.<id>.state.value`) from a gateway snapshot. Only 0/1 and
/// booleans are understood.
pub fn pump_state(snapshot: &Value, id: u32) -> Option<bool> {
    let flat = flatten(snapshot);
    match flat.get(&format!("pump.{id}.state.value"))? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}

pub fn spawn_interval_loop(
    coordinator: Arc<DosingCoordinator>,
    settings: Arc<dyn SettingsProvider>,
    period: Duration,
) -> std::io::Result<Worker> {
    let state = coordinator.auto_state();
    Worker::spawn_periodic("interval-dosing", period, move || {
        let s = match settings.load() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(target: "phdoser::autodose", error = %e, "interval tick skipped; settings unavailable");
                return;
            }
        };
        let now = Local::now();
        let action = interval_tick(
            &mut state.lock().unwrap_or_else(PoisonError::into_inner),
            s.auto_dosing_enabled,
            s.dosing_interval,
            now,
        );
        if action != IntervalAction::Due {
            return;
        }
        tracing::info!(target: "phdoser::autodose", interval_h = s.dosing_interval, "interval elapsed; checking pH");
        if let Err(e) = coordinator.perform_auto_dose(DoseSource::Interval) {
            tracing::warn!(target: "phdoser::autodose", error = %e, "interval auto-dose failed");
        }
        state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .schedule_next(now, s.dosing_interval);
    })
}

pub fn spawn_pump_trigger_loop(
    coordinator: Arc<DosingCoordinator>,
    settings: Arc<dyn SettingsProvider>,
    source: Arc<dyn PumpStateSource>,
    period: Duration,
) -> std::io::Result<Worker> {
    let trigger = Mutex::new(PumpTriggerState::default());
    Worker::spawn_periodic("pump-trigger", period, move || {
        let s = match settings.load() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(target: "phdoser::autodose", error = %e, "pump tick skipped; settings unavailable");
                return;
            }
        };
        let pump_on = if s.auto_dosing_enabled {
            match source.snapshot() {
                Ok(v) => {
                    let state = pump_state(&v, s.pump_trigger.pump_id);
                    if state.is_none() {
                        tracing::debug!(target: "phdoser::autodose", pump = s.pump_trigger.pump_id, "pump state missing or not 0/1");
                    }
                    state
                }
                Err(e) => {
                    tracing::warn!(target: "phdoser::autodose", error = %e, "reading pump state failed");
                    None
                }
            }
        } else {
            None
        };

        let now = Local::now();
        let mut trig = trigger.lock().unwrap_or_else(PoisonError::into_inner);
        match trig.step(
            s.auto_dosing_enabled,
            pump_on,
            minutes(s.pump_trigger.dose_delay_min),
            now,
        ) {
            PumpAction::Idle => {}
            PumpAction::Scheduled(at) => {
                tracing::info!(target: "phdoser::autodose", at = %at.format("%H:%M:%S"), "pump turned on; dose scheduled");
            }
            PumpAction::Cancelled => {
                tracing::info!(target: "phdoser::autodose", "pump turned off; scheduled dose cancelled");
            }
            PumpAction::Dose => {
                // Only a started dose uses up the day.
                match coordinator.perform_auto_dose(DoseSource::PumpTrigger) {
                    Ok(Some(_)) => trig.record_dosed(now),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(target: "phdoser::autodose", error = %e, "pump-triggered auto-dose failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 1, h, m, 0).single().unwrap()
    }

    #[test]
    fn interval_first_tick_schedules_then_fires() {
        let mut st = AutoDoseState::default();
        assert_eq!(
            interval_tick(&mut st, true, 1.0, at(8, 0)),
            IntervalAction::Waiting(at(9, 0))
        );
        assert!(matches!(interval_tick(&mut st, true, 1.0, at(8, 30)), IntervalAction::Waiting(_)));
        assert_eq!(interval_tick(&mut st, true, 1.0, at(9, 0)), IntervalAction::Due);
    }

    #[test]
    fn interval_change_reschedules_and_disable_resets() {
        let mut st = AutoDoseState::default();
        interval_tick(&mut st, true, 1.0, at(8, 0));
        assert_eq!(
            interval_tick(&mut st, true, 2.0, at(8, 30)),
            IntervalAction::Waiting(at(10, 30))
        );
        assert_eq!(interval_tick(&mut st, false, 2.0, at(8, 31)), IntervalAction::Idle);
        assert!(st.next_dose_time.is_none());
        assert_eq!(interval_tick(&mut st, true, 0.0, at(8, 32)), IntervalAction::Idle);
    }

    #[test]
    fn pump_edge_schedules_after_delay() {
        let mut t = PumpTriggerState::default();
        let delay = minutes(15.0);
        assert_eq!(t.step(true, Some(false), delay, at(8, 0)), PumpAction::Idle);
        assert_eq!(t.step(true, Some(true), delay, at(8, 1)), PumpAction::Scheduled(at(8, 16)));
        assert_eq!(t.step(true, Some(true), delay, at(8, 10)), PumpAction::Idle);
        assert_eq!(t.step(true, Some(true), delay, at(8, 16)), PumpAction::Dose);
        assert!(t.scheduled().is_none());
    }

    #[test]
    fn pump_off_cancels_schedule() {
        let mut t = PumpTriggerState::default();
        let delay = minutes(15.0);
        t.step(true, Some(false), delay, at(8, 0));
        t.step(true, Some(true), delay, at(8, 1));
        assert_eq!(t.step(true, Some(false), delay, at(8, 5)), PumpAction::Cancelled);
        assert_eq!(t.step(true, Some(true), delay, at(8, 20)), PumpAction::Scheduled(at(8, 35)));
    }

    #[test]
    fn unreadable_state_is_ignored() {
        let mut t = PumpTriggerState::default();
        let delay = minutes(0.0);
        t.step(true, Some(false), delay, at(8, 0));
        assert_eq!(t.step(true, None, delay, at(8, 1)), PumpAction::Idle);
        assert_eq!(t.step(true, Some(true), delay, at(8, 2)), PumpAction::Dose);
    }

    #[test]
    fn pump_state_accepts_numbers_and_bools() {
        let v = json!({"pump": {
            "1": {"state": {"value": 1}},
            "2": {"state": {"value": false}},
            "3": {"state": {"value": "on"}}
        }});
        assert_eq!(pump_state(&v, 1), Some(true));
        assert_eq!(pump_state(&v, 2), Some(false));
        assert_eq!(pump_state(&v, 3), None);
        assert_eq!(pump_state(&v, 4), None);
    }

    #[test]
    fn flatten_joins_paths() {
        let flat = flatten(&json!({"a": {"b": [10, {"c": true}]}, "d": null}));
        assert_eq!(flat.get("a.b.0"), Some(&json!(10)));
        assert_eq!(flat.get("a.b.1.c"), Some(&json!(true)));
        assert_eq!(flat.get("d"), Some(&Value::Null));
    }
}
