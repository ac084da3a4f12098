//! Auto-dose schedulers against a real coordinator with fast pumps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, TimeZone};
use phdoser_config::{MemorySettings, PumpCalibration, PumpTrigger, Settings, SettingsProvider};
use phdoser_core::mocks::{FixedReading, MemoryEventLog, RecordingRelay, StaticPumpState};
use phdoser_core::scheduler::{PumpAction, PumpTriggerState};
use phdoser_core::util::minutes;
use phdoser_core::{
    DosingCoordinator, shared_relay, spawn_interval_loop, spawn_pump_trigger_loop,
};
use serde_json::json;

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn auto_settings() -> Settings {
    Settings {
        auto_dosing_enabled: true,
        pump_calibration: PumpCalibration {
            pump1: 0.001,
            pump2: 0.001,
        },
        pump_trigger: PumpTrigger {
            pump_id: 3,
            dose_delay_min: 0.0,
        },
        ..Settings::default()
    }
}

fn coordinator(settings: Arc<dyn SettingsProvider>, log: &MemoryEventLog) -> Arc<DosingCoordinator> {
    coordinator_reading(settings, log, Arc::new(FixedReading::new(Some(7.0))))
}

fn coordinator_reading(
    settings: Arc<dyn SettingsProvider>,
    log: &MemoryEventLog,
    reading: Arc<FixedReading>,
) -> Arc<DosingCoordinator> {
    Arc::new(
        DosingCoordinator::builder()
            .relay(shared_relay(RecordingRelay::new()))
            .settings(settings)
            .event_log(Arc::new(log.clone()))
            .readings(reading)
            .try_build()
            .unwrap(),
    )
}

fn pump(on: u8) -> serde_json::Value {
    json!({"pump": {"3": {"state": {"value": on}}}})
}

#[test]
fn pump_trigger_doses_once_per_day() {
    let mut t = PumpTriggerState::default();
    let delay = minutes(15.0);
    let at = |d: u32, h: u32, m: u32| Local.with_ymd_and_hms(2025, 6, d, h, m, 0).single().unwrap();

    t.step(true, Some(false), delay, at(1, 8, 0));
    t.step(true, Some(true), delay, at(1, 8, 1));
    assert_eq!(t.step(true, Some(true), delay, at(1, 8, 16)), PumpAction::Dose);
    t.record_dosed(at(1, 8, 16));

    t.step(true, Some(false), delay, at(1, 12, 0));
    assert!(matches!(
        t.step(true, Some(true), delay, at(1, 12, 1)),
        PumpAction::Scheduled(_)
    ));
    assert_eq!(t.step(true, Some(true), delay, at(1, 12, 30)), PumpAction::Idle);

    // New day: the pending schedule is honoured.
    assert_eq!(t.step(true, Some(true), delay, at(2, 0, 1)), PumpAction::Dose);
}

#[test]
fn disabling_auto_dosing_forgets_pump_history() {
    let mut t = PumpTriggerState::default();
    let delay = minutes(1.0);
    let now = Local::now();
    t.step(true, Some(false), delay, now);
    t.step(true, Some(true), delay, now);
    assert!(t.scheduled().is_some());
    assert_eq!(t.step(false, Some(true), delay, now), PumpAction::Idle);
    assert!(t.scheduled().is_none());
    // Without a known previous state, "on" is not an edge.
    assert_eq!(t.step(true, Some(true), delay, now), PumpAction::Idle);
}

#[test]
fn pump_loop_doses_on_rising_edge_only_once() {
    let settings: Arc<dyn SettingsProvider> = Arc::new(MemorySettings::new(auto_settings()));
    let log = MemoryEventLog::new();
    let coord = coordinator(settings.clone(), &log);
    let source = Arc::new(StaticPumpState::new(pump(0)));
    let _loop =
        spawn_pump_trigger_loop(coord.clone(), settings, source.clone(), Duration::from_millis(5))
            .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    assert!(log.records().is_empty());
    source.set(pump(1));
    assert!(wait_until(|| log.records().len() == 1));

    source.set(pump(0));
    std::thread::sleep(Duration::from_millis(30));
    source.set(pump(1));
    std::thread::sleep(Duration::from_millis(100));
    assert!(coord.wait_idle(Duration::from_secs(1)));
    assert_eq!(log.records().len(), 1);
}

#[test]
fn pump_cycle_without_a_dose_leaves_the_day_open() {
    let settings: Arc<dyn SettingsProvider> = Arc::new(MemorySettings::new(auto_settings()));
    let log = MemoryEventLog::new();
    let reading = Arc::new(FixedReading::new(Some(7.4)));
    let coord = coordinator_reading(settings.clone(), &log, reading.clone());
    let source = Arc::new(StaticPumpState::new(pump(0)));
    let _loop =
        spawn_pump_trigger_loop(coord.clone(), settings, source.clone(), Duration::from_millis(5))
            .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    source.set(pump(1));
    // In range: the trigger fires but nothing is dispensed.
    std::thread::sleep(Duration::from_millis(50));
    assert!(log.records().is_empty());

    reading.set(Some(6.5));
    source.set(pump(0));
    std::thread::sleep(Duration::from_millis(30));
    source.set(pump(1));
    assert!(wait_until(|| log.records().len() == 1));
}

#[test]
fn interval_loop_doses_when_due() {
    let settings = Settings {
        dosing_interval: 0.000_01,
        ..auto_settings()
    };
    let settings: Arc<dyn SettingsProvider> = Arc::new(MemorySettings::new(settings));
    let log = MemoryEventLog::new();
    let coord = coordinator(settings.clone(), &log);
    let _loop = spawn_interval_loop(coord.clone(), settings, Duration::from_millis(5)).unwrap();

    assert!(wait_until(|| !log.records().is_empty()));
    let state = coord.auto_state();
    assert!(state.lock().unwrap().last_dose_time.is_some());
}

#[test]
fn interval_loop_idles_while_disabled() {
    let settings = Settings {
        auto_dosing_enabled: false,
        dosing_interval: 0.000_01,
        ..auto_settings()
    };
    let settings: Arc<dyn SettingsProvider> = Arc::new(MemorySettings::new(settings));
    let log = MemoryEventLog::new();
    let coord = coordinator(settings.clone(), &log);
    let worker = spawn_interval_loop(coord.clone(), settings, Duration::from_millis(5)).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    worker.stop();
    assert!(log.records().is_empty());
    assert!(coord.auto_state().lock().unwrap().next_dose_time.is_none());
}
