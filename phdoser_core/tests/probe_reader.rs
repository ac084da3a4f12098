//! Probe reader thread driven by a scripted serial link.

use std::sync::Arc;
use std::time::{Duration, Instant};

use phdoser_config::{JsonFileSettings, MemorySettings, Settings, SettingsProvider, SlopeResult};
use phdoser_core::mocks::{RecordingSink, ScriptedProbe};
use phdoser_core::{
    CalibrationLevel, DoserError, ErrorCode, ErrorFlags, EventBus, NotificationThrottle,
    ProbeService, ReaderPolicy, ReadingSource, StatusEvent,
};
use phdoser_traits::MonotonicClock;
use serde_json::json;

const PORT: &str = "/dev/ttyUSB0";

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

fn fast_policy() -> ReaderPolicy {
    ReaderPolicy {
        reconnect_delay: Duration::from_millis(10),
        unassigned_poll: Duration::from_millis(10),
        empty_read_threshold: 10_000,
        max_connect_failures: 2,
        ..ReaderPolicy::default()
    }
}

fn assigned_settings() -> Settings {
    let mut s = Settings::default();
    s.usb_roles.ph_probe = Some(PORT.into());
    s.ph_median_window = 1;
    s
}

struct Rig {
    service: ProbeService,
    sink: RecordingSink,
    flags: Arc<ErrorFlags>,
    bus: EventBus,
}

fn rig(settings: Arc<dyn SettingsProvider>) -> Rig {
    rig_with(settings, fast_policy())
}

fn rig_with(settings: Arc<dyn SettingsProvider>, policy: ReaderPolicy) -> Rig {
    let sink = RecordingSink::new();
    let bus = EventBus::new();
    let throttle = Arc::new(
        NotificationThrottle::new(settings.clone(), Arc::new(MonotonicClock::new()))
            .with_sink(sink.clone()),
    );
    let flags = Arc::new(ErrorFlags::new());
    let service = ProbeService::new(settings, throttle, flags.clone(), bus.clone(), policy);
    Rig {
        service,
        sink,
        flags,
        bus,
    }
}

#[test]
fn connect_enables_continuous_mode_and_accepts_readings() {
    let r = rig(Arc::new(MemorySettings::new(assigned_settings())));
    let updates = r.bus.subscribe();
    let probe = ScriptedProbe::new();
    probe.push("*OK\r");
    probe.push("7.100\r7.1");
    probe.push("20\r");
    let _reader = r.service.spawn_reader(probe.clone()).unwrap();

    assert!(wait_until(|| r.service.latest_reading() == Some(7.12)));
    assert_eq!(probe.opens(), vec![PORT.to_string()]);
    assert_eq!(probe.written().first().map(String::as_str), Some("C,1"));
    assert_eq!(
        updates.recv_timeout(Duration::from_secs(1)).unwrap(),
        StatusEvent::PhUpdate { ph: 7.1 }
    );
    assert!(!r.flags.is_set(ErrorCode::PhUsbOffline));
}

#[test]
fn queued_commands_go_out_one_at_a_time() {
    let r = rig(Arc::new(MemorySettings::new(assigned_settings())));
    let probe = ScriptedProbe::new();
    r.service.enqueue_calibration(CalibrationLevel::Mid);
    r.service.enqueue_disable_continuous();
    let _reader = r.service.spawn_reader(probe.clone()).unwrap();

    assert!(wait_until(|| probe.written().len() == 1));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(probe.written(), vec!["C,1"]);

    probe.push("*OK\r");
    assert!(wait_until(|| probe.written().len() == 2));
    assert_eq!(probe.written()[1], "Cal,mid,7.00");
    probe.push("*ER\r");
    assert!(wait_until(|| probe.written().len() == 3));
    assert_eq!(probe.written()[2], "C,0");
    assert_eq!(r.service.last_sent_command().as_deref(), Some("C,0"));
    assert!(wait_until(|| r
        .sink
        .sent()
        .iter()
        .any(|t| t.contains("Error response for command 'Cal,mid,7.00'"))));
}

#[test]
fn slope_answer_is_returned_and_persisted_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    let store = JsonFileSettings::new(&path);
    store.save(&assigned_settings()).unwrap();
    let r = rig(Arc::new(store));

    let probe = ScriptedProbe::new();
    probe.push("*OK\r");
    let _reader = r.service.spawn_reader(probe.clone()).unwrap();

    let feeder = {
        let probe = probe.clone();
        std::thread::spawn(move || {
            assert!(wait_until(|| probe.written().iter().any(|c| c == "Slope,?")));
            probe.push("?SLOPE,98.0,97.5,-4.2\r");
        })
    };
    let slope = r.service.query_slope(Duration::from_secs(5)).unwrap();
    feeder.join().unwrap();
    assert_eq!(
        slope,
        SlopeResult {
            acid_slope: 98.0,
            base_slope: 97.5,
            offset: -4.2
        }
    );

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(
        saved["calibration"]["ph_probe"]["slope"],
        json!({"acid_slope": 98.0, "base_slope": 97.5, "offset": -4.2})
    );
}

#[test]
fn slope_query_times_out_without_answer() {
    let r = rig(Arc::new(MemorySettings::new(assigned_settings())));
    let err = r
        .service
        .query_slope(Duration::from_millis(50))
        .unwrap_err();
    assert_eq!(err, DoserError::Timeout);
}

#[test]
fn unassigned_probe_has_no_reading_and_no_slope() {
    let r = rig(Arc::new(MemorySettings::default()));
    let probe = ScriptedProbe::new();
    let _reader = r.service.spawn_reader(probe.clone()).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(probe.opens().is_empty());
    assert_eq!(r.service.latest_reading(), None);
    assert!(matches!(
        r.service.query_slope(Duration::from_millis(10)),
        Err(DoserError::NoDevice(_))
    ));
}

#[test]
fn open_failures_escalate_then_recover() {
    let r = rig(Arc::new(MemorySettings::new(assigned_settings())));
    let probe = ScriptedProbe::new();
    probe.fail_next_opens(2);
    let _reader = r.service.spawn_reader(probe.clone()).unwrap();

    assert!(wait_until(|| probe.opens().len() >= 3 && probe.written().len() == 1));
    let sent = r.sink.sent();
    assert!(
        sent.iter()
            .any(|t| t.contains("Key=communication") && t.contains("after 2 attempts")),
        "{sent:?}"
    );
    assert!(wait_until(|| !r.flags.is_set(ErrorCode::PhUsbOffline)));
}

#[test]
fn read_errors_force_a_reconnect() {
    let r = rig(Arc::new(MemorySettings::new(assigned_settings())));
    let probe = ScriptedProbe::new();
    probe.fail_next_reads(2);
    let _reader = r.service.spawn_reader(probe.clone()).unwrap();
    assert!(wait_until(|| probe.opens().len() >= 2));
    // Continuous mode is re-enabled on the new connection.
    assert!(wait_until(|| probe.written().iter().filter(|c| *c == "C,1").count() >= 2));
}

#[test]
fn burst_of_complete_lines_is_not_an_overflow() {
    let r = rig(Arc::new(MemorySettings::new(assigned_settings())));
    let probe = ScriptedProbe::new();
    probe.push("*OK\r");
    probe.push("7.100\r".repeat(20));
    let _reader = r.service.spawn_reader(probe.clone()).unwrap();

    assert!(wait_until(|| r.service.latest_reading() == Some(7.1)));
    std::thread::sleep(Duration::from_millis(50));
    let sent = r.sink.sent();
    assert!(!sent.iter().any(|t| t.contains("overflow")), "{sent:?}");
}

#[test]
fn unterminated_flood_reports_overflow() {
    let r = rig(Arc::new(MemorySettings::new(assigned_settings())));
    let probe = ScriptedProbe::new();
    probe.push("x".repeat(150));
    let _reader = r.service.spawn_reader(probe.clone()).unwrap();

    assert!(wait_until(|| r.sink.sent().iter().any(|t| {
        t.contains("Key=communication") && t.contains("Line buffer overflow")
    })));
    // The stream recovers on the next clean line.
    probe.push("\r7.300\r");
    assert!(wait_until(|| r.service.latest_reading() == Some(7.3)));
}

#[test]
fn empty_reads_force_a_reconnect() {
    let policy = ReaderPolicy {
        empty_read_threshold: 3,
        ..fast_policy()
    };
    let r = rig_with(Arc::new(MemorySettings::new(assigned_settings())), policy);
    let probe = ScriptedProbe::new();
    let _reader = r.service.spawn_reader(probe.clone()).unwrap();

    assert!(wait_until(|| probe.opens().len() >= 2));
    assert!(wait_until(|| r
        .sink
        .sent()
        .iter()
        .any(|t| t.contains("consecutive empty reads"))));
}

#[test]
fn silence_raises_stale_reading_alert() {
    let policy = ReaderPolicy {
        stale_after: Duration::from_millis(50),
        ..fast_policy()
    };
    let r = rig_with(Arc::new(MemorySettings::new(assigned_settings())), policy);
    let probe = ScriptedProbe::new();
    let _reader = r.service.spawn_reader(probe.clone()).unwrap();

    assert!(wait_until(|| r
        .sink
        .sent()
        .iter()
        .any(|t| t.contains("Key=reading") && t.contains("No pH reading received"))));
}

#[test]
fn rejected_readings_do_not_hold_off_stale_alert() {
    let policy = ReaderPolicy {
        stale_after: Duration::from_millis(80),
        ..fast_policy()
    };
    let r = rig_with(Arc::new(MemorySettings::new(assigned_settings())), policy);
    let probe = ScriptedProbe::new();
    let _reader = r.service.spawn_reader(probe.clone()).unwrap();

    // Keep the line busy with values the filter throws away.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut stale = false;
    while Instant::now() < deadline {
        probe.push("14.000\r");
        std::thread::sleep(Duration::from_millis(5));
        if r.sink.sent().iter().any(|t| t.contains("No pH reading received")) {
            stale = true;
            break;
        }
    }
    assert!(stale, "{:?}", r.sink.sent());
    assert_eq!(r.service.latest_reading(), None);
}
