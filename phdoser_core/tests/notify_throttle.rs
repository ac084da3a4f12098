//! Mute arithmetic for status transitions and condition reports.

use std::sync::Arc;
use std::time::Duration;

use phdoser_config::{MemorySettings, Settings};
use phdoser_core::mocks::RecordingSink;
use phdoser_core::{EventBus, NotificationThrottle, StatusEvent, StatusState};
use phdoser_traits::clock::test_clock::TestClock;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn throttle(name: &str) -> (NotificationThrottle, RecordingSink, TestClock) {
    let sink = RecordingSink::new();
    let clock = TestClock::new();
    let settings = Settings {
        system_name: name.into(),
        ..Settings::default()
    };
    let t = NotificationThrottle::new(
        Arc::new(MemorySettings::new(settings)),
        Arc::new(clock.clone()),
    )
    .with_sink(sink.clone());
    (t, sink, clock)
}

fn errors(sink: &RecordingSink) -> Vec<String> {
    sink.sent()
        .into_iter()
        .filter(|t| !t.contains("Issue cleared"))
        .collect()
}

#[test]
fn fifth_transition_mutes_for_a_day() {
    let (t, sink, clock) = throttle("Pool");
    for _ in 0..5 {
        t.set_status("relay", "usb", StatusState::Error, "relay missing");
        clock.advance(Duration::from_secs(60));
        t.set_status("relay", "usb", StatusState::Ok, "relay back");
        clock.advance(Duration::from_secs(60));
    }
    let sent = errors(&sink);
    assert_eq!(sent.len(), 5);
    assert!(sent[..4].iter().all(|m| !m.contains("muting")));
    assert!(sent[4].ends_with("[muting this notification for 24 hours due to excessive triggering]"));
    assert!(sent[4].starts_with("[Pool] Device=relay, Key=usb\nrelay missing"));
    // The recovery after the muting transition is silent too.
    assert_eq!(sink.sent().len(), 9);

    assert_eq!(
        t.set_status("relay", "usb", StatusState::Error, "relay missing"),
        None
    );
    assert_eq!(sink.sent().len(), 9);
    // Snapshots still track the latest state while muted.
    assert!(t.is_active("relay", "usb"));

    clock.advance(DAY);
    t.set_status("relay", "usb", StatusState::Ok, "relay back");
    let text = t
        .set_status("relay", "usb", StatusState::Error, "relay missing")
        .unwrap();
    assert_eq!(text, "Device=relay, Key=usb\nrelay missing");
    assert_eq!(
        sink.sent().last().map(String::as_str),
        Some("[Pool] Device=relay, Key=usb\nrelay missing")
    );
}

#[test]
fn occurrences_older_than_a_day_do_not_count() {
    let (t, sink, clock) = throttle("Garden");
    for _ in 0..8 {
        t.set_status("ph_probe", "reading", StatusState::Error, "silent");
        t.set_status("ph_probe", "reading", StatusState::Ok, "ok");
        clock.advance(DAY / 4);
    }
    assert!(errors(&sink).iter().all(|m| !m.contains("muting")));
}

#[test]
fn conditions_mute_independently() {
    let (t, sink, clock) = throttle("Garden");
    let sent: Vec<Option<String>> = (0..6)
        .map(|_| {
            clock.advance(Duration::from_secs(1));
            t.report_condition("ph_probe", "unrealistic_reading", "Unrealistic pH: 0")
        })
        .collect();
    assert!(sent[..5].iter().all(Option::is_some));
    assert!(
        sent[4]
            .as_deref()
            .unwrap()
            .ends_with("[muting this condition for 24 hours due to repeated triggers]")
    );
    assert!(sent[5].is_none());
    assert_eq!(sink.sent().len(), 5);

    // Another condition on the same device is unaffected.
    assert!(
        t.report_condition("ph_probe", "voltage_issue", "Voltage error: *OV")
            .is_some()
    );

    clock.advance(DAY);
    assert!(
        t.report_condition("ph_probe", "unrealistic_reading", "Unrealistic pH: 0")
            .is_some()
    );
}

#[test]
fn failing_sink_does_not_block_the_next_one() {
    let broken = RecordingSink::failing();
    let good = RecordingSink::new();
    let t = NotificationThrottle::new(
        Arc::new(MemorySettings::default()),
        Arc::new(TestClock::new()),
    )
    .with_sink(broken.clone())
    .with_sink(good.clone());
    t.report_condition("ph_probe", "command_error", "Error response for command 'C,1'");
    assert_eq!(broken.sent().len(), 1);
    assert_eq!(
        good.sent(),
        vec!["[Garden] ph_probe/command_error\nError response for command 'C,1'"]
    );
}

#[test]
fn broadcasts_follow_the_enable_flag() {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let t = NotificationThrottle::new(
        Arc::new(MemorySettings::default()),
        Arc::new(TestClock::new()),
    )
    .with_bus(bus);
    t.set_status("ph_probe", "communication", StatusState::Ok, "Connected.");
    match rx.try_recv().unwrap() {
        StatusEvent::NotificationsUpdate { notifications } => {
            assert_eq!(notifications.len(), 1);
            assert_eq!(notifications[0].key, "communication");
        }
        other => panic!("unexpected {other:?}"),
    }
    t.set_broadcast_enabled(false);
    t.set_status("ph_probe", "communication", StatusState::Error, "Lost.");
    assert!(rx.try_recv().is_err());
}
