//! Status bus for live observers.
//!
//! Every subscriber gets its own unbounded crossbeam channel; publishing never
//! blocks and subscribers that hung up are dropped on the next publish.
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel as xch;
use serde::Serialize;

use crate::dosage::{DoseKind, DoseSource};
use crate::notify::NotificationView;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    PhUpdate {
        ph: f64,
    },
    DoseStart {
        #[serde(rename = "type")]
        kind: DoseKind,
        amount: f64,
        duration: f64,
        source: DoseSource,
    },
    DoseComplete {
        #[serde(rename = "type")]
        kind: DoseKind,
        amount: f64,
    },
    DoseError {
        #[serde(rename = "type")]
        kind: DoseKind,
        error: String,
    },
    DoseStopped {
        #[serde(rename = "type")]
        kind: DoseKind,
    },
    NotificationsUpdate {
        notifications: Vec<NotificationView>,
    },
    Status(StatusSnapshot),
}

/// Periodic summary pushed by the health monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub ph: Option<f64>,
    pub errors: Vec<String>,
    pub dose: crate::coordinator::ActiveDoseInfo,
}

#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<xch::Sender<StatusEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> xch::Receiver<StatusEvent> {
        let (tx, rx) = xch::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: StatusEvent) {
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_and_prune_dropped_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(StatusEvent::PhUpdate { ph: 7.4 });
        assert_eq!(a.try_recv().unwrap(), StatusEvent::PhUpdate { ph: 7.4 });
        assert_eq!(b.try_recv().unwrap(), StatusEvent::PhUpdate { ph: 7.4 });
        drop(b);
        bus.publish(StatusEvent::PhUpdate { ph: 7.5 });
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn events_serialize_with_tag() {
        let ev = StatusEvent::DoseComplete {
            kind: DoseKind::Up,
            amount: 2.5,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "dose_complete");
        assert_eq!(v["type"], "up");
    }
}
