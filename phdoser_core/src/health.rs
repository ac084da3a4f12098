//! Periodic hardware health check and status snapshot.
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use crate::coordinator::{DosingCoordinator, SharedRelay};
use crate::events::{StatusEvent, StatusSnapshot};
use crate::status::{ErrorCode, ErrorFlags};
use crate::worker::Worker;

/// Probe the relay board and update `RELAY_USB_OFFLINE`. Returns true when
/// the board answered.
pub fn check_relay(relay: &SharedRelay, flags: &ErrorFlags) -> bool {
    let res = relay
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .check();
    match res {
        Ok(()) => {
            flags.clear(ErrorCode::RelayUsbOffline);
            true
        }
        Err(e) => {
            if flags.set(ErrorCode::RelayUsbOffline) {
                tracing::warn!(error = %e, "relay health check failed");
            }
            false
        }
    }
}

pub fn snapshot(coordinator: &DosingCoordinator) -> StatusSnapshot {
    StatusSnapshot {
        ph: coordinator.latest_reading(),
        errors: coordinator.flags().messages(),
        dose: coordinator.query_active_dose(),
    }
}

/// Check the relay every `period` and publish a status snapshot on the bus.
pub fn spawn_health_monitor(
    relay: SharedRelay,
    coordinator: Arc<DosingCoordinator>,
    period: Duration,
) -> std::io::Result<Worker> {
    Worker::spawn_periodic("health", period, move || {
        check_relay(&relay, &coordinator.flags());
        coordinator
            .bus()
            .publish(StatusEvent::Status(snapshot(&coordinator)));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::shared_relay;
    use crate::mocks::RecordingRelay;

    #[test]
    fn relay_flag_follows_check() {
        let rec = RecordingRelay::new();
        let relay = shared_relay(rec.clone());
        let flags = ErrorFlags::new();
        rec.fail_check(true);
        assert!(!check_relay(&relay, &flags));
        assert!(flags.is_set(ErrorCode::RelayUsbOffline));
        rec.fail_check(false);
        assert!(check_relay(&relay, &flags));
        assert!(!flags.is_set(ErrorCode::RelayUsbOffline));
    }
}
