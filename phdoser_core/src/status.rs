//! Hardware error flags surfaced on the status page.
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PhUsbOffline,
    RelayUsbOffline,
    PumpRelayOffline,
    PhOutOfRange,
}

impl ErrorCode {
    pub fn code(self) -> &'static str {
        match self {
            Self::PhUsbOffline => "PH_USB_OFFLINE",
            Self::RelayUsbOffline => "RELAY_USB_OFFLINE",
            Self::PumpRelayOffline => "PUMP_RELAY_OFFLINE",
            Self::PhOutOfRange => "PH_OUT_OF_RANGE",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::PhUsbOffline => "pH probe not found or offline",
            Self::RelayUsbOffline => "Relay device not found or offline",
            Self::PumpRelayOffline => "Dosing pump relay not responding",
            Self::PhOutOfRange => "pH reading is outside configured min/max range",
        }
    }
}

/// Set of currently raised hardware errors.
#[derive(Debug, Default)]
pub struct ErrorFlags {
    raised: Mutex<BTreeSet<ErrorCode>>,
}

impl ErrorFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `code`; returns true if it was not already raised.
    pub fn set(&self, code: ErrorCode) -> bool {
        let newly = self
            .raised
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(code);
        if newly {
            tracing::warn!(code = code.code(), "{}", code.message());
        }
        newly
    }

    /// Clear `code`; returns true if it was raised.
    pub fn clear(&self, code: ErrorCode) -> bool {
        let was = self
            .raised
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&code);
        if was {
            tracing::info!(code = code.code(), "error cleared");
        }
        was
    }

    pub fn is_set(&self, code: ErrorCode) -> bool {
        self.raised
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&code)
    }

    pub fn codes(&self) -> Vec<ErrorCode> {
        self.raised
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Human-readable messages for every raised code.
    pub fn messages(&self) -> Vec<String> {
        self.codes()
            .into_iter()
            .map(|c| c.message().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_report_changes() {
        let f = ErrorFlags::new();
        assert!(f.set(ErrorCode::PhUsbOffline));
        assert!(!f.set(ErrorCode::PhUsbOffline));
        assert_eq!(f.messages(), vec!["pH probe not found or offline"]);
        assert!(f.clear(ErrorCode::PhUsbOffline));
        assert!(!f.clear(ErrorCode::PhUsbOffline));
        assert!(f.codes().is_empty());
    }
}
