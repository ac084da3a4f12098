//! Maps `Box<dyn Error>` from trait boundaries to typed `DoserError`.
//!
//! The traits in `phdoser_traits` use `Box<dyn Error + Send + Sync>`; this
//! module converts those to our typed error enum, with an optional
//! feature-gated path for `phdoser_hardware::HwError` downcasting.

use crate::error::DoserError;

/// Map a trait-boundary error to a typed `DoserError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to string-based heuristics.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> DoserError {
    #[cfg(feature = "hardware-errors")]
    {
        use phdoser_hardware::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::Timeout => DoserError::Timeout,
                HwError::NoDevice(role) => DoserError::NoDevice((*role).to_string()),
                HwError::Io(io) => DoserError::Io(io.to_string()),
                other => DoserError::HardwareFault(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") || s.to_lowercase().contains("timed out") {
        DoserError::Timeout
    } else {
        DoserError::Hardware(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_fallback_detects_timeouts() {
        let e = std::io::Error::other("read timed out");
        assert_eq!(map_hw_error(&e), DoserError::Timeout);
        let e = std::io::Error::other("port vanished");
        assert!(matches!(map_hw_error(&e), DoserError::Hardware(_)));
    }

    #[cfg(feature = "hardware-errors")]
    #[test]
    fn hw_errors_are_downcast() {
        use phdoser_hardware::HwError;
        let boxed: phdoser_traits::BoxError = Box::new(HwError::NoDevice("relay"));
        assert_eq!(
            map_hw_error(boxed.as_ref()),
            DoserError::NoDevice("relay".into())
        );
        let boxed: phdoser_traits::BoxError = Box::new(HwError::UnknownPort(9));
        assert!(matches!(
            map_hw_error(boxed.as_ref()),
            DoserError::HardwareFault(_)
        ));
    }
}
