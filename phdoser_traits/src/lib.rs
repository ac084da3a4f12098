//! Hardware seams for the pH dosing controller.
//!
//! Everything that touches a wire goes through one of these traits so the
//! core logic can be driven by simulated or recorded devices in tests.
pub mod clock;

pub use clock::{Clock, MonotonicClock};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay board that switches the dosing pumps.
///
/// Ports are 1-based as printed on the board. Implementations are expected to
/// open the underlying link per call; a failure leaves no connection behind.
pub trait RelayDriver {
    fn turn_on(&mut self, port: u8) -> Result<(), BoxError>;
    fn turn_off(&mut self, port: u8) -> Result<(), BoxError>;
    /// Last commanded state of `port`, `None` if the port was never driven.
    fn status(&self, port: u8) -> Option<bool>;
    /// Probe the device without switching anything (used by the health monitor).
    fn check(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// An open byte-stream connection to the pH probe.
pub trait ProbeLink {
    /// Read up to `buf.len()` bytes; `Ok(0)` means the read timed out empty.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError>;
    fn write(&mut self, data: &[u8]) -> Result<(), BoxError>;
}

/// Opens probe links by device path.
pub trait ProbeConnector {
    fn open(&mut self, path: &str) -> Result<Box<dyn ProbeLink + Send>, BoxError>;
}

impl<T: RelayDriver + ?Sized> RelayDriver for Box<T> {
    fn turn_on(&mut self, port: u8) -> Result<(), BoxError> {
        (**self).turn_on(port)
    }
    fn turn_off(&mut self, port: u8) -> Result<(), BoxError> {
        (**self).turn_off(port)
    }
    fn status(&self, port: u8) -> Option<bool> {
        (**self).status(port)
    }
    fn check(&mut self) -> Result<(), BoxError> {
        (**self).check()
    }
}
