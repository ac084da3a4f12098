//! Device drivers for the pH dosing controller.
//!
//! Simulated devices are always available. Serial-port backed drivers are
//! compiled with the `hardware` feature.
pub mod error;
pub mod probe;
pub mod relay;

pub use error::HwError;
#[cfg(feature = "hardware")]
pub use probe::SerialProbeConnector;
pub use probe::{SimulatedProbe, SimulatedProbeConnector};
#[cfg(feature = "hardware")]
pub use relay::UsbRelay;
pub use relay::{MAX_RELAY_PORT, SimulatedRelay, relay_frame};
