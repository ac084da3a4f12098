//! USB relay board driving the dosing pumps.
//!
//! The board takes a 4-byte frame per switch: `A0 <port> <state> <sum>` where
//! `sum` is the low byte of the first three added together.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use phdoser_traits::{BoxError, RelayDriver};

use crate::error::HwError;

/// Highest port number the board family exposes.
pub const MAX_RELAY_PORT: u8 = 8;

pub fn relay_frame(port: u8, on: bool) -> Result<[u8; 4], HwError> {
    if port == 0 || port > MAX_RELAY_PORT {
        return Err(HwError::UnknownPort(port));
    }
    let state = u8::from(on);
    let sum = 0xA0u8.wrapping_add(port).wrapping_add(state);
    Ok([0xA0, port, state, sum])
}

#[derive(Debug, Default)]
struct SimRelayState {
    ports: HashMap<u8, bool>,
    writes: Vec<(u8, bool)>,
    offline: bool,
}

/// In-memory relay. Clones share state so a test can inspect what the
/// coordinator switched.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRelay {
    state: Arc<Mutex<SimRelayState>>,
}

impl SimulatedRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail until set back to `false`.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Every switch command accepted so far, in order.
    pub fn writes(&self) -> Vec<(u8, bool)> {
        self.lock().writes.clone()
    }

    pub fn is_on(&self, port: u8) -> bool {
        self.lock().ports.get(&port).copied().unwrap_or(false)
    }

    /// Ports currently switched on.
    pub fn on_ports(&self) -> Vec<u8> {
        let g = self.lock();
        let mut v: Vec<u8> = g
            .ports
            .iter()
            .filter_map(|(p, on)| on.then_some(*p))
            .collect();
        v.sort_unstable();
        v
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimRelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn switch(&self, port: u8, on: bool) -> Result<(), BoxError> {
        relay_frame(port, on)?;
        let mut g = self.lock();
        if g.offline {
            return Err(HwError::Offline.into());
        }
        g.ports.insert(port, on);
        g.writes.push((port, on));
        tracing::debug!(port, on, "relay switched (simulated)");
        Ok(())
    }
}

impl RelayDriver for SimulatedRelay {
    fn turn_on(&mut self, port: u8) -> Result<(), BoxError> {
        self.switch(port, true)
    }

    fn turn_off(&mut self, port: u8) -> Result<(), BoxError> {
        self.switch(port, false)
    }

    fn status(&self, port: u8) -> Option<bool> {
        self.lock().ports.get(&port).copied()
    }

    fn check(&mut self) -> Result<(), BoxError> {
        if self.lock().offline {
            return Err(HwError::Offline.into());
        }
        Ok(())
    }
}

#[cfg(feature = "hardware")]
pub use usb::UsbRelay;

#[cfg(feature = "hardware")]
mod usb {
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    use phdoser_traits::{BoxError, RelayDriver};

    use super::relay_frame;
    use crate::error::HwError;

    type PathResolver = Box<dyn Fn() -> Option<String> + Send>;

    /// Relay board on a USB serial adapter. The port is opened for each
    /// command and closed again; the device path is resolved per call so a
    /// role reassignment takes effect without a restart.
    pub struct UsbRelay {
        resolve_path: PathResolver,
        baud: u32,
        timeout: Duration,
        ports: HashMap<u8, bool>,
    }

    impl UsbRelay {
        pub fn new(
            resolve_path: impl Fn() -> Option<String> + Send + 'static,
            baud: u32,
            timeout: Duration,
        ) -> Self {
            Self {
                resolve_path: Box::new(resolve_path),
                baud,
                timeout,
                ports: HashMap::new(),
            }
        }

        fn open(&self) -> Result<Box<dyn serialport::SerialPort>, HwError> {
            let path = (self.resolve_path)().ok_or(HwError::NoDevice("relay"))?;
            Ok(serialport::new(&path, self.baud)
                .timeout(self.timeout)
                .open()?)
        }

        fn switch(&mut self, port: u8, on: bool) -> Result<(), HwError> {
            let frame = relay_frame(port, on)?;
            let mut link = self.open()?;
            link.write_all(&frame)?;
            link.flush()?;
            let prev = self.ports.insert(port, on);
            if prev != Some(on) {
                tracing::info!(port, on, "relay state changed");
            }
            Ok(())
        }
    }

    impl RelayDriver for UsbRelay {
        fn turn_on(&mut self, port: u8) -> Result<(), BoxError> {
            Ok(self.switch(port, true)?)
        }

        fn turn_off(&mut self, port: u8) -> Result<(), BoxError> {
            Ok(self.switch(port, false)?)
        }

        fn status(&self, port: u8) -> Option<bool> {
            self.ports.get(&port).copied()
        }

        fn check(&mut self) -> Result<(), BoxError> {
            let _link = self.open()?;
            Ok(())
        }
    }
}
