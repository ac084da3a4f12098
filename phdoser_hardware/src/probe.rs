//! pH probe links: a simulated EZO-style probe and the serial-port connector.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use phdoser_traits::{BoxError, ProbeConnector, ProbeLink};

use crate::error::HwError;

#[derive(Debug)]
struct SimProbeState {
    ph: f64,
    continuous: bool,
    pending: VecDeque<u8>,
    written: Vec<String>,
    fail_opens: u32,
    fail_reads: u32,
    opens: u32,
    slope: String,
}

/// Simulated probe shared between the connector and the links it opens.
///
/// While continuous mode is on (after `C,1`) every read waits `period` and
/// yields one reading line. Writes are answered the way the probe firmware
/// answers: `Slope,?` gets a `?Slope,...` line, everything else `*OK`.
#[derive(Debug, Clone)]
pub struct SimulatedProbe {
    state: Arc<Mutex<SimProbeState>>,
    period: Duration,
}

impl SimulatedProbe {
    pub fn new(ph: f64, period: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimProbeState {
                ph,
                continuous: false,
                pending: VecDeque::new(),
                written: Vec::new(),
                fail_opens: 0,
                fail_reads: 0,
                opens: 0,
                slope: "99.7,100.3,-0.89".into(),
            })),
            period,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_ph(&self, ph: f64) {
        self.lock().ph = ph;
    }

    /// Queue raw bytes to be returned by the next reads, ahead of readings.
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().pending.extend(bytes.iter().copied());
    }

    /// Commands received, without the trailing `\r`.
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.lock().fail_opens = n;
    }

    pub fn fail_next_reads(&self, n: u32) {
        self.lock().fail_reads = n;
    }

    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    pub fn set_slope_answer(&self, payload: &str) {
        self.lock().slope = payload.to_string();
    }

    pub fn connector(&self) -> SimulatedProbeConnector {
        SimulatedProbeConnector { probe: self.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedProbeConnector {
    probe: SimulatedProbe,
}

impl ProbeConnector for SimulatedProbeConnector {
    fn open(&mut self, path: &str) -> Result<Box<dyn ProbeLink + Send>, BoxError> {
        let mut g = self.probe.lock();
        if g.fail_opens > 0 {
            g.fail_opens -= 1;
            return Err(HwError::Serial(format!("cannot open {path}")).into());
        }
        g.opens += 1;
        drop(g);
        tracing::debug!(path, "probe link opened (simulated)");
        Ok(Box::new(SimulatedProbeLink {
            probe: self.probe.clone(),
        }))
    }
}

struct SimulatedProbeLink {
    probe: SimulatedProbe,
}

impl ProbeLink for SimulatedProbeLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError> {
        {
            let mut g = self.probe.lock();
            if g.fail_reads > 0 {
                g.fail_reads -= 1;
                return Err(HwError::Offline.into());
            }
            if !g.pending.is_empty() {
                let n = buf.len().min(g.pending.len());
                for (slot, b) in buf.iter_mut().zip(g.pending.drain(..n)) {
                    *slot = b;
                }
                return Ok(n);
            }
        }
        std::thread::sleep(self.probe.period);
        let mut g = self.probe.lock();
        if !g.continuous {
            return Ok(0);
        }
        let line = format!("{:.3}\r", g.ph);
        g.pending.extend(line.bytes());
        let n = buf.len().min(g.pending.len());
        for (slot, b) in buf.iter_mut().zip(g.pending.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), BoxError> {
        let text = String::from_utf8_lossy(data);
        let cmd = text.trim_end_matches('\r').to_string();
        let mut g = self.probe.lock();
        let reply = match cmd.to_ascii_lowercase().as_str() {
            "c,1" => {
                g.continuous = true;
                "*OK\r".to_string()
            }
            "c,0" => {
                g.continuous = false;
                "*OK\r".to_string()
            }
            "slope,?" => format!("?Slope,{}\r*OK\r", g.slope),
            _ => "*OK\r".to_string(),
        };
        g.written.push(cmd);
        g.pending.extend(reply.bytes());
        Ok(())
    }
}

#[cfg(feature = "hardware")]
pub use serial::SerialProbeConnector;

#[cfg(feature = "hardware")]
mod serial {
    use std::io::{Read, Write};
    use std::time::Duration;

    use phdoser_traits::{BoxError, ProbeConnector, ProbeLink};

    use crate::error::HwError;

    /// Opens the probe over a USB serial adapter.
    #[derive(Debug, Clone)]
    pub struct SerialProbeConnector {
        baud: u32,
        read_timeout: Duration,
    }

    impl SerialProbeConnector {
        pub fn new(baud: u32, read_timeout: Duration) -> Self {
            Self { baud, read_timeout }
        }
    }

    impl ProbeConnector for SerialProbeConnector {
        fn open(&mut self, path: &str) -> Result<Box<dyn ProbeLink + Send>, BoxError> {
            let port = serialport::new(path, self.baud)
                .timeout(self.read_timeout)
                .open()
                .map_err(HwError::from)?;
            tracing::info!(path, baud = self.baud, "probe port opened");
            Ok(Box::new(SerialProbeLink { port }))
        }
    }

    struct SerialProbeLink {
        port: Box<dyn serialport::SerialPort>,
    }

    impl ProbeLink for SerialProbeLink {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError> {
            match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(HwError::Io(e).into()),
            }
        }

        fn write(&mut self, data: &[u8]) -> Result<(), BoxError> {
            self.port.write_all(data).map_err(HwError::Io)?;
            self.port.flush().map_err(HwError::Io)?;
            Ok(())
        }
    }
}
