//! Test and helper mocks for phdoser_core.
//!
//! All of them are cheap `Clone` handles over shared state, so a test can
//! hand one copy to the code under test and inspect another.
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use phdoser_config::Settings;
use phdoser_traits::{BoxError, ProbeConnector, ProbeLink, RelayDriver};
use serde_json::Value;

use crate::coordinator::ReadingSource;
use crate::event_log::{DoseRecord, EventLog};
use crate::notify::NotificationSink;
use crate::scheduler::PumpStateSource;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn io_err(msg: &str) -> BoxError {
    Box::new(std::io::Error::other(msg.to_string()))
}

#[derive(Debug, Default)]
struct RelayState {
    on: BTreeSet<u8>,
    writes: Vec<(u8, bool)>,
    max_on: usize,
    fail_on: bool,
    fail_off: bool,
    fail_check: bool,
}

/// Relay that records every command and the peak number of ports on at once.
#[derive(Debug, Clone, Default)]
pub struct RecordingRelay {
    state: Arc<Mutex<RelayState>>,
}

impl RecordingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(port, on)` for every command that reached the board.
    pub fn writes(&self) -> Vec<(u8, bool)> {
        lock(&self.state).writes.clone()
    }

    pub fn on_ports(&self) -> Vec<u8> {
        lock(&self.state).on.iter().copied().collect()
    }

    pub fn max_simultaneous_on(&self) -> usize {
        lock(&self.state).max_on
    }

    pub fn fail_turn_on(&self, fail: bool) {
        lock(&self.state).fail_on = fail;
    }

    pub fn fail_turn_off(&self, fail: bool) {
        lock(&self.state).fail_off = fail;
    }

    pub fn fail_check(&self, fail: bool) {
        lock(&self.state).fail_check = fail;
    }
}

impl RelayDriver for RecordingRelay {
    fn turn_on(&mut self, port: u8) -> Result<(), BoxError> {
        let mut st = lock(&self.state);
        if st.fail_on {
            return Err(io_err("relay unavailable"));
        }
        st.writes.push((port, true));
        st.on.insert(port);
        st.max_on = st.max_on.max(st.on.len());
        Ok(())
    }

    fn turn_off(&mut self, port: u8) -> Result<(), BoxError> {
        let mut st = lock(&self.state);
        if st.fail_off {
            return Err(io_err("relay unavailable"));
        }
        st.writes.push((port, false));
        st.on.remove(&port);
        Ok(())
    }

    fn status(&self, port: u8) -> Option<bool> {
        let st = lock(&self.state);
        st.writes
            .iter()
            .any(|(p, _)| *p == port)
            .then(|| st.on.contains(&port))
    }

    fn check(&mut self) -> Result<(), BoxError> {
        if lock(&self.state).fail_check {
            Err(io_err("relay not found"))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    chunks: VecDeque<Vec<u8>>,
    written: Vec<String>,
    opens: Vec<String>,
    fail_opens: u32,
    fail_reads: u32,
}

/// Probe connector replaying queued byte chunks, one chunk per read.
///
/// Once the script runs dry reads come back empty after `idle`.
#[derive(Debug, Clone)]
pub struct ScriptedProbe {
    state: Arc<Mutex<ScriptState>>,
    idle: Duration,
}

impl Default for ScriptedProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            idle: Duration::from_millis(5),
        }
    }

    pub fn push(&self, bytes: impl AsRef<[u8]>) {
        lock(&self.state).chunks.push_back(bytes.as_ref().to_vec());
    }

    /// Commands written so far, without their `\r` terminator.
    pub fn written(&self) -> Vec<String> {
        lock(&self.state).written.clone()
    }

    pub fn opens(&self) -> Vec<String> {
        lock(&self.state).opens.clone()
    }

    pub fn fail_next_opens(&self, n: u32) {
        lock(&self.state).fail_opens = n;
    }

    pub fn fail_next_reads(&self, n: u32) {
        lock(&self.state).fail_reads = n;
    }
}

struct ScriptedLink {
    state: Arc<Mutex<ScriptState>>,
    idle: Duration,
}

impl ProbeLink for ScriptedLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError> {
        let chunk = {
            let mut st = lock(&self.state);
            if st.fail_reads > 0 {
                st.fail_reads -= 1;
                return Err(io_err("read failed"));
            }
            st.chunks.pop_front()
        };
        match chunk {
            Some(mut bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    lock(&self.state).chunks.push_front(bytes.split_off(n));
                }
                Ok(n)
            }
            None => {
                std::thread::sleep(self.idle);
                Ok(0)
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), BoxError> {
        let text = String::from_utf8_lossy(data);
        lock(&self.state)
            .written
            .push(text.trim_end_matches('\r').to_string());
        Ok(())
    }
}

impl ProbeConnector for ScriptedProbe {
    fn open(&mut self, path: &str) -> Result<Box<dyn ProbeLink + Send>, BoxError> {
        let mut st = lock(&self.state);
        st.opens.push(path.to_string());
        if st.fail_opens > 0 {
            st.fail_opens -= 1;
            return Err(io_err("no such device"));
        }
        Ok(Box::new(ScriptedLink {
            state: self.state.clone(),
            idle: self.idle,
        }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEventLog {
    records: Arc<Mutex<Vec<DoseRecord>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DoseRecord> {
        lock(&self.records).clone()
    }
}

impl EventLog for MemoryEventLog {
    fn record(&self, record: &DoseRecord) -> eyre::Result<()> {
        lock(&self.records).push(record.clone());
        Ok(())
    }
}

/// Notification sink that keeps every text it was handed.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose sends always fail (after recording the text).
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }
}

impl NotificationSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn send(&self, _settings: &Settings, text: &str) -> Result<(), BoxError> {
        lock(&self.sent).push(text.to_string());
        if self.fail {
            Err(io_err("sink down"))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
pub struct FixedReading {
    ph: Mutex<Option<f64>>,
}

impl FixedReading {
    pub fn new(ph: Option<f64>) -> Self {
        Self { ph: Mutex::new(ph) }
    }

    pub fn set(&self, ph: Option<f64>) {
        *lock(&self.ph) = ph;
    }
}

impl ReadingSource for FixedReading {
    fn latest_reading(&self) -> Option<f64> {
        *lock(&self.ph)
    }
}

#[derive(Debug, Default)]
pub struct StaticPumpState {
    snapshot: Mutex<Value>,
}

impl StaticPumpState {
    pub fn new(snapshot: Value) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: Value) {
        *lock(&self.snapshot) = snapshot;
    }
}

impl PumpStateSource for StaticPumpState {
    fn snapshot(&self) -> Result<Value, BoxError> {
        Ok(lock(&self.snapshot).clone())
    }
}
