//! Append-only dosing event log (JSON lines).
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Local;
use eyre::WrapErr;
use serde::{Deserialize, Serialize};

use crate::dosage::DoseKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseRecord {
    pub event_type: String,
    /// Reading at completion; `null` when none was available.
    pub ph: Option<f64>,
    pub dose_type: DoseKind,
    pub dose_amount_ml: f64,
    pub timestamp: String,
}

impl DoseRecord {
    pub fn now(ph: Option<f64>, kind: DoseKind, amount_ml: f64) -> Self {
        Self {
            event_type: "dosing".into(),
            ph,
            dose_type: kind,
            dose_amount_ml: amount_ml,
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        }
    }
}

pub trait EventLog: Send + Sync {
    fn record(&self, record: &DoseRecord) -> eyre::Result<()>;
}

#[derive(Debug)]
pub struct JsonlEventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse every record in the file; unparsable lines are skipped.
    pub fn read_all(&self) -> eyre::Result<Vec<DoseRecord>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).wrap_err_with(|| format!("reading {}", self.path.display()));
            }
        };
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

impl EventLog for JsonlEventLog {
    fn record(&self, record: &DoseRecord) -> eyre::Result<()> {
        let line = serde_json::to_string(record).wrap_err("serializing dose record")?;
        let _g = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .wrap_err_with(|| format!("creating {}", dir.display()))?;
            }
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .wrap_err_with(|| format!("opening {}", self.path.display()))?;
        writeln!(f, "{line}").wrap_err("appending dose record")?;
        Ok(())
    }
}
