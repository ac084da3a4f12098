//! Dose sizing: how much chemical a reading calls for, and how long a pump
//! must run to deliver it.
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use phdoser_config::Settings;
use serde::{Deserialize, Serialize};

use crate::error::DoserError;
use crate::util::round2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoseKind {
    Up,
    Down,
}

impl DoseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for DoseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DoseKind {
    type Err = DoserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => Err(DoserError::InvalidDose(format!(
                "unknown dose type '{other}' (expected up|down)"
            ))),
        }
    }
}

/// Which path asked for a dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoseSource {
    Manual,
    Interval,
    PumpTrigger,
}

/// Dosing advice for the current reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DosageInfo {
    pub current_ph: f64,
    pub system_volume: f64,
    pub auto_dosing_enabled: bool,
    pub ph_target: f64,
    pub ph_up_amount: f64,
    pub ph_down_amount: f64,
    pub feedback_up: String,
    pub feedback_down: String,
}

/// Size corrective doses for `current_ph`. A missing reading counts as 0.0.
pub fn compute_dosage(settings: &Settings, current_ph: Option<f64>) -> DosageInfo {
    let ph = current_ph.unwrap_or(0.0);
    let target = settings.ph_target;
    let volume = settings.system_volume;
    let max = settings.max_dosing_amount;

    let size = |strength: f64, diff: f64| -> (f64, String) {
        let raw = strength * diff * volume;
        if max > 0.0 && raw > max {
            (
                max,
                format!(
                    "The actual calculated dose ({raw:.2} ml) exceeds the max dosing amount in Settings. Clamping to {max:.2} ml."
                ),
            )
        } else {
            (raw, String::new())
        }
    };

    let (up, feedback_up) = if ph < target {
        size(settings.dosage_strength.ph_up, target - ph)
    } else {
        (0.0, String::new())
    };
    let (down, feedback_down) = if ph > target {
        size(settings.dosage_strength.ph_down, ph - target)
    } else {
        (0.0, String::new())
    };

    DosageInfo {
        current_ph: round2(ph),
        system_volume: volume,
        auto_dosing_enabled: settings.auto_dosing_enabled,
        ph_target: target,
        ph_up_amount: round2(up),
        ph_down_amount: round2(down),
        feedback_up,
        feedback_down,
    }
}

/// Everything needed to run one dispense.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DosePlan {
    pub kind: DoseKind,
    pub amount_ml: f64,
    pub relay_port: u8,
    pub duration: Duration,
}

/// Clamp `amount_ml` to `max_dosing_amount` (when set) and derive the pump
/// run time from the calibration for `kind`.
pub fn plan_dose(settings: &Settings, kind: DoseKind, amount_ml: f64) -> Result<DosePlan, DoserError> {
    let max = settings.max_dosing_amount;
    let amount_ml = if max > 0.0 && amount_ml > max {
        max
    } else {
        amount_ml
    };
    let (secs_per_ml, relay_port) = match kind {
        DoseKind::Up => (settings.pump_calibration.pump1, settings.relay_ports.ph_up),
        DoseKind::Down => (settings.pump_calibration.pump2, settings.relay_ports.ph_down),
    };
    let secs = amount_ml * secs_per_ml;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(DoserError::InvalidDose(
            "calculated run time is 0 or negative".into(),
        ));
    }
    let duration = Duration::try_from_secs_f64(secs)
        .map_err(|e| DoserError::InvalidDose(format!("run time out of range: {e}")))?;
    Ok(DosePlan {
        kind,
        amount_ml,
        relay_port,
        duration,
    })
}
