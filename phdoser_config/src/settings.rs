//! Hot settings document.
//!
//! Field names match the JSON keys written by the web UI, so an existing
//! `settings.json` loads unchanged. Keys this crate does not model are kept in
//! `extra` and written back untouched on save.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhRange {
    pub min: f64,
    pub max: f64,
}

impl Default for PhRange {
    fn default() -> Self {
        Self { min: 7.2, max: 7.8 }
    }
}

impl PhRange {
    pub fn contains(&self, ph: f64) -> bool {
        ph >= self.min && ph <= self.max
    }
}

/// Millilitres of chemical per pH unit per litre of system volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DosageStrength {
    pub ph_up: f64,
    pub ph_down: f64,
}

impl Default for DosageStrength {
    fn default() -> Self {
        Self {
            ph_up: 1.0,
            ph_down: 1.0,
        }
    }
}

/// Seconds of pump run time per millilitre dispensed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpCalibration {
    /// pH up pump
    pub pump1: f64,
    /// pH down pump
    pub pump2: f64,
}

impl Default for PumpCalibration {
    fn default() -> Self {
        Self {
            pump1: 0.5,
            pump2: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayPorts {
    pub ph_up: u8,
    pub ph_down: u8,
}

impl Default for RelayPorts {
    fn default() -> Self {
        Self {
            ph_up: 1,
            ph_down: 2,
        }
    }
}

/// Device paths assigned to each serial role; `None` means unassigned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbRoles {
    pub ph_probe: Option<String>,
    pub relay: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpTrigger {
    /// Pump circuit watched on the pool-equipment gateway.
    pub pump_id: u32,
    /// Minutes after the pump turns on before the dose runs.
    pub dose_delay_min: f64,
}

impl Default for PumpTrigger {
    fn default() -> Self {
        Self {
            pump_id: 0,
            dose_delay_min: 15.0,
        }
    }
}

/// Electrode slope/offset reported by the probe for a `Slope,?` query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlopeResult {
    pub acid_slope: f64,
    pub base_slope: f64,
    pub offset: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeCalibration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slope: Option<SlopeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_cal_date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationStore {
    pub ph_probe: ProbeCalibration,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub system_name: String,
    pub ph_range: PhRange,
    pub ph_target: f64,
    /// Upper bound for a single dose in ml; 0 disables the clamp.
    pub max_dosing_amount: f64,
    /// Hours between interval auto-doses.
    pub dosing_interval: f64,
    /// Litres of water in the system.
    pub system_volume: f64,
    pub dosage_strength: DosageStrength,
    pub auto_dosing_enabled: bool,
    pub pump_trigger: PumpTrigger,
    pub usb_roles: UsbRoles,
    pub pump_calibration: PumpCalibration,
    pub relay_ports: RelayPorts,
    pub discord_enabled: bool,
    pub discord_webhook_url: String,
    pub telegram_enabled: bool,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
    pub ph_jump_threshold: f64,
    pub ph_median_window: usize,
    pub ph_stability_threshold: f64,
    pub calibration: CalibrationStore,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            system_name: "Garden".into(),
            ph_range: PhRange::default(),
            ph_target: 7.5,
            max_dosing_amount: 5.0,
            dosing_interval: 1.0,
            system_volume: 35_000.0,
            dosage_strength: DosageStrength::default(),
            auto_dosing_enabled: false,
            pump_trigger: PumpTrigger::default(),
            usb_roles: UsbRoles::default(),
            pump_calibration: PumpCalibration::default(),
            relay_ports: RelayPorts::default(),
            discord_enabled: false,
            discord_webhook_url: String::new(),
            telegram_enabled: false,
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
            ph_jump_threshold: 1.0,
            ph_median_window: 5,
            ph_stability_threshold: 0.2,
            calibration: CalibrationStore::default(),
            extra: Map::new(),
        }
    }
}

impl Settings {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Record a slope query answer under `calibration.ph_probe.slope`.
    pub fn set_probe_slope(&mut self, slope: SlopeResult) {
        self.calibration.ph_probe.slope = Some(slope);
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if !(self.ph_range.min.is_finite() && self.ph_range.max.is_finite()) {
            eyre::bail!("ph_range must be finite");
        }
        if self.ph_range.min > self.ph_range.max {
            eyre::bail!("ph_range.min must be <= ph_range.max");
        }
        if !(0.0..=14.0).contains(&self.ph_target) {
            eyre::bail!("ph_target must be in [0.0, 14.0]");
        }
        if self.max_dosing_amount < 0.0 {
            eyre::bail!("max_dosing_amount must be >= 0");
        }
        if self.system_volume < 0.0 {
            eyre::bail!("system_volume must be >= 0");
        }
        if self.dosage_strength.ph_up < 0.0 || self.dosage_strength.ph_down < 0.0 {
            eyre::bail!("dosage_strength values must be >= 0");
        }
        if self.pump_calibration.pump1 < 0.0 || self.pump_calibration.pump2 < 0.0 {
            eyre::bail!("pump_calibration values must be >= 0");
        }
        if self.relay_ports.ph_up == 0 || self.relay_ports.ph_down == 0 {
            eyre::bail!("relay_ports must be >= 1");
        }
        if self.relay_ports.ph_up == self.relay_ports.ph_down {
            eyre::bail!("relay_ports.ph_up and relay_ports.ph_down must differ");
        }
        if self.ph_jump_threshold <= 0.0 {
            eyre::bail!("ph_jump_threshold must be > 0");
        }
        if self.ph_median_window == 0 {
            eyre::bail!("ph_median_window must be >= 1");
        }
        if self.ph_stability_threshold <= 0.0 {
            eyre::bail!("ph_stability_threshold must be > 0");
        }
        if self.pump_trigger.dose_delay_min < 0.0 {
            eyre::bail!("pump_trigger.dose_delay_min must be >= 0");
        }
        Ok(())
    }
}
