//! Human-readable error descriptions and structured JSON error formatting.

use phdoser_core::{BuildError, DoserError};

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingRelay => {
                "What happened: No relay driver was provided to the dosing coordinator.\nLikely causes: The relay backend failed to initialize.\nHow to fix: Check the relay USB role in the settings and the hardware feature of this build.".to_string()
            }
            BuildError::MissingSettings | BuildError::MissingEventLog => format!(
                "What happened: The dosing coordinator is incomplete ({be}).\nLikely causes: A bug in the command wiring.\nHow to fix: Re-run with --log-level=debug and report the output."
            ),
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
            ),
        };
    }

    if let Some(de) = err.downcast_ref::<DoserError>() {
        return match de {
            DoserError::Timeout => "What happened: The pH probe did not answer in time.\nLikely causes: Probe unplugged, wrong USB role, or a long calibration still in progress.\nHow to fix: Check usb_roles.ph_probe and the cable, or pass a larger --timeout-ms.".to_string(),
            DoserError::NoDevice(role) => format!(
                "What happened: No device is assigned to the '{role}' role.\nLikely causes: usb_roles.{role} is empty in the settings.\nHow to fix: Set usb_roles.{role} to the device path (e.g. /dev/ttyUSB0) and rerun."
            ),
            DoserError::InvalidDose(msg) => format!(
                "What happened: The dose was rejected ({msg}).\nLikely causes: Zero or negative amount, or pump_calibration is 0 for this pump.\nHow to fix: Pass a positive --ml and check pump_calibration in the settings."
            ),
            DoserError::Hardware(msg) | DoserError::HardwareFault(msg) => format!(
                "What happened: The relay board reported an error ({msg}).\nLikely causes: Relay unplugged, wrong USB role, or insufficient serial permissions.\nHow to fix: Check usb_roles.relay and the cable, then rerun `phdoser self-check`."
            ),
            DoserError::Config(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: A typo or out-of-range value.\nHow to fix: Edit the settings or arguments, then rerun."
            ),
            DoserError::State(_) | DoserError::Io(_) => format!(
                "What happened: {de}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    if err.downcast_ref::<toml::de::Error>().is_some() {
        return format!(
            "What happened: The bootstrap config is not valid TOML.\nLikely causes: A syntax error or a value of the wrong type.\nHow to fix: Fix the file and rerun. Parser said: {err}"
        );
    }

    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("parsing settings") {
        let cause = err.root_cause();
        return format!(
            "What happened: The settings file is not valid JSON.\nLikely causes: A manual edit left a syntax error.\nHow to fix: Fix or remove the file (defaults are used when it is missing). Cause: {cause}"
        );
    }

    if lower.contains("invalid settings") || lower.contains("invalid config") {
        let cause = err.root_cause();
        return format!(
            "What happened: Configuration is invalid ({cause}).\nLikely causes: Out-of-range values.\nHow to fix: Edit the file and try again."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes per error family; anything unclassified returns 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    match err.downcast_ref::<DoserError>() {
        Some(DoserError::Hardware(_) | DoserError::HardwareFault(_)) => 3,
        Some(DoserError::Timeout) => 4,
        Some(DoserError::NoDevice(_)) => 5,
        Some(DoserError::InvalidDose(_)) => 6,
        Some(DoserError::Config(_)) => 7,
        _ => 1,
    }
}

/// Short machine name of the error family, used as the JSON `reason`.
pub fn reason_name(err: &eyre::Report) -> &'static str {
    match err.downcast_ref::<DoserError>() {
        Some(DoserError::Hardware(_) | DoserError::HardwareFault(_)) => "Hardware",
        Some(DoserError::Timeout) => "Timeout",
        Some(DoserError::NoDevice(_)) => "NoDevice",
        Some(DoserError::InvalidDose(_)) => "InvalidDose",
        Some(DoserError::Config(_)) => "Config",
        _ => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    serde_json::json!({
        "reason": reason_name(err),
        "message": humanize(err),
        "exit_code": exit_code_for_error(err),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DoserError::Timeout, 4, "Timeout", "did not answer")]
    #[case(DoserError::NoDevice("ph_probe".into()), 5, "NoDevice", "usb_roles.ph_probe")]
    #[case(DoserError::InvalidDose("calculated run time is 0 or negative".into()), 6, "InvalidDose", "rejected")]
    #[case(DoserError::Hardware("device offline".into()), 3, "Hardware", "relay board")]
    fn doser_errors_map_to_stable_codes(
        #[case] e: DoserError,
        #[case] code: i32,
        #[case] reason: &str,
        #[case] needle: &str,
    ) {
        let report = eyre::Report::new(e);
        assert_eq!(exit_code_for_error(&report), code);
        assert!(humanize(&report).contains(needle));
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&report)).unwrap();
        assert_eq!(v["reason"], reason);
        assert_eq!(v["exit_code"], code);
    }

    #[test]
    fn unknown_errors_fall_back() {
        let report = eyre::eyre!("boom");
        assert_eq!(exit_code_for_error(&report), 1);
        assert!(humanize(&report).contains("Original: boom"));
    }
}
