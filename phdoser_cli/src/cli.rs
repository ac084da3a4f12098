//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use phdoser_core::DoseKind;
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

/// Bootstrap config used when `--config` is not given and the file exists.
pub const DEFAULT_CONFIG: &str = "etc/phdoser.toml";

#[derive(Parser, Debug)]
#[command(name = "phdoser", version, about = "Pool pH dosing controller")]
pub struct Cli {
    /// Path to the bootstrap TOML (paths, logging, loop periods)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the settings JSON path from the bootstrap config
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Print results and errors as JSON lines
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Which chemical pump to run.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    Up,
    Down,
}

impl From<KindArg> for DoseKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Up => Self::Up,
            KindArg::Down => Self::Down,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller: probe reader, auto-dosing and health monitor
    Run {
        /// JSON file holding the pool gateway snapshot; enables the pump trigger
        #[arg(long, value_name = "FILE")]
        pump_state_file: Option<PathBuf>,
    },
    /// Dispense a fixed amount and wait for it to finish
    Dose {
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Millilitres to dispense (clamped to max_dosing_amount)
        #[arg(long, value_name = "ML")]
        ml: f64,
    },
    /// Force both pump relays off
    Stop,
    /// Print the dosing advice for a pH value
    Info {
        /// pH to evaluate; read from the probe when omitted
        #[arg(long, value_name = "PH")]
        ph: Option<f64>,
    },
    /// Query the probe slope and store it in the settings
    Slope {
        /// Bounded wait for the answer (defaults to probe.slope_timeout_ms)
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
    /// Send a calibration command (low, mid, high, clear)
    Calibrate {
        #[arg(value_name = "LEVEL")]
        level: String,
    },
    /// Quick health check (settings valid, relay present)
    SelfCheck,
    /// Send a test message through every enabled notification channel
    NotifyTest {
        #[arg(long, default_value = "Test notification from phdoser")]
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn dose_args_parse() {
        let cli = Cli::try_parse_from(["phdoser", "--json", "dose", "--kind", "down", "--ml", "2.5"])
            .unwrap();
        assert!(cli.json);
        match cli.cmd {
            Commands::Dose { kind, ml } => {
                assert_eq!(DoseKind::from(kind), DoseKind::Down);
                assert!((ml - 2.5).abs() < f64::EPSILON);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
