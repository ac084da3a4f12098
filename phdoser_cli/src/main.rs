//! `phdoser`: command-line front end and daemon for the pool pH doser.

mod cli;
mod error_fmt;
mod logging;
mod pump_state;
mod run;
#[cfg(feature = "http-sinks")]
mod sinks;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use eyre::WrapErr;
use phdoser_config::AppConfig;

use crate::cli::{Cli, Commands, DEFAULT_CONFIG, JSON_MODE};

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    if let Err(e) = color_eyre::install() {
        eprintln!("failed to install error reporter: {e}");
    }

    if let Err(err) = real_main(&cli) {
        if JSON_MODE.get().copied().unwrap_or(false) {
            println!("{}", error_fmt::format_error_json(&err));
        } else {
            eprintln!("{}", error_fmt::humanize(&err));
        }
        tracing::debug!(error = ?err, "command failed");
        std::process::exit(error_fmt::exit_code_for_error(&err));
    }
}

fn real_main(cli: &Cli) -> eyre::Result<()> {
    let app = load_config(cli.config.as_deref())?;
    logging::init(cli.json, &cli.log_level, &app.logging)?;

    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(|| PathBuf::from(&app.paths.settings));
    tracing::debug!(settings = %settings_path.display(), event_log = %app.paths.event_log, "paths resolved");

    let shutdown = Arc::new(AtomicBool::new(false));
    // `dose` installs its own handler that stops the running dispense.
    if matches!(cli.cmd, Commands::Run { .. }) {
        let flag = shutdown.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
            .wrap_err("installing Ctrl-C handler")?;
    }

    run::execute(&cli.cmd, &app, &settings_path, cli.json, &shutdown)
}

/// Read and validate the bootstrap TOML. Without `--config`, the default path
/// is used when it exists and built-in defaults otherwise.
fn load_config(explicit: Option<&Path>) -> eyre::Result<AppConfig> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let p = PathBuf::from(DEFAULT_CONFIG);
            if !p.exists() {
                return Ok(AppConfig::default());
            }
            p
        }
    };
    let text = std::fs::read_to_string(&path)
        .wrap_err_with(|| format!("reading config {}", path.display()))?;
    let cfg = phdoser_config::load_toml(&text)?;
    cfg.validate().wrap_err("invalid config")?;
    Ok(cfg)
}
