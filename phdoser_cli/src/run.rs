//! Command execution: config mapping, hardware assembly, and the subcommands.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use eyre::{WrapErr, eyre};
use phdoser_config::{AppConfig, JsonFileSettings, SettingsProvider};
use phdoser_core::health::check_relay;
use phdoser_core::{
    CalibrationLevel, DoseKind, DoseSource, DoserError, DosingCoordinator, ErrorFlags, EventBus,
    JsonlEventLog, LoopPeriods, NotificationThrottle, ProbeService,
    ReaderPolicy, ReadingSource, SharedRelay, StatusEvent, compute_dosage, shared_relay,
    slope_health, spawn_health_monitor, spawn_interval_loop, spawn_pump_trigger_loop,
};
use phdoser_traits::{MonotonicClock, ProbeConnector};
use serde_json::json;

use crate::cli::Commands;
use crate::pump_state::FilePumpState;

/// Extra time allowed past the planned pump run before giving up on a dose.
const DOSE_GRACE: Duration = Duration::from_secs(5);
/// How long `info` waits for a first probe reading.
const READING_WAIT: Duration = Duration::from_secs(10);

/// Everything a command may need, wired the same way for each of them.
pub struct Rig {
    pub settings: Arc<dyn SettingsProvider>,
    pub relay: SharedRelay,
    pub flags: Arc<ErrorFlags>,
    pub bus: EventBus,
    pub throttle: Arc<NotificationThrottle>,
    pub probe: ProbeService,
    pub coordinator: Arc<DosingCoordinator>,
    policy: ReaderPolicy,
}

impl Rig {
    pub fn assemble(app: &AppConfig, settings_path: &Path) -> eyre::Result<Self> {
        let settings: Arc<dyn SettingsProvider> = Arc::new(JsonFileSettings::new(settings_path));
        settings
            .load()?
            .validate()
            .wrap_err("invalid settings")?;

        let bus = EventBus::new();
        let flags = Arc::new(ErrorFlags::new());
        let throttle = Arc::new(with_sinks(
            NotificationThrottle::new(settings.clone(), Arc::new(MonotonicClock::new()))
                .with_bus(bus.clone()),
        )?);
        let policy = ReaderPolicy::from(&app.probe);
        let probe = ProbeService::new(
            settings.clone(),
            throttle.clone(),
            flags.clone(),
            bus.clone(),
            policy.clone(),
        );
        let relay = hw::relay(app, settings.clone());
        let coordinator = DosingCoordinator::builder()
            .relay(relay.clone())
            .settings(settings.clone())
            .event_log(Arc::new(JsonlEventLog::new(&app.paths.event_log)))
            .bus(bus.clone())
            .flags(flags.clone())
            .readings(Arc::new(probe.clone()))
            .try_build()?;

        Ok(Self {
            settings,
            relay,
            flags,
            bus,
            throttle,
            probe,
            coordinator: Arc::new(coordinator),
            policy,
        })
    }
}

#[cfg(feature = "http-sinks")]
fn with_sinks(throttle: NotificationThrottle) -> eyre::Result<NotificationThrottle> {
    use crate::sinks::{DiscordSink, TelegramSink, http_client};
    let client = http_client().wrap_err("building HTTP client")?;
    Ok(throttle
        .with_sink(TelegramSink::new(client.clone()))
        .with_sink(DiscordSink::new(client)))
}

#[cfg(not(feature = "http-sinks"))]
fn with_sinks(throttle: NotificationThrottle) -> eyre::Result<NotificationThrottle> {
    tracing::debug!(target: "phdoser::notify", "built without HTTP sinks; alerts are logged only");
    Ok(throttle)
}

mod hw {
    use super::{AppConfig, Arc, ProbeConnector, SettingsProvider, SharedRelay, shared_relay};

    #[cfg(feature = "hardware")]
    pub fn relay(app: &AppConfig, settings: Arc<dyn SettingsProvider>) -> SharedRelay {
        let resolve = move || settings.load().ok().and_then(|s| s.usb_roles.relay);
        shared_relay(phdoser_hardware::UsbRelay::new(
            resolve,
            app.relay.baud,
            std::time::Duration::from_millis(app.relay.timeout_ms),
        ))
    }

    /// Simulated relay. `PHDOSER_SIM_RELAY_OFFLINE=1` makes every call fail.
    #[cfg(not(feature = "hardware"))]
    pub fn relay(_app: &AppConfig, _settings: Arc<dyn SettingsProvider>) -> SharedRelay {
        let relay = phdoser_hardware::SimulatedRelay::new();
        if std::env::var("PHDOSER_SIM_RELAY_OFFLINE").is_ok_and(|v| v == "1") {
            relay.set_offline(true);
        }
        tracing::info!("using simulated relay");
        shared_relay(relay)
    }

    #[cfg(feature = "hardware")]
    pub fn probe_connector(app: &AppConfig) -> impl ProbeConnector + Send + 'static {
        phdoser_hardware::SerialProbeConnector::new(
            app.probe.baud,
            std::time::Duration::from_millis(app.probe.read_timeout_ms),
        )
    }

    /// Simulated probe reading `PHDOSER_SIM_PH` (default 7.40).
    #[cfg(not(feature = "hardware"))]
    pub fn probe_connector(_app: &AppConfig) -> impl ProbeConnector + Send + 'static {
        let ph = std::env::var("PHDOSER_SIM_PH")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(7.4);
        tracing::info!(ph, "using simulated pH probe");
        phdoser_hardware::SimulatedProbe::new(ph, std::time::Duration::from_millis(100))
            .connector()
    }
}

pub fn execute(
    cmd: &Commands,
    app: &AppConfig,
    settings_path: &Path,
    json: bool,
    shutdown: &Arc<AtomicBool>,
) -> eyre::Result<()> {
    let rig = Rig::assemble(app, settings_path)?;
    match cmd {
        Commands::Run { pump_state_file } => {
            run_daemon(&rig, app, pump_state_file.as_deref(), json, shutdown)
        }
        Commands::Dose { kind, ml } => run_dose(&rig, (*kind).into(), *ml, json),
        Commands::Stop => {
            let stopped = rig.coordinator.stop_dispense();
            let value = json!({ "stopped": stopped, "relays_off": true });
            emit(json, &value, "Pump relays switched off.");
            Ok(())
        }
        Commands::Info { ph } => {
            let ph = match ph {
                Some(p) => Some(*p),
                None => wait_for_reading(&rig, app)?,
            };
            let info = compute_dosage(&rig.settings.load()?, ph);
            let value = serde_json::to_value(&info)?;
            if json {
                println!("{value}");
            } else {
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Ok(())
        }
        Commands::Slope { timeout_ms } => {
            let timeout = timeout_ms.map_or(rig.policy.slope_timeout, Duration::from_millis);
            let _reader = rig.probe.spawn_reader(hw::probe_connector(app))?;
            report_slope(&rig, timeout, json)
        }
        Commands::Calibrate { level } => {
            let level: CalibrationLevel = level.parse()?;
            let _reader = rig.probe.spawn_reader(hw::probe_connector(app))?;
            rig.probe.enqueue_calibration(level);
            tracing::info!(target: "phdoser::probe", command = level.command(), "calibration queued");
            // The slope query goes out only after the calibration was answered.
            report_slope(&rig, rig.policy.slope_timeout, json)
        }
        Commands::SelfCheck => {
            let relay_ok = check_relay(&rig.relay, &rig.flags);
            let errors = rig.flags.messages();
            let value = json!({ "relay_ok": relay_ok, "errors": errors });
            if relay_ok {
                emit(json, &value, "Self-check OK.");
                Ok(())
            } else {
                if json {
                    println!("{value}");
                }
                Err(DoserError::Hardware(errors.join("; ")).into())
            }
        }
        Commands::NotifyTest { message } => notify_test(&rig, message, json),
    }
}

fn emit(json: bool, value: &serde_json::Value, human: &str) {
    if json {
        println!("{value}");
    } else {
        println!("{human}");
    }
}

fn run_dose(rig: &Rig, kind: DoseKind, ml: f64, json: bool) -> eyre::Result<()> {
    let events = rig.bus.subscribe();
    {
        let coordinator = rig.coordinator.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            coordinator.stop_dispense();
        }) {
            tracing::warn!(error = %e, "failed to install Ctrl-C handler");
        }
    }

    let ticket = rig
        .coordinator
        .start_dispense(kind, ml, DoseSource::Manual)?;
    tracing::info!(
        target: "phdoser::dosing",
        kind = kind.as_str(),
        amount_ml = ticket.plan.amount_ml,
        seconds = ticket.plan.duration.as_secs_f64(),
        "dose started"
    );

    let deadline = std::time::Instant::now() + ticket.plan.duration + DOSE_GRACE;
    loop {
        let left = deadline.saturating_duration_since(std::time::Instant::now());
        let event = events
            .recv_timeout(left)
            .map_err(|_| eyre!("dose did not finish within {:?}", ticket.plan.duration + DOSE_GRACE))?;
        match event {
            StatusEvent::DoseComplete { kind, amount } => {
                let value = json!({
                    "type": kind,
                    "amount_ml": amount,
                    "duration_s": ticket.plan.duration.as_secs_f64(),
                    "ph": rig.coordinator.latest_reading(),
                });
                emit(
                    json,
                    &value,
                    &format!("Dose complete: {amount} ml of pH {}.", kind.as_str()),
                );
                return Ok(());
            }
            StatusEvent::DoseError { error, .. } => {
                return Err(DoserError::Hardware(error).into());
            }
            StatusEvent::DoseStopped { kind } => {
                return Err(DoserError::State(format!("{} dose stopped before completion", kind.as_str())).into());
            }
            _ => {}
        }
    }
}

fn report_slope(rig: &Rig, timeout: Duration, json: bool) -> eyre::Result<()> {
    let slope = rig.probe.query_slope(timeout)?;
    let health = slope_health(&slope);
    let value = json!({
        "acid_slope": slope.acid_slope,
        "base_slope": slope.base_slope,
        "offset": slope.offset,
        "healthy": health.healthy,
        "message": health.message,
    });
    emit(
        json,
        &value,
        &format!(
            "Acid slope {:.1}%, base slope {:.1}%, offset {:.2} mV\n{}",
            slope.acid_slope, slope.base_slope, slope.offset, health.message
        ),
    );
    Ok(())
}

fn wait_for_reading(rig: &Rig, app: &AppConfig) -> eyre::Result<Option<f64>> {
    let settings = rig.settings.load()?;
    if settings.usb_roles.ph_probe.is_none() {
        return Ok(None);
    }
    let _reader = rig.probe.spawn_reader(hw::probe_connector(app))?;
    let deadline = std::time::Instant::now() + READING_WAIT;
    while std::time::Instant::now() < deadline {
        if let Some(ph) = rig.probe.latest_reading() {
            return Ok(Some(ph));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    tracing::warn!(target: "phdoser::probe", "no pH reading yet; advice uses pH 0.0");
    Ok(None)
}

#[cfg(feature = "http-sinks")]
fn notify_test(rig: &Rig, message: &str, json: bool) -> eyre::Result<()> {
    use crate::sinks::{DiscordSink, TelegramSink, http_client};
    use phdoser_core::NotificationSink;

    let settings = rig.settings.load()?;
    let client = http_client()?;
    let text = format!("[{}] {message}", settings.system_name);
    let channels: [(Box<dyn NotificationSink>, bool); 2] = [
        (
            Box::new(TelegramSink::new(client.clone())),
            TelegramSink::is_configured(&settings),
        ),
        (
            Box::new(DiscordSink::new(client)),
            DiscordSink::is_configured(&settings),
        ),
    ];
    let mut failed = Vec::new();
    for (sink, configured) in channels {
        let outcome = if !configured {
            "skipped".to_string()
        } else {
            match sink.send(&settings, &text) {
                Ok(()) => "sent".to_string(),
                Err(e) => {
                    failed.push(sink.name());
                    format!("failed: {e}")
                }
            }
        };
        emit(
            json,
            &json!({ "channel": sink.name(), "result": outcome }),
            &format!("{}: {outcome}", sink.name()),
        );
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(eyre!("notification failed on {}", failed.join(", ")))
    }
}

#[cfg(not(feature = "http-sinks"))]
fn notify_test(_rig: &Rig, _message: &str, _json: bool) -> eyre::Result<()> {
    Err(DoserError::Config("built without the http-sinks feature".into()).into())
}

fn run_daemon(
    rig: &Rig,
    app: &AppConfig,
    pump_state_file: Option<&Path>,
    json: bool,
    shutdown: &Arc<AtomicBool>,
) -> eyre::Result<()> {
    let periods = LoopPeriods::from(&app.scheduler);
    let events = rig.bus.subscribe();

    let _reader = rig.probe.spawn_reader(hw::probe_connector(app))?;
    let _interval = spawn_interval_loop(
        rig.coordinator.clone(),
        rig.settings.clone(),
        periods.auto_dose_tick,
    )?;
    let _pump = match pump_state_file {
        Some(path) => Some(spawn_pump_trigger_loop(
            rig.coordinator.clone(),
            rig.settings.clone(),
            Arc::new(FilePumpState::new(path)),
            periods.pump_poll,
        )?),
        None => None,
    };
    let _health = spawn_health_monitor(
        rig.relay.clone(),
        rig.coordinator.clone(),
        periods.health_check,
    )?;
    tracing::info!(
        pump_trigger = pump_state_file.is_some(),
        "controller running; press Ctrl-C to stop"
    );

    while !shutdown.load(Ordering::Relaxed) {
        let Ok(event) = events.recv_timeout(Duration::from_millis(200)) else {
            continue;
        };
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            log_event(&event);
        }
    }

    tracing::info!("shutting down");
    rig.coordinator.stop_dispense();
    // Alert state changes during shutdown are not interesting.
    rig.throttle.set_broadcast_enabled(false);
    Ok(())
}

fn log_event(event: &StatusEvent) {
    match event {
        StatusEvent::PhUpdate { ph } => tracing::debug!(target: "phdoser::probe", ph, "pH update"),
        StatusEvent::DoseStart {
            kind,
            amount,
            duration,
            source,
        } => tracing::info!(
            target: "phdoser::dosing",
            kind = kind.as_str(),
            amount,
            duration,
            ?source,
            "dose started"
        ),
        StatusEvent::DoseComplete { kind, amount } => {
            tracing::info!(target: "phdoser::dosing", kind = kind.as_str(), amount, "dose complete");
        }
        StatusEvent::DoseError { kind, error } => {
            tracing::error!(target: "phdoser::dosing", kind = kind.as_str(), error = %error, "dose failed");
        }
        StatusEvent::DoseStopped { kind } => {
            tracing::warn!(target: "phdoser::dosing", kind = kind.as_str(), "dose stopped");
        }
        StatusEvent::NotificationsUpdate { notifications } => {
            tracing::debug!(target: "phdoser::notify", active = notifications.len(), "notifications updated");
        }
        StatusEvent::Status(snapshot) => tracing::debug!(
            ph = snapshot.ph,
            errors = ?snapshot.errors,
            dosing = snapshot.dose.active,
            "status"
        ),
    }
}
