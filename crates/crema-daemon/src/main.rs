//! `cremad` – the Crema boiler control daemon.
//!
//! Wires the control core together and runs it:
//!
//! 1. Structured logging from `RUST_LOG` (JSON via `CREMA_LOG_FORMAT=json`).
//! 2. Opens the configuration document and the telemetry database.
//! 3. Spawns the 1 Hz control loop and the hourly telemetry retention sweep.
//! 4. On Ctrl-C / SIGTERM: raises the shutdown flag, waits for the loop to
//!    force the heater off and flush telemetry, then exits. If the loop task
//!    died instead of stopping, a fresh PWM endpoint commands duty 0 as a
//!    last resort.
//!
//! # Environment variables
//!
//! | Variable | Default | Effect |
//! |---|---|---|
//! | `CREMA_CONFIG` | `/var/lib/crema/config.json` | configuration document path |
//! | `CREMA_DB` | `/var/lib/crema/telemetry.db` | telemetry database path |
//! | `CREMA_SENSOR_CMD` | `read-boiler-temp` | thermocouple driver command |
//! | `CREMA_PWM_PIN` | `12` | GPIO pin driven through pigpiod |
//! | `RUST_LOG` | `info` | log filter |
//! | `CREMA_LOG_FORMAT` | – | `json` for newline-delimited JSON logs |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, info, warn};

use crema_api::CommandInterface;
use crema_control::{ControlLoop, EventBus, ModeController};
use crema_hal::heater::{Heater, PigpioPwm, PwmOutput};
use crema_hal::sensor::DriverProbe;
use crema_store::{ConfigStore, RETENTION_DAYS, TelemetryStore};

const RETENTION_SWEEP_PERIOD: Duration = Duration::from_secs(3600);

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn init_tracing() {
    let log_level = env_or("RUST_LOG", "info");
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("CREMA_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config_path = env_or("CREMA_CONFIG", "/var/lib/crema/config.json");
    let db_path = env_or("CREMA_DB", "/var/lib/crema/telemetry.db");
    let sensor_cmd = env_or("CREMA_SENSOR_CMD", "read-boiler-temp");
    let pwm_pin: u8 = match env_or("CREMA_PWM_PIN", "12").parse() {
        Ok(pin) => pin,
        Err(e) => {
            error!(error = %e, "CREMA_PWM_PIN is not a valid pin number");
            std::process::exit(1);
        }
    };

    let config = match ConfigStore::open(&config_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(path = %config_path, error = %e, "cannot open configuration");
            std::process::exit(1);
        }
    };
    let telemetry = match TelemetryStore::open(&db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(path = %db_path, error = %e, "cannot open telemetry database");
            std::process::exit(1);
        }
    };

    let bus = EventBus::default();
    let modes = ModeController::new(Arc::clone(&config), bus.clone());
    // Held by the HTTP edge; constructed here so the wiring is complete even
    // before the edge attaches.
    let _commands = CommandInterface::new(
        Arc::clone(&config),
        Arc::clone(&modes),
        Arc::clone(&telemetry),
    );

    let probe = DriverProbe::new(sensor_cmd.clone());
    let heater = Heater::new(Box::new(PigpioPwm::new(pwm_pin)));
    let control = ControlLoop::new(
        Box::new(probe),
        heater,
        Arc::clone(&config),
        Arc::clone(&telemetry),
        bus.clone(),
    );

    info!(
        config = %config_path,
        db = %db_path,
        sensor = %sensor_cmd,
        pin = pwm_pin,
        "cremad starting"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let loop_handle = tokio::spawn(control.run(Arc::clone(&shutdown)));

    let sweep_telemetry = Arc::clone(&telemetry);
    let sweep_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_SWEEP_PERIOD);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_telemetry.prune(RETENTION_DAYS) {
                warn!(error = %e, "telemetry retention sweep failed");
            }
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "signal handler failed; shutting down"),
    }

    // Orderly shutdown: the loop turns the heater off and flushes telemetry
    // on its way out; the sweep is simply dropped.
    shutdown.store(true, Ordering::SeqCst);
    sweep_handle.abort();

    if loop_handle.await.is_err() {
        // The loop died (panicked or was aborted) without running its
        // shutdown path; command duty 0 through a fresh endpoint and flush
        // whatever telemetry is still buffered. Each step is best-effort.
        error!("control loop did not stop cleanly; forcing heater off");
        let mut pwm = PigpioPwm::new(pwm_pin);
        if let Err(e) = pwm.set_duty(0) {
            error!(error = %e, "emergency heater off failed");
        }
        if let Err(e) = telemetry.flush() {
            warn!(error = %e, "emergency telemetry flush failed");
        }
    }

    info!("cremad stopped");
}
