//! The 1 Hz control loop.
//!
//! Each tick composes sensor → supervisor → PID → actuator → classifier →
//! telemetry against a single configuration snapshot taken at tick start.
//! The loop is the sole reader of the sensor and the sole writer of the
//! heater; it runs as one task on a skipping interval, so a sensor read
//! that stretches toward the tick period delays the next tick instead of
//! overlapping it.
//!
//! Failures inside a tick are handled at the tick boundary; the loop never
//! terminates on a recoverable error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crema_hal::heater::Heater;
use crema_hal::pid::{DUTY_MAX, PidEngine};
use crema_hal::sensor::TemperatureProbe;
use crema_store::{BoilerConfig, ConfigStore, TelemetryStore};
use crema_types::{
    Event, EventPayload, Gains, MachineState, PidMode, TelemetryRecord, duty_to_percent,
};

use crate::bus::EventBus;
use crate::classifier::StateClassifier;
use crate::recovery::RecoveryDetector;
use crate::supervisor::SafetySupervisor;
use crate::window::TempWindow;

/// Tick period of the control loop.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);
/// How often the on-disk configuration is polled for out-of-band edits.
pub const CONFIG_RELOAD_PERIOD: Duration = Duration::from_secs(10);

/// Extreme overshoot above setpoint that is logged at emergency severity.
const OVERSHOOT_LOG_MARGIN: f64 = 10.0;

fn gains_for(mode: PidMode, cfg: &BoilerConfig) -> Gains {
    match mode {
        PidMode::Normal => cfg.normal_gains(),
        PidMode::Recovery => cfg.recovery_gains(),
    }
}

/// Owner of all per-tick control state: the sensor handle, the heater, the
/// PID engine, the sliding window, and the classifiers.
pub struct ControlLoop {
    probe: Box<dyn TemperatureProbe>,
    heater: Heater,
    engine: PidEngine,
    pid_mode: PidMode,
    gains: Gains,
    supervisor: SafetySupervisor,
    classifier: StateClassifier,
    recovery: RecoveryDetector,
    window: TempWindow,
    config: Arc<ConfigStore>,
    telemetry: Arc<TelemetryStore>,
    bus: EventBus,
    reset_armed: bool,
    prev_state: MachineState,
    last_reload: Instant,
}

impl ControlLoop {
    pub fn new(
        probe: Box<dyn TemperatureProbe>,
        heater: Heater,
        config: Arc<ConfigStore>,
        telemetry: Arc<TelemetryStore>,
        bus: EventBus,
    ) -> Self {
        let cfg = config.snapshot();
        let gains = cfg.normal_gains();
        let engine = PidEngine::new(cfg.target_temperature, gains.kp, gains.ki, gains.kd, DUTY_MAX);
        Self {
            probe,
            heater,
            engine,
            pid_mode: PidMode::Normal,
            gains,
            supervisor: SafetySupervisor::new(),
            classifier: StateClassifier::new(),
            recovery: RecoveryDetector::new(),
            window: TempWindow::new(),
            config,
            telemetry,
            bus,
            reset_armed: false,
            prev_state: MachineState::Unknown,
            last_reload: Instant::now(),
        }
    }

    /// Run until `shutdown` is raised, then force the heater off and flush
    /// telemetry (each best-effort and independent).
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("control loop started");

        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.tick().await;
        }

        self.heater.off();
        if let Err(e) = self.telemetry.flush() {
            warn!(error = %e, "telemetry flush on shutdown failed");
        }
        info!("control loop stopped");
    }

    /// One control tick.
    pub async fn tick(&mut self) {
        if self.last_reload.elapsed() >= CONFIG_RELOAD_PERIOD {
            self.last_reload = Instant::now();
            match self.config.reload() {
                Ok(true) => info!("configuration reloaded from disk"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "configuration reload failed"),
            }
        }

        // One consistent snapshot for every step of this tick.
        let cfg = self.config.snapshot();
        let target = cfg.target_temperature;

        let reading = match self.probe.read().await {
            Ok(reading) => reading,
            Err(err) => {
                // Below the shutdown threshold the tick performs no new
                // write: the PWM hardware keeps the previously programmed
                // duty, and commanding on stale data would be worse.
                if self.supervisor.record_failure(&err) {
                    self.heater.off();
                }
                return;
            }
        };
        self.supervisor.record_success();

        let now_ms = reading.taken_at.timestamp_millis();
        self.window.push(now_ms, reading.temperature);

        if self.supervisor.check_overtemp(reading.temperature) {
            self.heater.off();
            return;
        }

        let desired_mode = self.recovery.update(&self.window, target, now_ms);
        if desired_mode != self.pid_mode {
            // Recovery tuning is structurally different from normal tuning:
            // full rebuild, integral discarded.
            self.pid_mode = desired_mode;
            self.gains = gains_for(desired_mode, &cfg);
            self.engine = PidEngine::new(
                target,
                self.gains.kp,
                self.gains.ki,
                self.gains.kd,
                DUTY_MAX,
            );
            info!(mode = %desired_mode, "pid engine rebuilt for gain profile");
        } else {
            let desired_gains = gains_for(self.pid_mode, &cfg);
            if desired_gains != self.gains || self.engine.setpoint() != target {
                self.gains = desired_gains;
                self.engine
                    .reconfigure(target, desired_gains.kp, desired_gains.ki, desired_gains.kd);
            }
        }

        // The engine always steps, even when the output will be overridden,
        // so the derivative history stays current.
        let mut duty_raw = self.engine.step(reading.temperature);

        let state = self.classifier.classify(
            reading.temperature,
            duty_raw / 2.55,
            target,
            &self.window,
            now_ms,
        );

        // One integral reset per heating cycle, on the off → heating edge.
        if self.prev_state == MachineState::Off
            && state == MachineState::Heating
            && !self.reset_armed
        {
            self.engine.reset();
            duty_raw = self.engine.step(reading.temperature);
            self.reset_armed = true;
        }
        if state == MachineState::Off {
            self.reset_armed = false;
        }

        let duty: u8 = if reading.temperature >= target {
            0
        } else {
            duty_raw.round().clamp(0.0, 255.0) as u8
        };
        if reading.temperature > target + OVERSHOOT_LOG_MARGIN {
            error!(
                temperature = reading.temperature,
                target, "EMERGENCY: extreme overshoot above setpoint"
            );
        }

        if let Err(e) = self.heater.write(duty) {
            warn!(error = %e, duty, "heater write failed; continuing best-effort");
        }

        if state != self.prev_state {
            self.prev_state = state;
            let updated_at = reading.taken_at;
            if let Err(e) = self.config.update(|c| {
                c.machine_state = state;
                c.machine_state_updated = Some(updated_at);
            }) {
                warn!(error = %e, "could not persist machine state snapshot");
            }
            info!(state = %state, "machine state change");
            self.bus.publish(Event::new(
                "crema-control::classifier",
                EventPayload::MachineState { state, updated_at },
            ));
        }

        if self.classifier.should_record(now_ms) {
            self.telemetry.enqueue(TelemetryRecord {
                temperature: reading.temperature,
                output_percent: duty_to_percent(duty),
                timestamp_ms: now_ms,
                pid_mode: self.pid_mode,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Accessors (for testing / external wiring)
    // -------------------------------------------------------------------------

    pub fn machine_state(&self) -> MachineState {
        self.classifier.state()
    }

    pub fn pid_mode(&self) -> PidMode {
        self.pid_mode
    }

    pub fn supervisor(&self) -> &SafetySupervisor {
        &self.supervisor
    }

    pub fn engine(&self) -> &PidEngine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crema_hal::sensor::SensorError;
    use crema_hal::sim::{BoilerSim, PlantProbe, RecordingPwm, ScriptedProbe};

    struct Rig {
        control: ControlLoop,
        duties: Arc<Mutex<Vec<u8>>>,
        config: Arc<ConfigStore>,
        telemetry: Arc<TelemetryStore>,
        _dir: tempfile::TempDir,
    }

    fn rig(probe: Box<dyn TemperatureProbe>) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::open(dir.path().join("config.json")).unwrap());
        let telemetry = Arc::new(TelemetryStore::open_in_memory().unwrap().with_batch_size(1));
        let pwm = RecordingPwm::new();
        let duties = pwm.log_handle();
        let control = ControlLoop::new(
            probe,
            Heater::new(Box::new(pwm)),
            Arc::clone(&config),
            Arc::clone(&telemetry),
            EventBus::default(),
        );
        Rig {
            control,
            duties,
            config,
            telemetry,
            _dir: dir,
        }
    }

    fn timeout() -> SensorError {
        SensorError::Timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn sensor_disconnect_shuts_down_on_fifth_failure() {
        let mut script: Vec<Result<f64, SensorError>> = vec![Ok(50.0), Ok(52.0)];
        script.extend((0..6).map(|_| Err(timeout())));
        script.push(Ok(54.0));
        let mut r = rig(Box::new(ScriptedProbe::new(script)));

        for _ in 0..2 {
            r.control.tick().await;
        }
        let writes_before_failures = r.duties.lock().unwrap().len();
        assert_eq!(writes_before_failures, 2);

        // Failures 1–4: no new writes at all.
        for _ in 0..4 {
            r.control.tick().await;
        }
        assert_eq!(r.duties.lock().unwrap().len(), writes_before_failures);

        // Failures 5 and 6: duty forced to 0 each tick.
        for _ in 0..2 {
            r.control.tick().await;
        }
        {
            let duties = r.duties.lock().unwrap();
            assert_eq!(&duties[writes_before_failures..], &[0, 0]);
        }
        assert!(r.control.supervisor().shutdown_latched());

        // A single valid reading clears the counter and control resumes.
        r.control.tick().await;
        assert_eq!(r.control.supervisor().consecutive_failures(), 0);
        assert!(*r.duties.lock().unwrap().last().unwrap() > 0);
    }

    #[tokio::test]
    async fn overtemp_forces_heater_off_and_latches() {
        let mut r = rig(Box::new(ScriptedProbe::from_temperatures([
            90.0, 165.0, 150.0,
        ])));

        r.control.tick().await; // normal
        r.control.tick().await; // emergency
        assert_eq!(*r.duties.lock().unwrap().last().unwrap(), 0);
        assert!(r.control.supervisor().shutdown_latched());

        // A valid reading below the limit clears the latch; 150 ≥ target 100
        // keeps the duty at 0 via the setpoint override.
        r.control.tick().await;
        assert!(!r.control.supervisor().shutdown_latched());
        assert_eq!(*r.duties.lock().unwrap().last().unwrap(), 0);
    }

    #[tokio::test]
    async fn at_or_above_setpoint_writes_zero() {
        let mut r = rig(Box::new(ScriptedProbe::from_temperatures([
            100.0, 104.0, 99.0,
        ])));
        r.control.tick().await;
        r.control.tick().await;
        r.control.tick().await;
        let duties = r.duties.lock().unwrap().clone();
        assert_eq!(duties[0], 0);
        assert_eq!(duties[1], 0);
        assert!(duties[2] > 0);
    }

    #[tokio::test]
    async fn integral_resets_once_on_heating_edge() {
        // 30 °C with drive classifies off (cold), 45 °C heating. Soft gains
        // keep the engine out of saturation so the integral is observable.
        let mut r = rig(Box::new(ScriptedProbe::from_temperatures([30.0, 45.0])));
        r.config
            .update(|c| {
                c.proportional = 0.5;
                c.integral = 1.0;
                c.derivative = 0.0;
            })
            .unwrap();

        r.control.tick().await; // error 70 → integral 70
        assert_eq!(r.control.machine_state(), MachineState::Off);
        assert_eq!(r.control.engine().integral(), 70.0);

        r.control.tick().await;
        assert_eq!(r.control.machine_state(), MachineState::Heating);
        // Without the off → heating reset the integral would be 125 (70 from
        // the first tick plus 55); the rebuilt engine holds one step only.
        assert_eq!(r.control.engine().integral(), 55.0);
    }

    #[tokio::test]
    async fn cold_start_reaches_setpoint_without_overshoot() {
        let plant = Arc::new(Mutex::new(BoilerSim::new(20.0)));
        let mut r = rig(Box::new(PlantProbe::new(Arc::clone(&plant))));

        let mut reached_at = None;
        let mut heating_at = None;
        let mut max_temp = f64::MIN;
        for tick in 0..600 {
            let before = plant.lock().unwrap().temperature();
            r.control.tick().await;
            let duty = *r.duties.lock().unwrap().last().unwrap();

            // Invariants checked on every tick.
            if before >= 100.0 {
                assert_eq!(duty, 0, "duty must be 0 at/above setpoint (tick {tick})");
            }
            if heating_at.is_none() && r.control.machine_state() == MachineState::Heating {
                heating_at = Some(tick);
            }

            let after = plant.lock().unwrap().step(duty);
            max_temp = max_temp.max(after);
            if reached_at.is_none() && (99.0..=101.0).contains(&after) {
                reached_at = Some(tick);
            }
        }

        assert!(heating_at.is_some_and(|t| t < 60), "heating not detected within 60 s");
        assert!(reached_at.is_some(), "setpoint band never reached within 10 min");
        assert!(max_temp <= 103.0, "overshoot exceeded +3 °C: {max_temp}");
    }

    #[tokio::test]
    async fn cold_refill_engages_recovery_gains() {
        // A minute steady at the setpoint, then an abrupt step to 80 °C.
        let mut temps: Vec<f64> = vec![100.0; 61];
        temps.extend([80.0, 81.0]);
        // Climb back into the exit band.
        temps.extend([96.0, 97.0]);
        let mut r = rig(Box::new(ScriptedProbe::from_temperatures(temps)));

        for _ in 0..61 {
            r.control.tick().await;
        }
        assert_eq!(r.control.pid_mode(), PidMode::Normal);

        r.control.tick().await; // 80.0 → drop of 20 from the window max
        assert_eq!(r.control.pid_mode(), PidMode::Recovery);
        r.control.tick().await;
        assert_eq!(r.control.pid_mode(), PidMode::Recovery);

        r.control.tick().await; // 96.0 ≥ target − 5
        assert_eq!(r.control.pid_mode(), PidMode::Normal);
    }

    #[tokio::test]
    async fn telemetry_records_carry_the_engine_mode() {
        let mut temps: Vec<f64> = vec![100.0; 61];
        temps.push(80.0);
        let mut r = rig(Box::new(ScriptedProbe::from_temperatures(temps)));
        for _ in 0..62 {
            r.control.tick().await;
        }

        let records = r.telemetry.history(1000, None).unwrap();
        assert!(!records.is_empty());
        let last = records.last().unwrap();
        assert_eq!(last.pid_mode, PidMode::Recovery);
        assert!((0.0..=100.0).contains(&last.output_percent));
    }

    #[tokio::test]
    async fn machine_state_is_persisted_on_change() {
        let mut r = rig(Box::new(ScriptedProbe::from_temperatures([99.0, 99.5])));
        r.control.tick().await;
        let snapshot = r.config.snapshot();
        assert_eq!(snapshot.machine_state, MachineState::Ready);
        assert!(snapshot.machine_state_updated.is_some());
    }

    #[tokio::test]
    async fn setpoint_changes_apply_at_the_next_tick() {
        let mut r = rig(Box::new(ScriptedProbe::from_temperatures([90.0, 90.0])));
        r.control.tick().await;
        assert!(*r.duties.lock().unwrap().last().unwrap() > 0);

        // Drop the target below the current temperature (as set_mode(off)
        // would); the very next tick must command 0.
        r.config.update(|c| c.target_temperature = 0.0).unwrap();
        r.control.tick().await;
        assert_eq!(*r.duties.lock().unwrap().last().unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_flushes_and_turns_heater_off() {
        let mut temps = vec![90.0; 3];
        temps.push(91.0);
        let r = rig(Box::new(ScriptedProbe::from_temperatures(temps)));
        let shutdown = Arc::new(AtomicBool::new(true));
        let duties = Arc::clone(&r.duties);

        r.control.run(shutdown).await;
        assert_eq!(*duties.lock().unwrap().last().unwrap(), 0);
    }
}
