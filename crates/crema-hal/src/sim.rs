//! In-process simulation doubles for headless testing without a boiler.
//!
//! These stand in for the physical plant in CI: [`BoilerSim`] is a
//! first-order thermal model of the boiler, [`RecordingPwm`] captures every
//! duty the control loop commands, and [`ScriptedProbe`] replays a
//! prepared sequence of sensor outcomes (including failures).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use crema_types::{CoreError, Reading};

use crate::heater::PwmOutput;
use crate::sensor::{SensorError, TemperatureProbe};

// ────────────────────────────────────────────────────────────────────────────
// Boiler plant model
// ────────────────────────────────────────────────────────────────────────────

/// First-order thermal model of the boiler, stepped once per simulated
/// second.
///
/// At full duty the steady-state temperature is `ambient + heater_gain`;
/// with the heater off the boiler decays exponentially toward ambient with
/// the configured time constant.
#[derive(Debug, Clone)]
pub struct BoilerSim {
    temperature: f64,
    ambient: f64,
    time_constant_s: f64,
    heater_gain: f64,
}

impl BoilerSim {
    /// A boiler starting at `initial` °C in a 20 °C room, with a 60 s time
    /// constant and enough heater headroom to pass 160 °C at full duty.
    pub fn new(initial: f64) -> Self {
        Self {
            temperature: initial,
            ambient: 20.0,
            time_constant_s: 60.0,
            heater_gain: 150.0,
        }
    }

    /// Override the thermal time constant (builder-style).
    pub fn with_time_constant(mut self, seconds: f64) -> Self {
        self.time_constant_s = seconds;
        self
    }

    /// Advance one simulated second under the given duty; returns the new
    /// boiler temperature.
    pub fn step(&mut self, duty: u8) -> f64 {
        let drive = self.ambient + self.heater_gain * (duty as f64 / 255.0);
        self.temperature += (drive - self.temperature) / self.time_constant_s;
        self.temperature
    }

    /// Current boiler temperature in Celsius.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Force the boiler temperature, e.g. to inject a cold-water refill.
    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Recording PWM endpoint
// ────────────────────────────────────────────────────────────────────────────

/// [`PwmOutput`] test double that records every commanded duty. Always
/// succeeds. The log handle stays valid after the endpoint is boxed into a
/// `Heater`.
pub struct RecordingPwm {
    log: Arc<Mutex<Vec<u8>>>,
}

impl RecordingPwm {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the duty log.
    pub fn log_handle(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.log)
    }
}

impl Default for RecordingPwm {
    fn default() -> Self {
        Self::new()
    }
}

impl PwmOutput for RecordingPwm {
    fn set_duty(&mut self, duty: u8) -> Result<(), CoreError> {
        self.log.lock().expect("duty log poisoned").push(duty);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scripted probe
// ────────────────────────────────────────────────────────────────────────────

/// [`TemperatureProbe`] replaying a prepared sequence of outcomes, one per
/// `read()` call.
///
/// An exhausted script reports a driver failure, so a test that ticks too
/// often fails loudly instead of reusing stale samples.
pub struct ScriptedProbe {
    script: VecDeque<Result<f64, SensorError>>,
}

impl ScriptedProbe {
    pub fn new(script: impl IntoIterator<Item = Result<f64, SensorError>>) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }

    /// Convenience constructor for an all-success script.
    pub fn from_temperatures(temps: impl IntoIterator<Item = f64>) -> Self {
        Self::new(temps.into_iter().map(Ok))
    }

    /// Append one more outcome to the script.
    pub fn push(&mut self, outcome: Result<f64, SensorError>) {
        self.script.push_back(outcome);
    }
}

#[async_trait]
impl TemperatureProbe for ScriptedProbe {
    async fn read(&mut self) -> Result<Reading, SensorError> {
        match self.script.pop_front() {
            Some(Ok(temperature)) => Ok(Reading {
                temperature,
                taken_at: Utc::now(),
            }),
            Some(Err(e)) => Err(e),
            None => Err(SensorError::Process {
                code: None,
                stderr: "scripted probe exhausted".to_string(),
            }),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Plant-backed probe
// ────────────────────────────────────────────────────────────────────────────

/// [`TemperatureProbe`] reading the current temperature of a shared
/// [`BoilerSim`], for closed-loop tests where the test harness steps the
/// plant with the duties the loop commands.
pub struct PlantProbe {
    plant: Arc<Mutex<BoilerSim>>,
}

impl PlantProbe {
    pub fn new(plant: Arc<Mutex<BoilerSim>>) -> Self {
        Self { plant }
    }
}

#[async_trait]
impl TemperatureProbe for PlantProbe {
    async fn read(&mut self) -> Result<Reading, SensorError> {
        let temperature = self.plant.lock().expect("plant lock poisoned").temperature();
        Ok(Reading {
            temperature,
            taken_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boiler_heats_under_full_duty() {
        let mut sim = BoilerSim::new(20.0);
        for _ in 0..600 {
            sim.step(255);
        }
        // Steady state at full duty is ambient + gain = 170 °C.
        assert!(sim.temperature() > 160.0);
    }

    #[test]
    fn boiler_cools_toward_ambient_when_off() {
        let mut sim = BoilerSim::new(100.0);
        for _ in 0..600 {
            sim.step(0);
        }
        assert!(sim.temperature() < 25.0);
    }

    #[test]
    fn cold_start_passes_setpoint_within_ten_minutes() {
        let mut sim = BoilerSim::new(20.0);
        let mut reached = None;
        for tick in 0..600 {
            if sim.step(255) >= 100.0 {
                reached = Some(tick);
                break;
            }
        }
        assert!(reached.is_some(), "boiler never reached 100 °C at full duty");
    }

    #[tokio::test]
    async fn scripted_probe_replays_and_exhausts() {
        let mut probe = ScriptedProbe::new([
            Ok(93.0),
            Err(SensorError::Timeout(std::time::Duration::from_secs(5))),
        ]);
        assert!((probe.read().await.unwrap().temperature - 93.0).abs() < 1e-9);
        assert!(matches!(probe.read().await, Err(SensorError::Timeout(_))));
        assert!(matches!(
            probe.read().await,
            Err(SensorError::Process { .. })
        ));
    }

    #[tokio::test]
    async fn plant_probe_tracks_the_sim() {
        let plant = Arc::new(Mutex::new(BoilerSim::new(50.0)));
        let mut probe = PlantProbe::new(Arc::clone(&plant));
        assert!((probe.read().await.unwrap().temperature - 50.0).abs() < 1e-9);
        plant.lock().unwrap().step(255);
        assert!(probe.read().await.unwrap().temperature > 50.0);
    }
}
