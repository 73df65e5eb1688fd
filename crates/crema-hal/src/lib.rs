//! `crema-hal` – Hardware seam for the boiler control core.
//!
//! The rest of the system only ever talks to the traits defined here, so
//! drivers can be swapped (real hardware, a daemon socket, or a test double)
//! without touching control logic.
//!
//! # Modules
//!
//! - [`sensor`] – [`TemperatureProbe`][sensor::TemperatureProbe]: one
//!   validated Celsius sample per call, bounded by a hard deadline.
//!   [`DriverProbe`][sensor::DriverProbe] wraps the out-of-process
//!   thermocouple driver.
//! - [`heater`] – [`PwmOutput`][heater::PwmOutput] and
//!   [`Heater`][heater::Heater]: the 8-bit duty endpoint for the solid-state
//!   relay, with an infallible `off()` usable from every emergency path.
//! - [`pid`] – [`PidEngine`][pid::PidEngine]: discrete PID at a fixed 1 s
//!   sample period with saturation-aware integration.
//! - [`sim`] – headless test doubles: a first-order boiler plant model, a
//!   recording PWM endpoint, and a scripted probe.

pub mod heater;
pub mod pid;
pub mod sensor;
pub mod sim;

pub use heater::{Heater, PigpioPwm, PwmOutput};
pub use pid::{DUTY_MAX, PidEngine};
pub use sensor::{DriverProbe, SensorError, TemperatureProbe};
pub use sim::{BoilerSim, PlantProbe, RecordingPwm, ScriptedProbe};
