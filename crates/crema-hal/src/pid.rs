//! Discrete PID engine for the boiler heater.
//!
//! The engine computes an 8-bit-range duty that drives the measured boiler
//! temperature toward the setpoint. It is deliberately hardware-agnostic:
//! the caller supplies the measurement once per second and applies the
//! returned duty to whatever actuator it owns.
//!
//! The sample period is fixed at 1 s, so the integral accumulates in plain
//! error-units and the derivative is a backward difference of consecutive
//! errors. While the output is saturated, the integral does not accumulate
//! further in the saturated direction (anti-windup).
//!
//! # Example
//!
//! ```rust
//! use crema_hal::pid::{DUTY_MAX, PidEngine};
//!
//! let mut pid = PidEngine::new(100.0, 4.0, 0.1, 5.0, DUTY_MAX);
//! let duty = pid.step(20.0); // far below setpoint
//! assert_eq!(duty, DUTY_MAX); // saturated high
//! ```

/// Upper output bound matching the 8-bit PWM duty range.
pub const DUTY_MAX: f64 = 255.0;

/// A tunable PID engine for the 1 Hz boiler control loop.
///
/// Allocation-free after construction. A gain-profile swap (normal ↔
/// recovery) is modeled by the caller as a fresh [`PidEngine::new`]; the
/// integral is deliberately discarded because the two tunings are
/// structurally different. In-place setpoint and gain updates that should
/// keep the accumulated state use [`PidEngine::reconfigure`].
#[derive(Debug, Clone)]
pub struct PidEngine {
    setpoint: f64,
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    last_error: Option<f64>,
    out_max: f64,
}

impl PidEngine {
    /// Create a new engine with the given setpoint and gains.
    ///
    /// `out_max` is the upper output clamp; the lower clamp is always 0
    /// (the heater cannot cool).
    pub fn new(setpoint: f64, kp: f64, ki: f64, kd: f64, out_max: f64) -> Self {
        Self {
            setpoint,
            kp,
            ki,
            kd,
            integral: 0.0,
            last_error: None,
            out_max,
        }
    }

    /// Compute the next duty for `measurement`, clamped to `[0, out_max]`.
    pub fn step(&mut self, measurement: f64) -> f64 {
        let error = self.setpoint - measurement;

        let p = self.kp * error;
        let d = match self.last_error {
            Some(prev) => self.kd * (error - prev),
            None => 0.0,
        };
        self.last_error = Some(error);

        // Tentative integral for this step; kept only if the output is not
        // pushing further into saturation.
        let candidate = self.integral + error;
        let unclamped = p + self.ki * candidate + d;
        let saturating = (unclamped > self.out_max && error > 0.0)
            || (unclamped < 0.0 && error < 0.0);
        if !saturating {
            self.integral = candidate;
        }

        (p + self.ki * self.integral + d).clamp(0.0, self.out_max)
    }

    /// Zero the integral accumulator and the derivative memory.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }

    /// Swap setpoint and gains in place, preserving the accumulated
    /// integral and derivative history.
    pub fn reconfigure(&mut self, setpoint: f64, kp: f64, ki: f64, kd: f64) {
        self.setpoint = setpoint;
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    /// The current setpoint in Celsius.
    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    /// The accumulated integral, in error-units.
    pub fn integral(&self) -> f64 {
        self.integral
    }
}
