use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Commanded operating regime of the machine.
///
/// Exactly one mode is active at any time. `Steam` carries the wall-clock
/// deadline at which the steam watchdog hands control back to espresso;
/// "time remaining" is always derived as `deadline - now` rather than kept
/// in a separate counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    Off,
    Espresso,
    Steam { deadline: Instant },
}

impl Mode {
    /// The serializable tag of this mode, without the steam deadline.
    pub fn kind(&self) -> ModeKind {
        match self {
            Mode::Off => ModeKind::Off,
            Mode::Espresso => ModeKind::Espresso,
            Mode::Steam { .. } => ModeKind::Steam,
        }
    }

    /// Seconds until the steam watchdog fires, `None` outside steam mode.
    pub fn steam_remaining(&self, now: Instant) -> Option<Duration> {
        match self {
            Mode::Steam { deadline } => Some(deadline.saturating_duration_since(now)),
            _ => None,
        }
    }
}

/// Wire form of [`Mode`], used in events, API responses, and the config
/// document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeKind {
    Off,
    Espresso,
    Steam,
}

impl std::fmt::Display for ModeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModeKind::Off => write!(f, "off"),
            ModeKind::Espresso => write!(f, "espresso"),
            ModeKind::Steam => write!(f, "steam"),
        }
    }
}

/// Observed machine state, derived from temperature history and commanded
/// output. Distinct from [`Mode`]: the operator commands a mode, the
/// classifier reports a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Off,
    Heating,
    Ready,
    #[default]
    Unknown,
}

impl MachineState {
    /// Short operator-facing description of the state.
    pub fn description(&self) -> &'static str {
        match self {
            MachineState::Off => "machine is off or not responding to heat",
            MachineState::Heating => "boiler is heating toward the setpoint",
            MachineState::Ready => "boiler is at temperature",
            MachineState::Unknown => "not enough samples to classify yet",
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Off => write!(f, "off"),
            MachineState::Heating => write!(f, "heating"),
            MachineState::Ready => write!(f, "ready"),
            MachineState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Active PID gain profile.
///
/// `Recovery` is a temporary, more aggressive profile engaged when the
/// boiler temperature drops abruptly below setpoint (e.g. a cold-water
/// refill).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PidMode {
    Normal,
    Recovery,
}

impl std::fmt::Display for PidMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PidMode::Normal => write!(f, "normal"),
            PidMode::Recovery => write!(f, "recovery"),
        }
    }
}

/// One gain triple. Two sets are carried in configuration (normal and
/// recovery); the control loop picks the active one via [`PidMode`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

/// A single validated temperature sample. Ephemeral: produced by the sensor,
/// consumed once by the control loop within the same tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Boiler temperature in Celsius.
    pub temperature: f64,
    /// Wall-clock instant the sample was taken.
    pub taken_at: DateTime<Utc>,
}

/// One persisted telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Boiler temperature in Celsius.
    pub temperature: f64,
    /// Commanded heater output as a percentage in `[0, 100]`.
    pub output_percent: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Gain profile the engine was running when this sample was taken.
    pub pid_mode: PidMode,
}

/// Convert an 8-bit PWM duty to a percentage in `[0, 100]`.
pub fn duty_to_percent(duty: u8) -> f64 {
    duty as f64 / 2.55
}

/// Why a mode transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeChangeReason {
    /// An operator command via the command interface.
    Manual,
    /// The steam watchdog expired and handed control back to espresso.
    SteamTimeout,
}

/// Unified event wrapper published on the internal broadcast bus for the
/// external real-time push layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"crema-control::mode"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Construct an event with a fresh UUID and the current UTC timestamp.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// The commanded mode changed.
    ModeChange {
        mode: ModeKind,
        reason: ModeChangeReason,
    },
    /// The observed machine state changed.
    MachineState {
        state: MachineState,
        updated_at: DateTime<Utc>,
    },
}

/// Global error type spanning hardware faults and store failures.
///
/// Subsystems with richer failure taxonomies (the sensor driver, the config
/// store) define their own error enums and convert at the boundary.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("hardware fault on {component}: {details}")]
    Hardware { component: String, details: String },

    #[error("configuration store error: {0}")]
    Config(String),

    #[error("telemetry store error: {0}")]
    Telemetry(String),

    #[error("validation error: {0}")]
    Validation(String),
}
