//! `crema-api` – Transport-agnostic command interface.
//!
//! The surface the external HTTP layer binds to URLs. Each operation
//! validates its inputs, touches the core only through the [`ConfigStore`]
//! and the [`ModeController`] (both safe for concurrent access from
//! request-serving threads), and returns a serializable result or a typed
//! failure. Parsing, authentication, and envelope formatting belong to the
//! HTTP edge, not here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crema_control::ModeController;
use crema_store::{ConfigStore, TelemetryStore};
use crema_types::{CoreError, MachineState, ModeKind, TelemetryRecord};

/// Inclusive bounds for `history` limits.
const HISTORY_LIMIT_MAX: usize = 10_000;

/// Typed failures surfaced to the HTTP edge.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request was well-formed but a value was out of range or unknown.
    #[error("validation failure: {0}")]
    Validation(String),

    /// The core could not complete an otherwise valid request.
    #[error("internal failure: {0}")]
    Internal(String),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => ApiError::Validation(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Result of `set_mode`.
#[derive(Debug, Clone, Serialize)]
pub struct ModeResult {
    pub mode: ModeKind,
    pub target: f64,
}

/// Result of `get_mode`.
#[derive(Debug, Clone, Serialize)]
pub struct ModeStatus {
    pub mode: ModeKind,
    pub target: f64,
    pub espresso_temperature: f64,
    pub steam_temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steam_remaining: Option<f64>,
    pub machine_state: MachineState,
}

/// Result of `set_target`.
#[derive(Debug, Clone, Serialize)]
pub struct TargetResult {
    pub target: f64,
    pub mode: ModeKind,
}

/// Result of `set_gains`.
#[derive(Debug, Clone, Serialize)]
pub struct GainsResult {
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
}

/// Result of `set_gain`.
#[derive(Debug, Clone, Serialize)]
pub struct GainResult {
    pub name: String,
    pub value: f64,
}

/// Result of `get_state`.
#[derive(Debug, Clone, Serialize)]
pub struct StateResult {
    pub machine_state: MachineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub description: &'static str,
}

/// The command surface consumed by the HTTP edge.
pub struct CommandInterface {
    config: Arc<ConfigStore>,
    modes: Arc<ModeController>,
    telemetry: Arc<TelemetryStore>,
}

impl CommandInterface {
    pub fn new(
        config: Arc<ConfigStore>,
        modes: Arc<ModeController>,
        telemetry: Arc<TelemetryStore>,
    ) -> Self {
        Self {
            config,
            modes,
            telemetry,
        }
    }

    /// Command a mode change; steam accepts an optional duration in seconds.
    pub fn set_mode(
        &self,
        mode: ModeKind,
        duration_secs: Option<u64>,
    ) -> Result<ModeResult, ApiError> {
        let update = self.modes.set_mode(mode, duration_secs)?;
        Ok(ModeResult {
            mode: update.mode,
            target: update.target,
        })
    }

    /// The commanded mode, active and preferred setpoints, steam time
    /// remaining, and the observed machine state.
    pub fn get_mode(&self) -> ModeStatus {
        let cfg = self.config.snapshot();
        ModeStatus {
            mode: self.modes.current().kind(),
            target: cfg.target_temperature,
            espresso_temperature: cfg.espresso_temperature,
            steam_temperature: cfg.steam_temperature,
            steam_remaining: self.modes.steam_remaining(),
            machine_state: cfg.machine_state,
        }
    }

    /// Set the active setpoint (and the current mode's preference).
    pub fn set_target(&self, target: f64) -> Result<TargetResult, ApiError> {
        let update = self.modes.set_target(target)?;
        Ok(TargetResult {
            target: update.target,
            mode: update.mode,
        })
    }

    /// Set the normal gain triple; the control loop picks it up at the next
    /// tick boundary.
    pub fn set_gains(&self, p: f64, i: f64, d: f64) -> Result<GainsResult, ApiError> {
        validate_gain("proportional", p, 10.0)?;
        validate_gain("integral", i, 5.0)?;
        validate_gain("derivative", d, 100.0)?;
        self.config
            .update(|c| {
                c.proportional = p;
                c.integral = i;
                c.derivative = d;
            })
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(GainsResult {
            proportional: p,
            integral: i,
            derivative: d,
        })
    }

    /// Set a single gain by name, normal or recovery.
    pub fn set_gain(&self, name: &str, value: f64) -> Result<GainResult, ApiError> {
        let cap = match name {
            "proportional" | "recovery_proportional" => 10.0,
            "integral" | "recovery_integral" => 5.0,
            "derivative" | "recovery_derivative" => 100.0,
            other => {
                return Err(ApiError::Validation(format!("unknown gain name {other:?}")));
            }
        };
        validate_gain(name, value, cap)?;
        self.config
            .update(|c| match name {
                "proportional" => c.proportional = value,
                "integral" => c.integral = value,
                "derivative" => c.derivative = value,
                "recovery_proportional" => c.recovery_proportional = value,
                "recovery_integral" => c.recovery_integral = value,
                "recovery_derivative" => c.recovery_derivative = value,
                _ => unreachable!("gain name validated above"),
            })
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(GainResult {
            name: name.to_string(),
            value,
        })
    }

    /// Up to `limit` most-recent telemetry records, ascending by timestamp.
    pub fn history(&self, limit: usize) -> Result<Vec<TelemetryRecord>, ApiError> {
        if !(1..=HISTORY_LIMIT_MAX).contains(&limit) {
            return Err(ApiError::Validation(format!(
                "history limit {limit} outside [1, {HISTORY_LIMIT_MAX}]"
            )));
        }
        // Surface the freshest samples: push any buffered batch down first.
        if let Err(e) = self.telemetry.flush() {
            warn!(error = %e, "telemetry flush before history query failed");
        }
        self.telemetry
            .history(limit, None)
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    /// The classifier snapshot with its timestamp and description.
    pub fn get_state(&self) -> StateResult {
        let cfg = self.config.snapshot();
        StateResult {
            machine_state: cfg.machine_state,
            updated_at: cfg.machine_state_updated,
            description: cfg.machine_state.description(),
        }
    }
}

fn validate_gain(name: &str, value: f64, cap: f64) -> Result<(), ApiError> {
    if !(0.0..=cap).contains(&value) {
        return Err(ApiError::Validation(format!(
            "{name} {value} outside [0, {cap}]"
        )));
    }
    Ok(())
}
