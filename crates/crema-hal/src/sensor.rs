//! Boiler temperature acquisition.
//!
//! The thermocouple chip is read by an out-of-process driver that prints a
//! single decimal Celsius value on stdout and exits 0. The driver
//! occasionally hangs on I²C bus contention, so every read is bounded by a
//! hard deadline and a driver that outlives it is killed rather than left
//! running.
//!
//! Driver exit codes: 1 = general I²C/sensor fault, 2 = reading outside the
//! chip's plausible range, 3 = missing driver environment. All non-zero
//! codes surface as [`SensorError::Process`] with the captured stderr.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crema_types::Reading;

/// Lowest plausible boiler temperature in Celsius.
pub const MIN_TEMP: f64 = 0.0;
/// Highest plausible thermocouple reading in Celsius.
pub const MAX_TEMP_READING: f64 = 200.0;
/// Hard deadline for a single driver invocation.
pub const TEMP_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure taxonomy for a single sensor read.
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("sensor driver exceeded the {0:?} read deadline")]
    Timeout(Duration),

    #[error("sensor driver failed (exit code {code:?}): {stderr}")]
    Process { code: Option<i32>, stderr: String },

    #[error("sensor driver produced unparseable output: {output:?}")]
    Parse { output: String },

    #[error("temperature {value} outside valid range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },
}

/// Source of validated temperature samples.
///
/// One call produces one [`Reading`] or a typed failure; a failed call has
/// no side effects beyond consuming the in-flight driver invocation.
#[async_trait]
pub trait TemperatureProbe: Send {
    async fn read(&mut self) -> Result<Reading, SensorError>;
}

/// [`TemperatureProbe`] backed by the out-of-process thermocouple driver.
///
/// # Example
///
/// ```rust,no_run
/// use crema_hal::sensor::{DriverProbe, TemperatureProbe};
///
/// # async fn demo() {
/// let mut probe = DriverProbe::new("read-boiler-temp");
/// let reading = probe.read().await.expect("driver reachable");
/// println!("boiler at {:.1} °C", reading.temperature);
/// # }
/// ```
pub struct DriverProbe {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl DriverProbe {
    /// Create a probe invoking `command` with no arguments and the default
    /// [`TEMP_READ_TIMEOUT`].
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            timeout: TEMP_READ_TIMEOUT,
        }
    }

    /// Pass extra arguments to the driver (builder-style).
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Override the read deadline (builder-style).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TemperatureProbe for DriverProbe {
    async fn read(&mut self) -> Result<Reading, SensorError> {
        // kill_on_drop reaps the child when the deadline future wins the
        // race, so a wedged driver never survives past the timeout.
        let output = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| SensorError::Timeout(self.timeout))?
            .map_err(|e| SensorError::Process {
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SensorError::Process {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = stdout.trim();
        let value: f64 = text.parse().map_err(|_| SensorError::Parse {
            output: text.to_string(),
        })?;

        if !(MIN_TEMP..=MAX_TEMP_READING).contains(&value) {
            return Err(SensorError::OutOfRange {
                value,
                min: MIN_TEMP,
                max: MAX_TEMP_READING,
            });
        }

        debug!(temperature = value, "sensor read ok");
        Ok(Reading {
            temperature: value,
            taken_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_probe(value: &str) -> DriverProbe {
        DriverProbe::new("echo").with_args([value])
    }

    #[tokio::test]
    async fn valid_reading_is_returned() {
        let reading = echo_probe("93.5").read().await.unwrap();
        assert!((reading.temperature - 93.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn boundary_readings_accepted() {
        assert!(echo_probe("0.0").read().await.is_ok());
        assert!(echo_probe("200.0").read().await.is_ok());
    }

    #[tokio::test]
    async fn out_of_range_readings_rejected() {
        let err = echo_probe("-0.1").read().await.unwrap_err();
        assert!(matches!(err, SensorError::OutOfRange { value, .. } if value == -0.1));

        let err = echo_probe("200.1").read().await.unwrap_err();
        assert!(matches!(err, SensorError::OutOfRange { value, .. } if value == 200.1));
    }

    #[tokio::test]
    async fn unparseable_output_is_a_parse_error() {
        let err = echo_probe("not-a-number").read().await.unwrap_err();
        assert!(matches!(err, SensorError::Parse { .. }));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_process_error() {
        let err = DriverProbe::new("false").read().await.unwrap_err();
        assert!(matches!(err, SensorError::Process { code: Some(1), .. }));
    }

    #[tokio::test]
    async fn missing_driver_is_a_process_error() {
        let err = DriverProbe::new("/nonexistent/thermocouple-driver")
            .read()
            .await
            .unwrap_err();
        assert!(matches!(err, SensorError::Process { code: None, .. }));
    }

    #[tokio::test]
    async fn hung_driver_hits_the_deadline() {
        let err = DriverProbe::new("sleep")
            .with_args(["5"])
            .with_timeout(Duration::from_millis(50))
            .read()
            .await
            .unwrap_err();
        assert!(matches!(err, SensorError::Timeout(_)));
    }
}
