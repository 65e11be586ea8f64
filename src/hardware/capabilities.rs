//! Instrument Capabilities
//!
//! The measurement pipeline never talks to hardware directly. It drives instruments
//! through the small capability traits defined here:
//!
//! - [`Connection`]: attach to / detach from a resource and report identity
//! - [`SourceMeter`]: a programmable voltage source with a current readback
//! - [`PowerMeter`]: an optical power meter used in P-I-V runs
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Takes `&self`; implementors use interior mutability for state
//! - Reports failures as [`DaqError::Connection`] at connect time and
//!   [`DaqError::InstrumentFault`] afterwards
//!
//! # Example
//!
//! ```rust,ignore
//! async fn bias_point<S: SourceMeter + ?Sized>(smu: &S, volts: f64) -> AppResult<f64> {
//!     smu.prepare_for_sweep(0.01).await?;
//!     smu.set_output_voltage(volts).await?;
//!     let reading = smu.read_measurement().await?;
//!     smu.output_off().await?;
//!     Ok(reading.current_amps)
//! }
//! ```
//!
//! [`DaqError::Connection`]: crate::error::DaqError::Connection
//! [`DaqError::InstrumentFault`]: crate::error::DaqError::InstrumentFault

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One readback from a source-meter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Measured current in amps
    pub current_amps: f64,
    /// Measured voltage in volts, when the instrument reports it
    pub voltage_volts: Option<f64>,
}

impl Reading {
    /// Measured voltage, or the commanded one when the instrument only reported current.
    pub fn voltage_or(&self, commanded: f64) -> f64 {
        self.voltage_volts.unwrap_or(commanded)
    }
}

/// One readback from a power meter.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerReading {
    /// Optical power in watts
    pub watts: f64,
    /// Unit string reported by the instrument
    pub unit: String,
}

/// Power meter setup applied before a P-I-V run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerMeterSettings {
    /// Correction wavelength in nanometres
    #[serde(default = "default_wavelength")]
    pub wavelength_nm: f64,
    /// Let the meter pick its range
    #[serde(default = "default_auto_range")]
    pub auto_range: bool,
    /// Fixed range in watts, required when `auto_range` is off
    #[serde(default)]
    pub manual_range_watts: Option<f64>,
}

fn default_wavelength() -> f64 {
    633.0
}

fn default_auto_range() -> bool {
    true
}

impl Default for PowerMeterSettings {
    fn default() -> Self {
        Self {
            wavelength_nm: default_wavelength(),
            auto_range: default_auto_range(),
            manual_range_watts: None,
        }
    }
}

impl PowerMeterSettings {
    /// Reject settings no meter can apply.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.wavelength_nm.is_finite() && self.wavelength_nm > 0.0) {
            return Err(DaqError::Configuration(format!(
                "Wavelength must be positive, got {} nm",
                self.wavelength_nm
            )));
        }
        if !self.auto_range && self.manual_range_watts.is_none() {
            return Err(DaqError::Configuration(
                "Manual range must be specified when auto range is off".to_string(),
            ));
        }
        Ok(())
    }
}

/// Capability: Resource Connection
///
/// Resource discovery is the caller's business; implementors only open the resource
/// they are given.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open the instrument at `resource`.
    ///
    /// # Errors
    /// [`DaqError::Connection`] if the resource is unreachable. The instrument stays
    /// disconnected.
    async fn connect(&self, resource: &str) -> AppResult<()>;

    /// Release the instrument. A no-op when not connected.
    async fn disconnect(&self) -> AppResult<()>;

    /// Whether [`Connection::connect`] succeeded and no disconnect happened since.
    fn is_connected(&self) -> bool;

    /// Instrument identification string.
    async fn identity(&self) -> AppResult<String>;
}

/// Capability: Voltage Source with Current Measurement
///
/// # Contract
/// - `prepare_for_sweep` resets the instrument, selects voltage-source mode with the given
///   current compliance and auto-ranged current sense, and enables the output
/// - `set_output_voltage` changes the output immediately
/// - `read_measurement` returns current and, when supported, the measured voltage
/// - `output_off` and `shutdown` must be safe to call repeatedly and on a faulted
///   instrument; callers treat their errors as best-effort
#[async_trait]
pub trait SourceMeter: Connection {
    /// Configure as a voltage source limited to `compliance_amps` and enable output.
    async fn prepare_for_sweep(&self, compliance_amps: f64) -> AppResult<()>;

    /// Command the instantaneous source voltage.
    async fn set_output_voltage(&self, volts: f64) -> AppResult<()>;

    /// Read back the measured current (and voltage, if available).
    async fn read_measurement(&self) -> AppResult<Reading>;

    /// Disable the source output.
    async fn output_off(&self) -> AppResult<()>;

    /// Return to a safe idle state and release remote control.
    async fn shutdown(&self) -> AppResult<()>;
}

/// Capability: Optical Power Readout
#[async_trait]
pub trait PowerMeter: Connection {
    /// Apply wavelength and range settings.
    async fn configure(&self, settings: &PowerMeterSettings) -> AppResult<()>;

    /// Read optical power.
    async fn read_power(&self) -> AppResult<PowerReading>;

    /// Return the meter to its idle state after a run.
    ///
    /// # Default Implementation
    /// Power meters have nothing to de-energize; does nothing.
    async fn cleanup(&self) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_falls_back_to_commanded_voltage() {
        let full = Reading {
            current_amps: 1e-3,
            voltage_volts: Some(0.498),
        };
        let current_only = Reading {
            current_amps: 1e-3,
            voltage_volts: None,
        };
        assert_eq!(full.voltage_or(0.5), 0.498);
        assert_eq!(current_only.voltage_or(0.5), 0.5);
    }

    #[test]
    fn manual_range_requires_value() {
        let settings = PowerMeterSettings {
            auto_range: false,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = PowerMeterSettings {
            auto_range: false,
            manual_range_watts: Some(1e-3),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }
}
