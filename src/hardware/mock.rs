//! Mock Hardware Implementations
//!
//! Simulated instruments for running sweeps without physical hardware and for verifying
//! the measurement pipeline's cleanup contract in tests.
//!
//! # Available Mocks
//!
//! - `MockSourceMeter` - ohmic device under test behind a source-meter, with compliance
//!   clamping, call logging and fault injection
//! - `MockPowerMeter` - optical power meter, either constant or tracking a source-meter's
//!   current, with failing-read injection
//!
//! Both record every capability call in a call log (e.g. `"set:0.5"`, `"output_off"`),
//! which tests use to assert what reached the instrument and in which order.

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    Connection, PowerMeter, PowerMeterSettings, PowerReading, Reading, SourceMeter,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Shared, poison-tolerant call log.
#[derive(Debug, Clone, Default)]
struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, call: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.into());
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// `f64` stored in an `AtomicU64`.
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }
}

// =============================================================================
// MockSourceMeter - Simulated Source-Measure Unit
// =============================================================================

/// Mock source-meter driving a resistor.
///
/// Simulates:
/// - Ohmic current `V / R`, clamped to the configured compliance
/// - Zero current while the output is disabled
/// - Optional per-command latency
/// - A fault on the Nth voltage command, on setup, or on shutdown
///
/// # Example
///
/// ```rust,ignore
/// let smu = MockSourceMeter::new("smu").with_resistance(200.0);
/// smu.connect("SIM::SMU").await?;
/// smu.prepare_for_sweep(0.01).await?;
/// smu.set_output_voltage(0.4).await?;
/// assert_eq!(smu.read_measurement().await?.current_amps, 0.002);
/// ```
pub struct MockSourceMeter {
    name: String,
    resistance_ohms: f64,
    reports_voltage: bool,
    latency: Duration,
    fail_on_command: Option<usize>,
    fail_prepare: bool,
    fail_shutdown: bool,
    connected: AtomicBool,
    output_enabled: AtomicBool,
    voltage: AtomicF64,
    compliance_amps: AtomicF64,
    commands: AtomicUsize,
    call_log: CallLog,
}

impl MockSourceMeter {
    /// Create a disconnected mock with a 1 kΩ load.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resistance_ohms: 1000.0,
            reports_voltage: true,
            latency: Duration::ZERO,
            fail_on_command: None,
            fail_prepare: false,
            fail_shutdown: false,
            connected: AtomicBool::new(false),
            output_enabled: AtomicBool::new(false),
            voltage: AtomicF64::new(0.0),
            compliance_amps: AtomicF64::new(0.1),
            commands: AtomicUsize::new(0),
            call_log: CallLog::default(),
        }
    }

    /// Set the simulated load resistance in ohms.
    pub fn with_resistance(mut self, ohms: f64) -> Self {
        self.resistance_ohms = ohms;
        self
    }

    /// Report current only, forcing callers to substitute the commanded voltage.
    pub fn current_only(mut self) -> Self {
        self.reports_voltage = false;
        self
    }

    /// Delay every voltage command and readback.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the `n`th (1-based) `set_output_voltage` call.
    pub fn fail_on_voltage_command(mut self, n: usize) -> Self {
        self.fail_on_command = Some(n);
        self
    }

    /// Fail `prepare_for_sweep`, after the output has been switched on.
    pub fn fail_on_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    /// Fail every `shutdown` call. `output_off` keeps working.
    pub fn fail_on_shutdown(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }

    /// Instrument name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the simulated output is currently energized.
    pub fn is_output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::SeqCst)
    }

    /// Last commanded voltage.
    pub fn voltage(&self) -> f64 {
        self.voltage.get()
    }

    /// Current the simulated load draws right now, in amps.
    pub fn load_current(&self) -> f64 {
        if !self.is_output_enabled() {
            return 0.0;
        }
        let limit = self.compliance_amps.get().abs();
        (self.voltage.get() / self.resistance_ohms).clamp(-limit, limit)
    }

    /// Copy of the call log.
    pub fn calls(&self) -> Vec<String> {
        self.call_log.snapshot()
    }

    /// Number of logged calls starting with `prefix`.
    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DaqError::fault(format!("{}: not connected", self.name)))
        }
    }
}

#[async_trait]
impl Connection for MockSourceMeter {
    async fn connect(&self, resource: &str) -> AppResult<()> {
        self.call_log.push(format!("connect:{}", resource));
        if resource.is_empty() {
            return Err(DaqError::Connection(format!(
                "{}: empty resource name",
                self.name
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> AppResult<()> {
        self.call_log.push("disconnect");
        self.output_enabled.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn identity(&self) -> AppResult<String> {
        self.ensure_connected()?;
        Ok(format!("MOCK,SourceMeter {},0,1.0", self.name))
    }
}

#[async_trait]
impl SourceMeter for MockSourceMeter {
    async fn prepare_for_sweep(&self, compliance_amps: f64) -> AppResult<()> {
        self.call_log.push(format!("prepare:{}", compliance_amps));
        self.ensure_connected()?;
        self.compliance_amps.set(compliance_amps);
        self.voltage.set(0.0);
        self.output_enabled.store(true, Ordering::SeqCst);
        if self.fail_prepare {
            return Err(DaqError::fault(format!(
                "{}: simulated setup failure",
                self.name
            )));
        }
        Ok(())
    }

    async fn set_output_voltage(&self, volts: f64) -> AppResult<()> {
        self.call_log.push(format!("set:{}", volts));
        self.ensure_connected()?;
        let n = self.commands.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_command == Some(n) {
            return Err(DaqError::fault(format!(
                "{}: simulated fault on voltage command {}",
                self.name, n
            )));
        }
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        self.voltage.set(volts);
        Ok(())
    }

    async fn read_measurement(&self) -> AppResult<Reading> {
        self.call_log.push("read");
        self.ensure_connected()?;
        let reading = Reading {
            current_amps: self.load_current(),
            voltage_volts: self.reports_voltage.then(|| self.voltage.get()),
        };
        debug!(name = %self.name, ?reading, "mock source-meter read");
        Ok(reading)
    }

    async fn output_off(&self) -> AppResult<()> {
        self.call_log.push("output_off");
        self.output_enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> AppResult<()> {
        self.call_log.push("shutdown");
        if self.fail_shutdown {
            return Err(DaqError::fault(format!(
                "{}: simulated shutdown failure",
                self.name
            )));
        }
        self.output_enabled.store(false, Ordering::SeqCst);
        self.voltage.set(0.0);
        Ok(())
    }
}

// =============================================================================
// MockPowerMeter - Simulated Optical Power Meter
// =============================================================================

/// Mock optical power meter.
///
/// Reports a constant power, or `efficiency * current` of a tracked source-meter to mimic
/// the light output of an LED or laser diode under test.
pub struct MockPowerMeter {
    source: Option<Arc<MockSourceMeter>>,
    efficiency_w_per_a: f64,
    constant_watts: f64,
    fail_reads: bool,
    connected: AtomicBool,
    reads: AtomicUsize,
    call_log: CallLog,
}

impl MockPowerMeter {
    /// Meter that always reads `watts`.
    pub fn constant(watts: f64) -> Self {
        Self {
            source: None,
            efficiency_w_per_a: 0.0,
            constant_watts: watts,
            fail_reads: false,
            connected: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            call_log: CallLog::default(),
        }
    }

    /// Meter whose reading follows the current of `source`.
    pub fn tracking(source: Arc<MockSourceMeter>, efficiency_w_per_a: f64) -> Self {
        Self {
            source: Some(source),
            efficiency_w_per_a,
            ..Self::constant(0.0)
        }
    }

    /// Make every `read_power` call fail.
    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    /// Number of `read_power` calls so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Copy of the call log.
    pub fn calls(&self) -> Vec<String> {
        self.call_log.snapshot()
    }
}

#[async_trait]
impl Connection for MockPowerMeter {
    async fn connect(&self, resource: &str) -> AppResult<()> {
        self.call_log.push(format!("connect:{}", resource));
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> AppResult<()> {
        self.call_log.push("disconnect");
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn identity(&self) -> AppResult<String> {
        Ok("Thorlabs PM100D - Simulated".to_string())
    }
}

#[async_trait]
impl PowerMeter for MockPowerMeter {
    async fn configure(&self, settings: &PowerMeterSettings) -> AppResult<()> {
        self.call_log
            .push(format!("configure:{}", settings.wavelength_nm));
        if !self.is_connected() {
            return Err(DaqError::fault("power meter not connected"));
        }
        Ok(())
    }

    async fn read_power(&self) -> AppResult<PowerReading> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.call_log.push("read_power");
        if self.fail_reads {
            return Err(DaqError::fault("simulated power meter timeout"));
        }
        if !self.is_connected() {
            return Err(DaqError::fault("power meter not connected"));
        }
        let watts = match &self.source {
            Some(source) => source.load_current().abs() * self.efficiency_w_per_a,
            None => self.constant_watts,
        };
        Ok(PowerReading {
            watts,
            unit: "W".to_string(),
        })
    }

    async fn cleanup(&self) -> AppResult<()> {
        self.call_log.push("cleanup");
        Ok(())
    }
}
