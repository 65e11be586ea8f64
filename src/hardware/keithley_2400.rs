//! Keithley 2400/2450 SourceMeter Driver
//!
//! Protocol Overview:
//! - SCPI over any [`ScpiTransport`]
//! - `:READ?` replies `current,voltage[,...]`, optionally with `A`/`V` unit suffixes
//! - `SYSTEM:KEY 23` presses the LOCAL key, returning the front panel to the operator
//! - Every command or query holds the bus lock; multi-command sequences (setup,
//!   shutdown) hold it from their first command to their last
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let smu = Keithley2400::new(transport);
//! smu.connect("GPIB0::24::INSTR").await?;
//! smu.prepare_for_sweep(0.01).await?;
//! smu.set_output_voltage(0.5).await?;
//! let reading = smu.read_measurement().await?;
//! smu.shutdown().await?;
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Connection, Reading, SourceMeter};
use crate::hardware::scpi::{parse_field, ScpiTransport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info};

/// Driver for Keithley 2400-series source-meters.
pub struct Keithley2400 {
    transport: Arc<dyn ScpiTransport>,
    /// Serializes access to the transport
    bus: Mutex<()>,
    connected: AtomicBool,
    /// Time the instrument needs after `*RST` before it accepts configuration
    reset_settle: Duration,
}

impl Keithley2400 {
    /// Create a driver on top of an (unopened) transport.
    pub fn new(transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            transport,
            bus: Mutex::new(()),
            connected: AtomicBool::new(false),
            reset_settle: Duration::from_millis(500),
        }
    }

    /// Override the post-reset settle time.
    pub fn with_reset_settle(mut self, settle: Duration) -> Self {
        self.reset_settle = settle;
        self
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DaqError::fault("Not connected to any instrument"))
        }
    }

    async fn write(&self, command: &str) -> AppResult<()> {
        let _bus = self.bus.lock().await;
        self.send(command).await
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        let _bus = self.bus.lock().await;
        self.ensure_connected()?;
        self.transport
            .query(command)
            .await
            .map_err(|e| DaqError::fault(format!("Failed to query '{}': {}", command, e)))
    }

    /// Write without taking the bus lock; the caller holds it.
    async fn send(&self, command: &str) -> AppResult<()> {
        self.ensure_connected()?;
        debug!(command, "keithley write");
        self.transport
            .write(command)
            .await
            .map_err(|e| DaqError::fault(format!("Failed to write '{}': {}", command, e)))
    }

    /// Parse a `:READ?` reply. The first field is current, the second voltage.
    fn parse_reading(response: &str) -> AppResult<Reading> {
        let mut fields = response.trim().split(',');
        let current = fields
            .next()
            .filter(|f| !f.trim().is_empty())
            .ok_or_else(|| DaqError::fault("Empty measurement response"))?;
        let current_amps = parse_field(current, 'A')?;
        let voltage_volts = match fields.next() {
            Some(field) => Some(parse_field(field, 'V')?),
            None => None,
        };
        Ok(Reading {
            current_amps,
            voltage_volts,
        })
    }
}

#[async_trait]
impl Connection for Keithley2400 {
    async fn connect(&self, resource: &str) -> AppResult<()> {
        self.transport.open(resource).await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            DaqError::Connection(format!("Failed to connect to {}: {}", resource, e))
        })?;
        self.connected.store(true, Ordering::SeqCst);
        info!(resource, "Keithley 2400 connected");
        Ok(())
    }

    async fn disconnect(&self) -> AppResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport
            .close()
            .await
            .map_err(|e| DaqError::fault(format!("Failed to disconnect: {}", e)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn identity(&self) -> AppResult<String> {
        Ok(self.query("*IDN?").await?.trim().to_string())
    }
}

#[async_trait]
impl SourceMeter for Keithley2400 {
    async fn prepare_for_sweep(&self, compliance_amps: f64) -> AppResult<()> {
        let _bus = self.bus.lock().await;
        self.ensure_connected()?;

        self.send("*RST").await?;
        sleep(self.reset_settle).await;

        self.send(":SOUR:FUNC:MODE VOLT").await?;
        self.send(&format!(":SENS:CURR:PROT:LEV {}", compliance_amps))
            .await?;
        self.send(":SENS:CURR:RANGE:AUTO 1").await?;
        self.send(":OUTP ON").await
    }

    async fn set_output_voltage(&self, volts: f64) -> AppResult<()> {
        self.write(&format!(":SOUR:VOLT {}", volts)).await
    }

    async fn read_measurement(&self) -> AppResult<Reading> {
        let response = self.query(":READ?").await?;
        Self::parse_reading(&response)
    }

    async fn output_off(&self) -> AppResult<()> {
        // Nothing can be energized through a closed session
        if !self.is_connected() {
            return Ok(());
        }
        self.write(":OUTP OFF").await
    }

    async fn shutdown(&self) -> AppResult<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let _bus = self.bus.lock().await;
        self.send(":OUTP OFF").await?;
        self.send(":SOUR:FUNC:MODE CURR").await?;
        self.send("SYSTEM:KEY 23").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::scpi::testing::ScriptedTransport;

    async fn connected(transport: Arc<ScriptedTransport>) -> Keithley2400 {
        let smu = Keithley2400::new(transport).with_reset_settle(Duration::ZERO);
        smu.connect("GPIB0::24::INSTR").await.unwrap();
        smu
    }

    #[tokio::test]
    async fn prepare_sends_voltage_source_setup() {
        let transport = Arc::new(ScriptedTransport::default());
        let smu = connected(transport.clone()).await;

        smu.prepare_for_sweep(0.01).await.unwrap();

        assert_eq!(
            transport.sent(),
            vec![
                "*RST",
                ":SOUR:FUNC:MODE VOLT",
                ":SENS:CURR:PROT:LEV 0.01",
                ":SENS:CURR:RANGE:AUTO 1",
                ":OUTP ON",
            ]
        );
    }

    #[tokio::test]
    async fn reads_current_and_voltage() {
        let transport = Arc::new(ScriptedTransport::with_replies(&[
            "+1.000000E-03A,+2.000000E-01V,+9.9E37,+1.2E3,+39440",
        ]));
        let smu = connected(transport).await;

        let reading = smu.read_measurement().await.unwrap();
        assert_eq!(reading.current_amps, 1e-3);
        assert_eq!(reading.voltage_volts, Some(0.2));
    }

    #[tokio::test]
    async fn current_only_reply_has_no_voltage() {
        let transport = Arc::new(ScriptedTransport::with_replies(&["-4.2E-06"]));
        let smu = connected(transport).await;

        let reading = smu.read_measurement().await.unwrap();
        assert_eq!(reading.voltage_volts, None);
        assert_eq!(reading.voltage_or(-0.3), -0.3);
    }

    #[tokio::test]
    async fn commands_fail_when_not_connected() {
        let smu = Keithley2400::new(Arc::new(ScriptedTransport::default()));
        let err = smu.prepare_for_sweep(0.01).await.unwrap_err();
        assert!(matches!(err, DaqError::InstrumentFault(_)));
        // Output off stays safe on a dead session
        assert!(smu.output_off().await.is_ok());
        assert!(smu.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn connect_failure_is_a_connection_error() {
        let transport = Arc::new(ScriptedTransport {
            fail_open: true,
            ..Default::default()
        });
        let smu = Keithley2400::new(transport);
        let err = smu.connect("GPIB0::99::INSTR").await.unwrap_err();
        assert!(matches!(err, DaqError::Connection(_)));
        assert!(!smu.is_connected());
    }

    #[tokio::test]
    async fn identity_waits_for_setup_sequence() {
        let transport = Arc::new(ScriptedTransport::with_replies(&[
            "KEITHLEY INSTRUMENTS INC.,MODEL 2400,1234567,C30",
        ]));
        let smu = Arc::new(
            Keithley2400::new(transport.clone()).with_reset_settle(Duration::from_millis(20)),
        );
        smu.connect("GPIB0::24::INSTR").await.unwrap();

        let setup = tokio::spawn({
            let smu = smu.clone();
            async move { smu.prepare_for_sweep(0.01).await }
        });
        // Let setup take the bus and park in its post-reset settle
        tokio::time::sleep(Duration::from_millis(5)).await;
        let identity = smu.identity().await.unwrap();
        setup.await.unwrap().unwrap();

        assert!(identity.starts_with("KEITHLEY"));
        let sent = transport.sent();
        assert_eq!(sent.first().map(String::as_str), Some("*RST"));
        assert_eq!(sent[4], ":OUTP ON");
        assert_eq!(sent.last().map(String::as_str), Some("*IDN?"));
    }

    #[tokio::test]
    async fn shutdown_returns_to_local() {
        let transport = Arc::new(ScriptedTransport::default());
        let smu = connected(transport.clone()).await;
        smu.shutdown().await.unwrap();
        assert_eq!(
            transport.sent(),
            vec![":OUTP OFF", ":SOUR:FUNC:MODE CURR", "SYSTEM:KEY 23"]
        );
    }
}
