//! Thorlabs PM100D Optical Power Meter Driver
//!
//! The PM100D answers SCPI when its USB driver is in NI-VISA mode. Only the subset the
//! P-I-V measurement needs is implemented: wavelength correction, range selection and
//! single power readings (always in watts).

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Connection, PowerMeter, PowerMeterSettings, PowerReading};
use crate::hardware::scpi::{parse_field, ScpiTransport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Driver for the Thorlabs PM100D.
pub struct Pm100d {
    transport: Arc<dyn ScpiTransport>,
    bus: Mutex<()>,
    connected: AtomicBool,
}

impl Pm100d {
    /// Create a driver on top of an (unopened) transport.
    pub fn new(transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            transport,
            bus: Mutex::new(()),
            connected: AtomicBool::new(false),
        }
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DaqError::fault("Not connected to any instrument"))
        }
    }

    /// Write a command; the caller holds the bus lock.
    async fn write(&self, command: &str) -> AppResult<()> {
        self.ensure_connected()?;
        self.transport
            .write(command)
            .await
            .map_err(|e| DaqError::fault(format!("Failed to configure PM100D: {}", e)))
    }
}

#[async_trait]
impl Connection for Pm100d {
    async fn connect(&self, resource: &str) -> AppResult<()> {
        self.transport.open(resource).await.map_err(|e| {
            DaqError::Connection(format!(
                "Failed to connect to PM100D at {}: {}. If Thorlabs OPM was used recently, \
                 switch the driver to 'PM100D NI-VISA' mode.",
                resource, e
            ))
        })?;
        self.connected.store(true, Ordering::SeqCst);
        info!(resource, "PM100D connected");
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
        let _bus = self.bus.lock().await;
        self.ensure_connected()?;
        let idn = self
            .transport
            .query("*IDN?")
            .await
            .map_err(|e| DaqError::fault(format!("Failed to get instrument info: {}", e)))?;
        Ok(idn.trim().to_string())
    }
}

#[async_trait]
impl PowerMeter for Pm100d {
    async fn configure(&self, settings: &PowerMeterSettings) -> AppResult<()> {
        let _bus = self.bus.lock().await;
        self.ensure_connected()?;
        self.write(&format!("SENS:CORR:WAV {}", settings.wavelength_nm))
            .await?;

        if settings.auto_range {
            return self.write("SENS:POW:RANG:AUTO 1").await;
        }
        let range = settings.manual_range_watts.ok_or_else(|| {
            DaqError::fault("Manual range must be specified when auto range is off")
        })?;
        self.write("SENS:POW:RANG:AUTO 0").await?;
        self.write(&format!("SENS:POW:RANG {}", range)).await
    }

    async fn read_power(&self) -> AppResult<PowerReading> {
        let _bus = self.bus.lock().await;
        self.ensure_connected()?;
        let response = self
            .transport
            .query("MEAS:POW?")
            .await
            .map_err(|e| DaqError::fault(format!("Failed to read power: {}", e)))?;
        Ok(PowerReading {
            watts: parse_field(&response, 'W')?,
            unit: "W".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::scpi::testing::ScriptedTransport;

    #[tokio::test]
    async fn configures_manual_range() {
        let transport = Arc::new(ScriptedTransport::default());
        let meter = Pm100d::new(transport.clone());
        meter.connect("USB0::0x1313::0x8078::P0001::INSTR").await.unwrap();

        let settings = PowerMeterSettings {
            wavelength_nm: 850.0,
            auto_range: false,
            manual_range_watts: Some(0.001),
        };
        meter.configure(&settings).await.unwrap();

        assert_eq!(
            transport.sent(),
            vec!["SENS:CORR:WAV 850", "SENS:POW:RANG:AUTO 0", "SENS:POW:RANG 0.001"]
        );
    }

    #[tokio::test]
    async fn reads_power_in_watts() {
        let transport = Arc::new(ScriptedTransport::with_replies(&["1.25E-05\n"]));
        let meter = Pm100d::new(transport);
        meter.connect("USB0::INSTR").await.unwrap();

        let reading = meter.read_power().await.unwrap();
        assert_eq!(reading.watts, 1.25e-5);
        assert_eq!(reading.unit, "W");
    }

    #[tokio::test]
    async fn read_fails_when_disconnected() {
        let meter = Pm100d::new(Arc::new(ScriptedTransport::default()));
        assert!(matches!(
            meter.read_power().await,
            Err(DaqError::InstrumentFault(_))
        ));
    }
}
