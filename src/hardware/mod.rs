//! Instrument capabilities and drivers.
//!
//! The measurement pipeline only sees the traits in [`capabilities`]. Concrete drivers speak
//! SCPI through a caller-supplied [`scpi::ScpiTransport`]; [`mock`] provides simulated
//! instruments for dry runs and tests.

pub mod capabilities;
pub mod keithley_2400;
pub mod mock;
pub mod pm100d;
pub mod scpi;

pub use capabilities::{
    Connection, PowerMeter, PowerMeterSettings, PowerReading, Reading, SourceMeter,
};
pub use keithley_2400::Keithley2400;
pub use mock::{MockPowerMeter, MockSourceMeter};
pub use pm100d::Pm100d;
