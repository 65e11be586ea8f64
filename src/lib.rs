//! # IV DAQ Core Library
//!
//! Source-meter I-V sweeps (optionally with a DC bias source or an optical power meter)
//! and Transmission Line Method analysis of the resulting files.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: capability traits every instrument implements, SCPI drivers for the
//!   Keithley 2400 and Thorlabs PM100D, and simulated instruments.
//! - **`measurement`**: sweep generation, the acquisition loop, the single-flight run
//!   orchestrator with its event bus, and result files.
//! - **`analysis`**: per-file resistance extraction, the cross-file TLM fit and the RTD
//!   Schulman fit.
//! - **`config`**: layered settings (defaults, TOML, environment) and sweep presets.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: `DaqError` and `AnalysisError`.

pub mod analysis;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod measurement;
