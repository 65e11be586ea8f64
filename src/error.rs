//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, used across instrument control,
//! the measurement pipeline and persistence, plus `AnalysisError` for the TLM regression
//! engine and the RTD curve fit. Using the `thiserror` crate, each failure class of the measurement system gets its
//! own variant so callers can react to it precisely:
//!
//! - **`Connection`**: an instrument could not be reached or opened at connect time. The
//!   instrument is left disconnected.
//! - **`InstrumentFault`**: a write, query or configuration step failed during setup or
//!   acquisition. Aborts the current run and triggers best-effort cleanup.
//! - **`MeasurementAborted`**: the user requested cancellation and the acquisition loop
//!   observed it. A distinct, non-error termination that still runs the cleanup path.
//! - **`Persistence`**: result files could not be written. Never invalidates a completed run.
//! - **`RunAlreadyInProgress`**: a second run was requested while one is active.
//! - **`Configuration`** / **`Config`**: semantic or parse errors in settings and parameters.
//!
//! Optical power read failures have no variant: the acquisition loop substitutes zero and
//! reports the failure on the log and event channels.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Figment failed to load or extract the settings.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Settings or parameters that parsed but are logically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Instrument unreachable or misconfigured at connect time.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Write/query/configure failure during setup or acquisition.
    #[error("Instrument fault: {0}")]
    InstrumentFault(String),

    /// Cancellation requested by the user and observed by the acquisition loop.
    #[error("Measurement was stopped")]
    MeasurementAborted,

    /// A run was requested while another one is still running.
    #[error("A measurement is already in progress")]
    RunAlreadyInProgress,

    /// Result files could not be written.
    #[error("Error saving data to {path}: {reason}")]
    Persistence {
        /// File or directory that failed.
        path: PathBuf,
        /// Underlying failure description.
        reason: String,
    },

    /// TLM regression failure.
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    /// Several best-effort cleanup steps failed.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Shorthand for an [`DaqError::InstrumentFault`] with a formatted message.
    pub fn fault(message: impl Into<String>) -> Self {
        DaqError::InstrumentFault(message.into())
    }

    /// Whether this error is the cooperative-cancellation marker rather than a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, DaqError::MeasurementAborted)
    }
}

/// Failures of the TLM regression engine and the RTD model fit.
///
/// Per-file variants are produced by the pure extraction functions; the session wraps them
/// in [`AnalysisError::Entry`] with the 1-based position of the failing file.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// The voltage or current array is empty.
    #[error("no valid data points")]
    EmptyData,

    /// Voltage and current arrays have different lengths.
    #[error("voltage has {voltage} points but current has {current}")]
    LengthMismatch {
        /// Number of voltage values.
        voltage: usize,
        /// Number of current values.
        current: usize,
    },

    /// At least one value is NaN.
    #[error("data contains NaN values")]
    NanValues,

    /// Fewer than two points survive the voltage floor.
    #[error("less than 2 data points above the minimum voltage of {min_voltage}V")]
    InsufficientPoints {
        /// Voltage floor that was applied.
        min_voltage: f64,
    },

    /// Regression slope is NaN or too close to zero to invert.
    #[error("invalid slope {slope}; the I-V data may not be suitable for resistance calculation")]
    DegenerateSlope {
        /// Slope returned by the regression.
        slope: f64,
    },

    /// Fewer than two (distance, resistance) pairs.
    #[error("at least two valid TLM measurements are required for analysis")]
    InsufficientEntries,

    /// Cross-file regression produced NaN slope, intercept or correlation.
    #[error("could not perform valid linear regression on the TLM data")]
    InvalidRegression,

    /// An entry has no contact spacing.
    #[error("file {0} has no TLM distance")]
    MissingDistance(usize),

    /// A per-file failure, tagged with the 1-based file position.
    #[error("file {index}: {source}")]
    Entry {
        /// 1-based position of the file in the session.
        index: usize,
        /// Underlying failure.
        #[source]
        source: Box<AnalysisError>,
    },

    /// No data point lies inside a peak or valley search window.
    #[error("no data points between {lower}V and {upper}V")]
    EmptyWindow {
        /// Lower window edge (V).
        lower: f64,
        /// Upper window edge (V).
        upper: f64,
    },

    /// Fewer data points than the model has free parameters.
    #[error("{needed} data points are needed for the fit, got {got}")]
    TooFewPoints {
        /// Minimum number of points.
        needed: usize,
        /// Points supplied.
        got: usize,
    },

    /// The optimizer failed or produced no usable parameters.
    #[error("model fit failed: {0}")]
    FitFailed(String),

    /// A TLM input file could not be read or parsed.
    #[error("error loading {path}: {reason}")]
    Load {
        /// File that failed.
        path: PathBuf,
        /// Underlying failure description.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_not_a_fault() {
        assert!(DaqError::MeasurementAborted.is_abort());
        assert!(!DaqError::fault("boom").is_abort());
    }

    #[test]
    fn entry_error_mentions_file_index() {
        let err = AnalysisError::Entry {
            index: 3,
            source: Box::new(AnalysisError::NanValues),
        };
        assert_eq!(err.to_string(), "file 3: data contains NaN values");
    }

    #[test]
    fn analysis_error_converts_into_daq_error() {
        let err: DaqError = AnalysisError::InsufficientEntries.into();
        assert!(matches!(err, DaqError::Analysis(AnalysisError::InsufficientEntries)));
    }
}
