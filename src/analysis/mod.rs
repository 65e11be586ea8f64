//! Offline analysis of I-V files.
//!
//! Independent of the measurement pipeline: it consumes I-V files (such as the ones the
//! pipeline writes). [`tlm`] turns files plus user-entered contact spacings into sheet and
//! contact resistance; [`rtd`] fits the Schulman model to a tunnelling diode curve.

pub mod loader;
pub mod regression;
pub mod rtd;
pub mod tlm;

pub use loader::{load_iv_file, IvData};
pub use regression::{linear_regression, LinearFit};
pub use rtd::{
    find_peak_valley, fit_schulman, mask_ndr_region, PeakValley, RtdFit, RtdFitOptions,
    SchulmanParams,
};
pub use tlm::{
    extract_resistance, fit_tlm, FitQuality, ResistanceFit, TlmEntry, TlmFit, TlmSession,
};
