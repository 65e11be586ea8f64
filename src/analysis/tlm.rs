//! Transmission Line Method analysis.
//!
//! Each I-V file yields a resistance from the inverse slope of current against voltage
//! above a voltage floor. Resistance against contact spacing is then fitted with a line:
//! the slope is the sheet resistance (Ω per unit distance) and half the intercept is the
//! contact resistance.
//!
//! Both stages are recomputed from scratch on every call.

use crate::analysis::loader::{load_iv_file, IvData};
use crate::analysis::regression::linear_regression;
use crate::error::AnalysisError;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Slopes with a smaller magnitude (A/V) cannot be inverted into a resistance.
pub const MIN_SLOPE: f64 = 1e-10;

const MILLIAMPS_TO_AMPS: f64 = 1e-3;

/// Resistance extracted from one I-V file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResistanceFit {
    /// Resistance (Ω)
    pub resistance_ohms: f64,
    /// R² of the current-voltage fit
    pub r_squared: f64,
    /// Points left after the voltage floor
    pub points_used: usize,
}

impl ResistanceFit {
    /// Resistance in kΩ.
    pub fn kilohms(&self) -> f64 {
        self.resistance_ohms / 1000.0
    }
}

/// Fit `current_ma` against `voltage` for points at or above `min_voltage`.
///
/// # Errors
/// - [`AnalysisError::EmptyData`] / [`AnalysisError::LengthMismatch`] for unusable arrays
/// - [`AnalysisError::NanValues`] if any value is NaN
/// - [`AnalysisError::InsufficientPoints`] if fewer than two points pass the floor
/// - [`AnalysisError::DegenerateSlope`] for a NaN or near-zero slope
pub fn extract_resistance(
    voltage: &[f64],
    current_ma: &[f64],
    min_voltage: f64,
) -> Result<ResistanceFit, AnalysisError> {
    if voltage.is_empty() || current_ma.is_empty() {
        return Err(AnalysisError::EmptyData);
    }
    if voltage.len() != current_ma.len() {
        return Err(AnalysisError::LengthMismatch {
            voltage: voltage.len(),
            current: current_ma.len(),
        });
    }
    if voltage.iter().chain(current_ma).any(|v| v.is_nan()) {
        return Err(AnalysisError::NanValues);
    }

    let (volts, amps): (Vec<f64>, Vec<f64>) = voltage
        .iter()
        .zip(current_ma)
        .filter(|(v, _)| **v >= min_voltage)
        .map(|(v, i)| (*v, i * MILLIAMPS_TO_AMPS))
        .unzip();
    if volts.len() < 2 {
        return Err(AnalysisError::InsufficientPoints { min_voltage });
    }

    // All-equal voltages leave no slope to invert
    let fit = linear_regression(&volts, &amps)
        .ok_or(AnalysisError::DegenerateSlope { slope: f64::NAN })?;
    if fit.slope.is_nan() || fit.slope.abs() < MIN_SLOPE {
        return Err(AnalysisError::DegenerateSlope { slope: fit.slope });
    }

    Ok(ResistanceFit {
        resistance_ohms: 1.0 / fit.slope,
        r_squared: fit.r_squared(),
        points_used: volts.len(),
    })
}

/// Qualitative reading of a TLM fit's R².
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitQuality {
    /// R² below 0.5
    Poor,
    /// R² in [0.5, 0.8)
    Moderate,
    /// R² of 0.8 or more
    Good,
}

impl FitQuality {
    /// Classify an R² value.
    pub fn from_r_squared(r_squared: f64) -> Self {
        if r_squared < 0.5 {
            FitQuality::Poor
        } else if r_squared < 0.8 {
            FitQuality::Moderate
        } else {
            FitQuality::Good
        }
    }
}

impl fmt::Display for FitQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitQuality::Poor => write!(f, "poor"),
            FitQuality::Moderate => write!(f, "moderate"),
            FitQuality::Good => write!(f, "good"),
        }
    }
}

/// Cross-file TLM result.
#[derive(Debug, Clone, PartialEq)]
pub struct TlmFit {
    /// Slope of resistance against distance (Ω per distance unit)
    pub sheet_resistance: f64,
    /// Half the intercept (Ω)
    pub contact_resistance: f64,
    /// Intercept of the fit (Ω)
    pub intercept: f64,
    /// R² of the fit
    pub r_squared: f64,
    /// Distances in ascending order
    pub distances: Vec<f64>,
    /// Resistances (Ω) matching `distances`
    pub resistances: Vec<f64>,
}

impl TlmFit {
    /// Quality class of the fit.
    pub fn quality(&self) -> FitQuality {
        FitQuality::from_r_squared(self.r_squared)
    }

    /// Sheet resistance in kΩ per distance unit.
    pub fn sheet_resistance_kilohms(&self) -> f64 {
        self.sheet_resistance / 1000.0
    }

    /// Contact resistance in kΩ.
    pub fn contact_resistance_kilohms(&self) -> f64 {
        self.contact_resistance / 1000.0
    }
}

/// Fit resistance against distance over `(distance, resistance_ohms)` pairs.
///
/// # Errors
/// [`AnalysisError::InsufficientEntries`] for fewer than two pairs,
/// [`AnalysisError::InvalidRegression`] when the fit is undefined or NaN.
pub fn fit_tlm(points: &[(f64, f64)]) -> Result<TlmFit, AnalysisError> {
    if points.len() < 2 {
        return Err(AnalysisError::InsufficientEntries);
    }
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
    let (distances, resistances): (Vec<f64>, Vec<f64>) = sorted.into_iter().unzip();

    let fit =
        linear_regression(&distances, &resistances).ok_or(AnalysisError::InvalidRegression)?;
    if fit.slope.is_nan() || fit.intercept.is_nan() || fit.r_value.is_nan() {
        return Err(AnalysisError::InvalidRegression);
    }

    Ok(TlmFit {
        sheet_resistance: fit.slope,
        contact_resistance: fit.intercept / 2.0,
        intercept: fit.intercept,
        r_squared: fit.r_squared(),
        distances,
        resistances,
    })
}

/// One loaded file in a TLM session.
#[derive(Debug, Clone, PartialEq)]
pub struct TlmEntry {
    /// Source file
    pub path: PathBuf,
    /// Contact spacing; `None` until entered
    pub distance: Option<f64>,
    /// Loaded columns
    pub data: IvData,
    /// Result of the last analysis
    pub fit: Option<ResistanceFit>,
}

impl TlmEntry {
    /// File name without directories.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Ordered set of TLM files with their spacings.
#[derive(Debug, Clone)]
pub struct TlmSession {
    entries: Vec<TlmEntry>,
    start_distance: f64,
    default_increment: f64,
}

impl Default for TlmSession {
    fn default() -> Self {
        Self::new(5.0, 5.0)
    }
}

impl TlmSession {
    /// Empty session whose first file gets `start_distance`, then steps of `increment`.
    pub fn new(start_distance: f64, increment: f64) -> Self {
        Self {
            entries: Vec::new(),
            start_distance,
            default_increment: increment,
        }
    }

    /// Entries in load order.
    pub fn entries(&self) -> &[TlmEntry] {
        &self.entries
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Add already-loaded data with an explicit distance.
    pub fn add_entry(&mut self, path: impl Into<PathBuf>, distance: Option<f64>, data: IvData) {
        self.entries.push(TlmEntry {
            path: path.into(),
            distance,
            data,
            fit: None,
        });
    }

    /// Load `paths` and append them with default distances.
    ///
    /// Files that fail to load are skipped; their errors are returned so the caller can
    /// report them. The default distance does not advance past a skipped file.
    pub fn add_files<P: AsRef<Path>>(&mut self, paths: &[P]) -> Vec<AnalysisError> {
        let (start, increment) = self.next_distances();
        let mut errors = Vec::new();
        let mut added = 0usize;
        for path in paths {
            let path = path.as_ref();
            match load_iv_file(path) {
                Ok(data) => {
                    let distance = start + added as f64 * increment;
                    self.add_entry(path, Some(distance), data);
                    added += 1;
                }
                Err(e) => {
                    warn!("{}", e);
                    errors.push(e);
                }
            }
        }
        errors
    }

    /// Set the distance of the entry at `index` (0-based).
    ///
    /// Returns `false` if there is no such entry.
    pub fn set_distance(&mut self, index: usize, distance: f64) -> bool {
        match self.entries.get_mut(index) {
            Some(entry) => {
                entry.distance = Some(distance);
                true
            }
            None => false,
        }
    }

    /// Start distance and increment for the next batch of files.
    ///
    /// With two or more known distances the increment is the mean spacing of the sorted
    /// distances (when positive), and the batch continues from the last entry.
    pub fn next_distances(&self) -> (f64, f64) {
        if self.entries.is_empty() {
            return (self.start_distance, self.default_increment);
        }
        let mut distances: Vec<f64> = self.entries.iter().filter_map(|e| e.distance).collect();
        let mut increment = self.default_increment;
        if distances.len() >= 2 {
            distances.sort_by(f64::total_cmp);
            let mean_step = (distances[distances.len() - 1] - distances[0])
                / (distances.len() - 1) as f64;
            if mean_step > 0.0 {
                increment = mean_step;
            }
        }
        let start = match self.entries.last().and_then(|e| e.distance) {
            Some(last) => last + increment,
            None => self.start_distance + increment,
        };
        (start, increment)
    }

    /// Recompute every entry's resistance above `min_voltage`, then the cross-file fit.
    ///
    /// # Errors
    /// The first failing entry aborts the analysis with [`AnalysisError::MissingDistance`]
    /// or [`AnalysisError::Entry`] carrying its 1-based position; the cross-file fit's own
    /// errors are returned unwrapped.
    pub fn analyze(&mut self, min_voltage: f64) -> Result<TlmFit, AnalysisError> {
        for entry in &mut self.entries {
            entry.fit = None;
        }

        let mut points = Vec::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter_mut().enumerate() {
            let index = i + 1;
            let distance = entry.distance.ok_or(AnalysisError::MissingDistance(index))?;
            let fit = extract_resistance(&entry.data.voltage, &entry.data.current_ma, min_voltage)
                .map_err(|e| AnalysisError::Entry {
                    index,
                    source: Box::new(e),
                })?;
            info!(
                file = %entry.file_name(),
                distance,
                resistance_kohm = fit.kilohms(),
                r_squared = fit.r_squared,
                "Resistance extracted"
            );
            entry.fit = Some(fit);
            points.push((distance, fit.resistance_ohms));
        }

        let fit = fit_tlm(&points)?;
        match fit.quality() {
            FitQuality::Good => info!(r_squared = fit.r_squared, "TLM fit"),
            quality => warn!(
                r_squared = fit.r_squared,
                "TLM fit quality is {}; check distances and data quality",
                quality
            ),
        }
        Ok(fit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ohmic(resistance: f64, volts: &[f64]) -> IvData {
        IvData {
            voltage: volts.to_vec(),
            current_ma: volts.iter().map(|v| v / resistance * 1e3).collect(),
        }
    }

    #[test]
    fn two_hundred_ohm_resistor() {
        let fit = extract_resistance(
            &[0.0, 0.2, 0.4, 0.6, 0.8],
            &[0.0, 1.0, 2.0, 3.0, 4.0],
            0.0,
        )
        .unwrap();
        assert!((fit.resistance_ohms - 200.0).abs() < 1e-9);
        assert!((fit.r_squared - 1.0).abs() < 1e-12);
        assert!((fit.kilohms() - 0.2).abs() < 1e-12);
        assert_eq!(fit.points_used, 5);
    }

    #[test]
    fn voltage_floor_filters_points() {
        let fit = extract_resistance(&[0.0, 0.5, 1.0, 1.5], &[9.0, 9.0, 1.0, 2.0], 1.0).unwrap();
        assert_eq!(fit.points_used, 2);
        assert!((fit.resistance_ohms - 500.0).abs() < 1e-9);

        let err = extract_resistance(&[0.0, 0.5, 1.0], &[0.0, 1.0, 2.0], 0.9).unwrap_err();
        assert_eq!(err, AnalysisError::InsufficientPoints { min_voltage: 0.9 });
    }

    #[test]
    fn rejects_unusable_data() {
        assert_eq!(
            extract_resistance(&[], &[], 0.0).unwrap_err(),
            AnalysisError::EmptyData
        );
        assert_eq!(
            extract_resistance(&[0.0, f64::NAN], &[0.0, 1.0], 0.0).unwrap_err(),
            AnalysisError::NanValues
        );
        assert!(matches!(
            extract_resistance(&[0.0, 1.0, 2.0], &[1.0, 1.0, 1.0], 0.0).unwrap_err(),
            AnalysisError::DegenerateSlope { .. }
        ));
    }

    #[test]
    fn two_entry_fit() {
        let fit = fit_tlm(&[(20.0, 400.0), (10.0, 200.0)]).unwrap();
        assert!((fit.sheet_resistance - 20.0).abs() < 1e-12);
        assert!(fit.contact_resistance.abs() < 1e-9);
        assert_eq!(fit.distances, vec![10.0, 20.0]);
        assert_eq!(fit.quality(), FitQuality::Good);
    }

    #[test]
    fn fit_needs_two_entries() {
        assert_eq!(
            fit_tlm(&[(10.0, 200.0)]).unwrap_err(),
            AnalysisError::InsufficientEntries
        );
        assert_eq!(
            fit_tlm(&[(10.0, 200.0), (10.0, 300.0)]).unwrap_err(),
            AnalysisError::InvalidRegression
        );
    }

    #[test]
    fn quality_bands() {
        assert_eq!(FitQuality::from_r_squared(0.3), FitQuality::Poor);
        assert_eq!(FitQuality::from_r_squared(0.5), FitQuality::Moderate);
        assert_eq!(FitQuality::from_r_squared(0.8), FitQuality::Good);
    }

    #[test]
    fn session_analysis_recomputes_entries() {
        let volts = [0.0, 0.25, 0.5, 0.75, 1.0];
        let mut session = TlmSession::default();
        session.add_entry("a.txt", Some(10.0), ohmic(250.0, &volts));
        session.add_entry("b.txt", Some(20.0), ohmic(350.0, &volts));
        session.add_entry("c.txt", Some(30.0), ohmic(450.0, &volts));

        let fit = session.analyze(0.0).unwrap();
        assert!((fit.sheet_resistance - 10.0).abs() < 1e-6);
        assert!((fit.contact_resistance - 75.0).abs() < 1e-6);
        assert!(session.entries().iter().all(|e| e.fit.is_some()));

        // A floor that leaves one point per file fails on the first file
        let err = session.analyze(0.9).unwrap_err();
        assert!(matches!(err, AnalysisError::Entry { index: 1, .. }));
        assert!(session.entries().iter().all(|e| e.fit.is_none()));
    }

    #[test]
    fn missing_distance_is_reported_by_position() {
        let volts = [0.0, 1.0];
        let mut session = TlmSession::default();
        session.add_entry("a.txt", Some(5.0), ohmic(100.0, &volts));
        session.add_entry("b.txt", None, ohmic(100.0, &volts));
        assert_eq!(
            session.analyze(0.0).unwrap_err(),
            AnalysisError::MissingDistance(2)
        );
    }

    #[test]
    fn default_distances_follow_existing_spacing() {
        let mut session = TlmSession::default();
        assert_eq!(session.next_distances(), (5.0, 5.0));

        session.add_entry("a.txt", Some(10.0), IvData::default());
        assert_eq!(session.next_distances(), (15.0, 5.0));

        session.add_entry("b.txt", Some(30.0), IvData::default());
        assert_eq!(session.next_distances(), (50.0, 20.0));

        assert!(session.set_distance(1, 10.0));
        assert_eq!(session.next_distances(), (15.0, 5.0));
        assert!(!session.set_distance(7, 1.0));

        session.clear();
        assert!(session.entries().is_empty());
    }
}
