//! Sweep definition and point generation.
//!
//! A [`SweepSpec`] is validated once at construction; everything downstream can assume
//! `start != stop`, at least two points and a usable compliance.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Largest compliance a sweep may request, in amps.
pub const MAX_COMPLIANCE_AMPS: f64 = 1.0;

/// Immutable, validated sweep parameters.
///
/// Deserialization goes through [`SweepSpec::new`], so a stored sweep is validated the
/// same way as one built in code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSweepSpec")]
pub struct SweepSpec {
    start_voltage: f64,
    stop_voltage: f64,
    num_points: usize,
    compliance_amps: f64,
    bidirectional: bool,
}

/// Unchecked wire layout of a [`SweepSpec`].
#[derive(Deserialize)]
struct RawSweepSpec {
    start_voltage: f64,
    stop_voltage: f64,
    num_points: usize,
    compliance_amps: f64,
    bidirectional: bool,
}

impl TryFrom<RawSweepSpec> for SweepSpec {
    type Error = DaqError;

    fn try_from(raw: RawSweepSpec) -> AppResult<Self> {
        SweepSpec::new(
            raw.start_voltage,
            raw.stop_voltage,
            raw.num_points,
            raw.compliance_amps,
            raw.bidirectional,
        )
    }
}

impl SweepSpec {
    /// Validate and build a sweep.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] when the voltages are equal or not finite, when fewer than
    /// two points are requested, or when the compliance is outside `(0, 1]` A.
    pub fn new(
        start_voltage: f64,
        stop_voltage: f64,
        num_points: usize,
        compliance_amps: f64,
        bidirectional: bool,
    ) -> AppResult<Self> {
        if !start_voltage.is_finite() || !stop_voltage.is_finite() {
            return Err(DaqError::Configuration(
                "Sweep voltages must be finite".to_string(),
            ));
        }
        if start_voltage == stop_voltage {
            return Err(DaqError::Configuration(
                "Start and stop voltages cannot be the same".to_string(),
            ));
        }
        if num_points < 2 {
            return Err(DaqError::Configuration(format!(
                "A sweep needs at least 2 points, got {}",
                num_points
            )));
        }
        if !(compliance_amps > 0.0 && compliance_amps <= MAX_COMPLIANCE_AMPS) {
            return Err(DaqError::Configuration(format!(
                "Compliance must be in (0, {}] A, got {}",
                MAX_COMPLIANCE_AMPS, compliance_amps
            )));
        }
        Ok(Self {
            start_voltage,
            stop_voltage,
            num_points,
            compliance_amps,
            bidirectional,
        })
    }

    /// First commanded voltage.
    pub fn start_voltage(&self) -> f64 {
        self.start_voltage
    }

    /// Turnaround (or final) voltage.
    pub fn stop_voltage(&self) -> f64 {
        self.stop_voltage
    }

    /// Points in the forward leg.
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    /// Current compliance in amps.
    pub fn compliance_amps(&self) -> f64 {
        self.compliance_amps
    }

    /// Whether the sweep returns to the start voltage.
    pub fn is_bidirectional(&self) -> bool {
        self.bidirectional
    }

    /// Number of points the sweep commands in total.
    pub fn total_points(&self) -> usize {
        if self.bidirectional {
            2 * self.num_points - 1
        } else {
            self.num_points
        }
    }
}

/// Ordered commanded voltages for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPoints {
    /// Voltages in the order they are applied.
    pub points: Vec<f64>,
    /// Number of forward-leg points; always the sweep's `num_points`.
    pub forward_count: usize,
}

impl SweepPoints {
    /// Whether the point at `index` belongs to the reverse leg.
    pub fn is_reverse(&self, index: usize, bidirectional: bool) -> bool {
        bidirectional && index >= self.forward_count
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether there are no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// `count` evenly spaced values from `start` to `stop`, both endpoints included exactly.
pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (count - 1) as f64;
            (0..count)
                .map(|i| {
                    if i == count - 1 {
                        stop
                    } else {
                        start + step * i as f64
                    }
                })
                .collect()
        }
    }
}

/// Generate the commanded voltages for `spec`.
///
/// The reverse leg drops its first point so the turnaround voltage is applied once.
pub fn generate_sweep_points(spec: &SweepSpec) -> SweepPoints {
    let mut points = linspace(spec.start_voltage, spec.stop_voltage, spec.num_points);
    if spec.bidirectional {
        points.extend(
            linspace(spec.stop_voltage, spec.start_voltage, spec.num_points)
                .into_iter()
                .skip(1),
        );
    }
    SweepPoints {
        points,
        forward_count: spec.num_points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unidirectional_hits_both_endpoints() {
        let spec = SweepSpec::new(0.0, 0.8, 5, 0.01, false).unwrap();
        let sweep = generate_sweep_points(&spec);
        assert_eq!(sweep.len(), 5);
        assert_eq!(sweep.points[0], 0.0);
        assert_eq!(sweep.points[4], 0.8);
        assert_eq!(sweep.forward_count, 5);
    }

    #[test]
    fn bidirectional_turnaround_appears_once() {
        for count in [2, 3, 10, 101] {
            let spec = SweepSpec::new(-0.3, 0.7, count, 0.01, true).unwrap();
            let sweep = generate_sweep_points(&spec);
            assert_eq!(sweep.len(), 2 * count - 1);
            assert_eq!(sweep.len(), spec.total_points());
            assert_eq!(sweep.points[count - 1], 0.7);
            assert_eq!(sweep.points.iter().filter(|&&v| v == 0.7).count(), 1);
            assert_eq!(*sweep.points.last().unwrap(), -0.3);
        }
    }

    #[test]
    fn reverse_tag_only_in_bidirectional_runs() {
        let spec = SweepSpec::new(0.0, 1.0, 3, 0.01, true).unwrap();
        let sweep = generate_sweep_points(&spec);
        let tags: Vec<bool> = (0..sweep.len()).map(|i| sweep.is_reverse(i, true)).collect();
        assert_eq!(tags, vec![false, false, false, true, true]);
        assert!(!sweep.is_reverse(4, false));
    }

    #[test]
    fn descending_sweep() {
        let spec = SweepSpec::new(1.0, -1.0, 3, 0.01, false).unwrap();
        assert_eq!(generate_sweep_points(&spec).points, vec![1.0, 0.0, -1.0]);
    }

    #[test]
    fn deserialization_validates() {
        let spec = SweepSpec::new(0.0, 1.0, 5, 0.01, true).unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(serde_json::from_str::<SweepSpec>(&json).unwrap(), spec);

        let zero_points = r#"{"start_voltage":0.0,"stop_voltage":1.0,"num_points":0,
            "compliance_amps":0.01,"bidirectional":true}"#;
        let err = serde_json::from_str::<SweepSpec>(zero_points).unwrap_err();
        assert!(err.to_string().contains("at least 2 points"));

        let flat = r#"{"start_voltage":0.5,"stop_voltage":0.5,"num_points":10,
            "compliance_amps":0.01,"bidirectional":false}"#;
        assert!(serde_json::from_str::<SweepSpec>(flat).is_err());
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(SweepSpec::new(0.5, 0.5, 10, 0.01, false).is_err());
        assert!(SweepSpec::new(0.0, 1.0, 1, 0.01, false).is_err());
        assert!(SweepSpec::new(0.0, f64::NAN, 10, 0.01, false).is_err());
        assert!(SweepSpec::new(0.0, 1.0, 10, 0.0, false).is_err());
        assert!(SweepSpec::new(0.0, 1.0, 10, 1.5, false).is_err());
        assert!(SweepSpec::new(0.0, 1.0, 10, 1.0, false).is_ok());
    }
}
