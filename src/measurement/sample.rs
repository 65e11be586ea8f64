//! Acquired samples and the per-run result accumulator.

use crate::measurement::sweep::SweepSpec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Amps to milliamps.
pub const AMPS_TO_MILLIAMPS: f64 = 1e3;
/// Watts to microwatts.
pub const WATTS_TO_MICROWATTS: f64 = 1e6;

/// One reading taken at one sweep point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Position in the sweep point sequence
    pub index: usize,
    /// Measured voltage, or the commanded one if the instrument only reported current (V)
    pub voltage: f64,
    /// Measured current (mA)
    pub current_ma: f64,
    /// Optical power (µW), P-I-V runs only
    pub optical_power_uw: Option<f64>,
    /// Taken on the return leg of a bidirectional sweep
    pub is_reverse: bool,
}

/// Column data of one sweep leg.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepBranch {
    /// Voltages (V)
    pub voltage: Vec<f64>,
    /// Currents (mA)
    pub current_ma: Vec<f64>,
    /// Optical power (µW), present when the run recorded power
    pub optical_power_uw: Option<Vec<f64>>,
}

impl SweepBranch {
    fn push(&mut self, sample: &Sample) {
        self.voltage.push(sample.voltage);
        self.current_ma.push(sample.current_ma);
        if let (Some(column), Some(power)) =
            (self.optical_power_uw.as_mut(), sample.optical_power_uw)
        {
            column.push(power);
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.voltage.len()
    }

    /// Whether the branch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.voltage.is_empty()
    }
}

/// Outcome data of one run, partitioned by sweep direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Identifier shared with the run's events
    pub run_id: Uuid,
    /// Sweep that produced the data
    pub spec: SweepSpec,
    /// Samples with `is_reverse == false`
    pub forward: SweepBranch,
    /// Samples with `is_reverse == true`; empty for unidirectional runs
    pub reverse: SweepBranch,
}

impl RunResult {
    /// Partition `samples` by their reverse tag, keeping acquisition order within each leg.
    ///
    /// Power columns exist only when every sample carries a power value.
    pub fn from_samples(run_id: Uuid, spec: SweepSpec, samples: &[Sample]) -> Self {
        let has_power = !samples.is_empty() && samples.iter().all(|s| s.optical_power_uw.is_some());
        let empty = || SweepBranch {
            optical_power_uw: has_power.then(Vec::new),
            ..SweepBranch::default()
        };
        let mut forward = empty();
        let mut reverse = empty();
        for sample in samples {
            if sample.is_reverse {
                reverse.push(sample);
            } else {
                forward.push(sample);
            }
        }
        Self {
            run_id,
            spec,
            forward,
            reverse,
        }
    }

    /// Total number of samples.
    pub fn len(&self) -> usize {
        self.forward.len() + self.reverse.len()
    }

    /// Whether nothing was acquired.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether optical power was recorded.
    pub fn has_power(&self) -> bool {
        self.forward.optical_power_uw.is_some()
    }
}
