//! Resonant tunnelling diode I-V fit.
//!
//! The Schulman model describes an RTD's current as a resonant tunnelling term, which
//! produces the peak and the negative differential resistance (NDR) region, plus a thermionic
//! background:
//!
//! ```text
//! I(V) = A ln[(1 + e^a) / (1 + e^b)] (π/2 + atan((C - N1 V) / D)) + H (e^(q N2 V / kT) - 1)
//! a = q (B - C + N1 V) / kT      b = q (B - C - N1 V) / kT
//! ```
//!
//! evaluated at 300 K. Current comes out in whatever unit the fitted data uses (mA for
//! files written by the measurement pipeline).
//!
//! The usual workflow locates the peak and valley inside user-chosen voltage windows,
//! optionally drops the NDR region between them (where measurements oscillate), and fits
//! the seven parameters inside fixed bounds.

use crate::error::AnalysisError;
use argmin::core::{CostFunction, Error as ArgminError, Executor, State};
use argmin::solver::neldermead::NelderMead;
use std::fmt;
use tracing::{debug, info};

const BOLTZMANN: f64 = 1.380_649e-23;
const ELEMENTARY_CHARGE: f64 = 1.602_176_634e-19;
const MODEL_TEMPERATURE_K: f64 = 300.0;

/// q / kT at the model temperature (1/V).
const INVERSE_THERMAL_VOLTAGE: f64 = ELEMENTARY_CHARGE / (BOLTZMANN * MODEL_TEMPERATURE_K);

/// Points kept past the peak when the NDR region is masked.
pub const PEAK_MARGIN_POINTS: usize = 4;

const PARAMETER_COUNT: usize = 7;

/// Relative size of the initial simplex around the starting guess.
const SIMPLEX_STEP: f64 = 0.05;

/// Parameters of the Schulman RTD model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchulmanParams {
    /// Resonant current amplitude
    pub a: f64,
    /// Resonance energy offset (eV)
    pub b: f64,
    /// Resonance position (eV)
    pub c: f64,
    /// Resonance half-width (eV)
    pub d: f64,
    /// Background current amplitude
    pub h: f64,
    /// Voltage lever arm of the resonance
    pub n1: f64,
    /// Ideality of the background current
    pub n2: f64,
}

impl SchulmanParams {
    /// Default starting guess, typical of an InGaAs/AlAs RTD with its peak near 0.6 V.
    pub const INITIAL: SchulmanParams = SchulmanParams {
        a: 5.71e-5,
        b: 1.746,
        c: 2.091,
        d: 0.189,
        h: 3.47e-3,
        n1: 3.17,
        n2: 0.044,
    };

    /// Default lower bounds.
    pub const LOWER: SchulmanParams = SchulmanParams {
        a: 1e-12,
        b: 0.0,
        c: 0.0,
        d: 0.0,
        h: 0.0,
        n1: 0.0,
        n2: 0.0,
    };

    /// Default upper bounds.
    pub const UPPER: SchulmanParams = SchulmanParams {
        a: 1e3,
        b: 2.0,
        c: 3.0,
        d: 3.5,
        h: 1e3,
        n1: 5.0,
        n2: 5.0,
    };

    /// Model current at `voltage`.
    pub fn current(&self, voltage: f64) -> f64 {
        let a = INVERSE_THERMAL_VOLTAGE * (self.b - self.c + self.n1 * voltage);
        let b = INVERSE_THERMAL_VOLTAGE * (self.b - self.c - self.n1 * voltage);
        // ln(1 + e^a) - ln(1 + e^b), stable for large arguments
        let resonant = self.a * (softplus(a) - softplus(b));
        let lorentzian =
            std::f64::consts::FRAC_PI_2 + ((self.c - self.n1 * voltage) / self.d).atan();
        let background = self.h * (INVERSE_THERMAL_VOLTAGE * self.n2 * voltage).exp_m1();
        resonant * lorentzian + background
    }

    fn to_array(self) -> [f64; PARAMETER_COUNT] {
        [self.a, self.b, self.c, self.d, self.h, self.n1, self.n2]
    }

    fn from_slice(values: &[f64]) -> Self {
        Self {
            a: values[0],
            b: values[1],
            c: values[2],
            d: values[3],
            h: values[4],
            n1: values[5],
            n2: values[6],
        }
    }
}

impl fmt::Display for SchulmanParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "A={:.4e} B={:.4} C={:.4} D={:.4} H={:.4e} N1={:.4} N2={:.4}",
            self.a, self.b, self.c, self.d, self.h, self.n1, self.n2
        )
    }
}

/// ln(1 + e^x)
fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Peak and valley located in their search windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakValley {
    /// Voltage of the highest current in the peak window (V)
    pub peak_voltage: f64,
    /// Peak current
    pub peak_current: f64,
    /// Voltage of the lowest current in the valley window (V)
    pub valley_voltage: f64,
    /// Valley current
    pub valley_current: f64,
}

impl PeakValley {
    /// Peak-to-valley current ratio.
    pub fn ratio(&self) -> f64 {
        self.peak_current / self.valley_current
    }
}

fn check_arrays(voltage: &[f64], current: &[f64]) -> Result<(), AnalysisError> {
    if voltage.is_empty() || current.is_empty() {
        return Err(AnalysisError::EmptyData);
    }
    if voltage.len() != current.len() {
        return Err(AnalysisError::LengthMismatch {
            voltage: voltage.len(),
            current: current.len(),
        });
    }
    if voltage.iter().chain(current).any(|v| v.is_nan()) {
        return Err(AnalysisError::NanValues);
    }
    Ok(())
}

/// Highest current inside `peak_window` and lowest inside `valley_window`.
///
/// Windows are inclusive `(low, high)` voltage pairs. On ties the later point wins.
///
/// # Errors
/// [`AnalysisError::EmptyWindow`] when a window holds no data point, plus the usual
/// array checks.
pub fn find_peak_valley(
    voltage: &[f64],
    current: &[f64],
    peak_window: (f64, f64),
    valley_window: (f64, f64),
) -> Result<PeakValley, AnalysisError> {
    check_arrays(voltage, current)?;

    let inside = |window: (f64, f64)| {
        voltage
            .iter()
            .zip(current)
            .filter(move |(v, _)| window.0 <= **v && **v <= window.1)
            .map(|(v, i)| (*v, *i))
    };
    let empty = |window: (f64, f64)| AnalysisError::EmptyWindow {
        lower: window.0,
        upper: window.1,
    };

    let (peak_voltage, peak_current) = inside(peak_window)
        .reduce(|best, point| if point.1 >= best.1 { point } else { best })
        .ok_or_else(|| empty(peak_window))?;
    let (valley_voltage, valley_current) = inside(valley_window)
        .reduce(|best, point| if point.1 <= best.1 { point } else { best })
        .ok_or_else(|| empty(valley_window))?;

    Ok(PeakValley {
        peak_voltage,
        peak_current,
        valley_voltage,
        valley_current,
    })
}

/// Index of the first value closest to `target`.
fn nearest_index(values: &[f64], target: f64) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |(best, distance), (index, value)| {
            let d = (value - target).abs();
            if d < distance {
                (index, d)
            } else {
                (best, distance)
            }
        })
        .0
}

/// Drop the NDR region: keep points up to [`PEAK_MARGIN_POINTS`] past the point nearest
/// `peak_voltage`, then everything from the point nearest `valley_voltage` onward.
///
/// The two parts are concatenated as they are; if the valley index falls inside the kept
/// head, those points appear twice.
pub fn mask_ndr_region(
    voltage: &[f64],
    current: &[f64],
    peak_voltage: f64,
    valley_voltage: f64,
) -> (Vec<f64>, Vec<f64>) {
    let len = voltage.len().min(current.len());
    let head_end = (nearest_index(&voltage[..len], peak_voltage) + PEAK_MARGIN_POINTS).min(len);
    let tail_start = nearest_index(&voltage[..len], valley_voltage);

    let keep = (0..head_end).chain(tail_start..len);
    keep.map(|i| (voltage[i], current[i])).unzip()
}

/// Starting point, bounds and budget of a Schulman fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtdFitOptions {
    /// Starting guess; must lie inside the bounds
    pub initial: SchulmanParams,
    /// Lower parameter bounds
    pub lower: SchulmanParams,
    /// Upper parameter bounds
    pub upper: SchulmanParams,
    /// Optimizer iteration limit
    pub max_iterations: u64,
}

impl Default for RtdFitOptions {
    fn default() -> Self {
        Self {
            initial: SchulmanParams::INITIAL,
            lower: SchulmanParams::LOWER,
            upper: SchulmanParams::UPPER,
            max_iterations: 20_000,
        }
    }
}

/// Result of a Schulman fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtdFit {
    /// Fitted parameters, inside the bounds
    pub params: SchulmanParams,
    /// Sum of squared current residuals
    pub residual_sum_squares: f64,
    /// Coefficient of determination of the fitted curve
    pub r_squared: f64,
    /// Points the fit used
    pub points_used: usize,
    /// Optimizer iterations spent
    pub iterations: u64,
}

/// Least-squares objective over parameters scaled by the starting guess.
///
/// Out-of-bounds parameters are evaluated at the nearest bound and penalized by their
/// squared (scaled) excursion, which keeps the simplex inside the box.
#[derive(Clone)]
struct SchulmanObjective {
    voltage: Vec<f64>,
    current: Vec<f64>,
    scale: [f64; PARAMETER_COUNT],
    lower: [f64; PARAMETER_COUNT],
    upper: [f64; PARAMETER_COUNT],
}

impl SchulmanObjective {
    /// Unscale and clamp; also returns the squared scaled excursion outside the bounds.
    fn params(&self, scaled: &[f64]) -> (SchulmanParams, f64) {
        let mut values = [0.0; PARAMETER_COUNT];
        let mut excess = 0.0;
        for i in 0..PARAMETER_COUNT {
            let raw = scaled[i] * self.scale[i];
            let clamped = raw.clamp(self.lower[i], self.upper[i]);
            excess += ((raw - clamped) / self.scale[i]).powi(2);
            values[i] = clamped;
        }
        (SchulmanParams::from_slice(&values), excess)
    }

    fn residual_sum_squares(&self, params: &SchulmanParams) -> f64 {
        self.voltage
            .iter()
            .zip(&self.current)
            .map(|(v, i)| (params.current(*v) - i).powi(2))
            .sum()
    }
}

impl CostFunction for SchulmanObjective {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, scaled: &Self::Param) -> Result<Self::Output, ArgminError> {
        let (params, excess) = self.params(scaled);
        let rss = self.residual_sum_squares(&params);
        let cost = rss + excess * (1.0 + rss);
        // The simplex ordering cannot handle NaN
        Ok(if cost.is_finite() { cost } else { f64::MAX })
    }
}

/// Fit the Schulman model to `current` against `voltage`.
///
/// Uses a bounded Nelder-Mead search over the seven parameters, each scaled by its
/// starting value.
///
/// # Errors
/// - [`AnalysisError::EmptyData`], [`AnalysisError::LengthMismatch`] or
///   [`AnalysisError::NanValues`] for unusable arrays
/// - [`AnalysisError::TooFewPoints`] with fewer points than parameters plus one
/// - [`AnalysisError::FitFailed`] for a starting guess outside the bounds or an
///   optimizer failure
pub fn fit_schulman(
    voltage: &[f64],
    current: &[f64],
    options: &RtdFitOptions,
) -> Result<RtdFit, AnalysisError> {
    check_arrays(voltage, current)?;
    if voltage.len() <= PARAMETER_COUNT {
        return Err(AnalysisError::TooFewPoints {
            needed: PARAMETER_COUNT + 1,
            got: voltage.len(),
        });
    }

    let initial = options.initial.to_array();
    let lower = options.lower.to_array();
    let upper = options.upper.to_array();
    if (0..PARAMETER_COUNT).any(|i| !(lower[i] <= initial[i] && initial[i] <= upper[i])) {
        return Err(AnalysisError::FitFailed(format!(
            "starting guess {} lies outside the bounds",
            options.initial
        )));
    }

    let scale = initial.map(|p| if p != 0.0 { p.abs() } else { 1.0 });
    let objective = SchulmanObjective {
        voltage: voltage.to_vec(),
        current: current.to_vec(),
        scale,
        lower,
        upper,
    };

    let start: Vec<f64> = (0..PARAMETER_COUNT).map(|i| initial[i] / scale[i]).collect();
    let mut simplex = vec![start.clone()];
    for i in 0..PARAMETER_COUNT {
        let mut vertex = start.clone();
        // Step towards whichever bound leaves room
        let up = (vertex[i] + SIMPLEX_STEP) * scale[i] <= upper[i];
        vertex[i] += if up { SIMPLEX_STEP } else { -SIMPLEX_STEP };
        simplex.push(vertex);
    }

    let solver = NelderMead::new(simplex)
        .with_sd_tolerance(1e-14)
        .map_err(|e| AnalysisError::FitFailed(e.to_string()))?;
    debug!(points = voltage.len(), "Starting Schulman fit");
    let result = Executor::new(objective.clone(), solver)
        .configure(|state| state.max_iters(options.max_iterations))
        .run()
        .map_err(|e| AnalysisError::FitFailed(e.to_string()))?;

    let state = result.state();
    let best = state
        .get_best_param()
        .ok_or_else(|| AnalysisError::FitFailed("optimizer returned no parameters".to_string()))?;
    let iterations = state.get_iter();
    let (params, _) = objective.params(best);
    let residual_sum_squares = objective.residual_sum_squares(&params);

    let mean = current.iter().sum::<f64>() / current.len() as f64;
    let total: f64 = current.iter().map(|i| (i - mean).powi(2)).sum();
    let r_squared = if total > 0.0 {
        1.0 - residual_sum_squares / total
    } else if residual_sum_squares == 0.0 {
        1.0
    } else {
        0.0
    };

    info!(
        %params,
        residual_sum_squares,
        r_squared,
        iterations,
        "Schulman fit finished"
    );
    Ok(RtdFit {
        params,
        residual_sum_squares,
        r_squared,
        points_used: voltage.len(),
        iterations,
    })
}
