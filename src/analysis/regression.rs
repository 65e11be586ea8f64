//! Ordinary least-squares line fit.

/// Result of fitting `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    /// Fitted slope
    pub slope: f64,
    /// Fitted intercept
    pub intercept: f64,
    /// Pearson correlation coefficient, in `[-1, 1]`
    pub r_value: f64,
}

impl LinearFit {
    /// Coefficient of determination.
    pub fn r_squared(&self) -> f64 {
        self.r_value * self.r_value
    }
}

/// Least-squares fit of `y` against `x`.
///
/// Returns `None` when the slices differ in length, hold fewer than two points, or all
/// `x` are identical. A horizontal line reports `r_value == 0`. NaN inputs propagate into
/// the returned fit.
pub fn linear_regression(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let n = x.len() as f64;
    let x_mean = x.iter().sum::<f64>() / n;
    let y_mean = y.iter().sum::<f64>() / n;

    let (mut ssxm, mut ssym, mut ssxym) = (0.0, 0.0, 0.0);
    for (&xi, &yi) in x.iter().zip(y) {
        let dx = xi - x_mean;
        let dy = yi - y_mean;
        ssxm += dx * dx;
        ssym += dy * dy;
        ssxym += dx * dy;
    }
    if ssxm == 0.0 {
        return None;
    }

    let slope = ssxym / ssxm;
    let r_value = if ssym == 0.0 {
        0.0
    } else {
        // Rounding can push |r| slightly past 1
        (ssxym / (ssxm * ssym).sqrt()).clamp(-1.0, 1.0)
    };
    Some(LinearFit {
        slope,
        intercept: y_mean - slope * x_mean,
        r_value,
    })
}
