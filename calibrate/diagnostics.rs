//! # Fit Diagnostics and Bandwidth Selection Criteria
//!
//! One calibration run is summarized by:
//!
//! - `RSS`: sum of squared residuals of the main fit,
//! - `ENP`: effective number of parameters, the trace of the hat matrix (the
//!   sum of the per-point leverages),
//! - `AICc`: `n ln(RSS/n) + n ln(2 pi) + n (n + ENP) / (n - 2 - ENP)`,
//! - `CV`: sum of squared leave-one-out prediction errors.
//!
//! All four aggregate over the points whose estimation succeeded; `n` in the
//! AICc is the number of such points. Singular points are counted separately
//! so the criterion strategies can refuse to score an incomplete run.

use crate::estimator::PointStatus;
use crate::kernel::SpecError;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub rss: f64,
    pub enp: f64,
    pub aicc: f64,
    /// `None` when leave-one-out fits were not requested.
    pub cv: Option<f64>,
    pub valid_points: usize,
    pub singular_points: usize,
    pub loo_singular_points: usize,
}

/// Corrected Akaike criterion for `n` observations.
///
/// Returns `+inf` when the small-sample correction is undefined
/// (`n - 2 - ENP <= 0`).
pub fn aicc(n: usize, rss: f64, enp: f64) -> f64 {
    let n = n as f64;
    let denominator = n - 2.0 - enp;
    if n <= 0.0 || denominator <= 0.0 {
        return f64::INFINITY;
    }
    n * (rss / n).ln() + n * (2.0 * PI).ln() + n * (n + enp) / denominator
}

impl Diagnostics {
    /// Aggregates per-point results. `residuals` and `hat_values` hold NaN for
    /// singular points; `loo_residuals`, when present, holds NaN for points
    /// whose leave-one-out fit was singular.
    pub fn compute(
        residuals: ArrayView1<f64>,
        hat_values: ArrayView1<f64>,
        statuses: &[PointStatus],
        loo_residuals: Option<ArrayView1<f64>>,
    ) -> Self {
        let mut rss = 0.0;
        let mut enp = 0.0;
        let mut valid_points = 0;
        for ((status, &e), &h) in statuses.iter().zip(residuals).zip(hat_values) {
            if status.is_estimated() {
                rss += e * e;
                enp += h;
                valid_points += 1;
            }
        }
        let singular_points = statuses.len() - valid_points;

        let (cv, loo_singular_points) = match loo_residuals {
            Some(loo) => {
                let (sum, singular) = loo.iter().fold((0.0, 0), |(sum, singular), &e| {
                    if e.is_finite() {
                        (sum + e * e, singular)
                    } else {
                        (sum, singular + 1)
                    }
                });
                (Some(sum), singular)
            }
            None => (None, 0),
        };

        Self {
            rss,
            enp,
            aicc: aicc(valid_points, rss, enp),
            cv,
            valid_points,
            singular_points,
            loo_singular_points,
        }
    }
}

/// Criterion minimized by the bandwidth optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Criterion {
    #[default]
    #[serde(rename = "CV")]
    Cv,
    #[serde(rename = "AICc")]
    Aicc,
}

impl Criterion {
    pub fn name(&self) -> &'static str {
        match self {
            Criterion::Cv => "CV",
            Criterion::Aicc => "AICc",
        }
    }

    pub fn strategy(&self) -> Box<dyn Objective> {
        match self {
            Criterion::Cv => Box::new(CvObjective),
            Criterion::Aicc => Box::new(AiccObjective),
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Criterion {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cv" => Ok(Criterion::Cv),
            "aicc" => Ok(Criterion::Aicc),
            _ => Err(SpecError::UnknownCriterion(s.to_string())),
        }
    }
}

/// Scores one calibration run; lower is better, `+inf` means unusable.
pub trait Objective: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the calibrator must produce leave-one-out fits for `score`.
    fn requires_leave_one_out(&self) -> bool;

    fn score(&self, diagnostics: &Diagnostics) -> f64;
}

fn finite_or_infinity(value: f64) -> f64 {
    if value.is_finite() { value } else { f64::INFINITY }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CvObjective;

impl Objective for CvObjective {
    fn name(&self) -> &'static str {
        Criterion::Cv.name()
    }

    fn requires_leave_one_out(&self) -> bool {
        true
    }

    fn score(&self, diagnostics: &Diagnostics) -> f64 {
        match diagnostics.cv {
            Some(cv) if diagnostics.loo_singular_points == 0 => finite_or_infinity(cv),
            _ => f64::INFINITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AiccObjective;

impl Objective for AiccObjective {
    fn name(&self) -> &'static str {
        Criterion::Aicc.name()
    }

    fn requires_leave_one_out(&self) -> bool {
        false
    }

    fn score(&self, diagnostics: &Diagnostics) -> f64 {
        if diagnostics.singular_points > 0 {
            return f64::INFINITY;
        }
        finite_or_infinity(diagnostics.aicc)
    }
}
