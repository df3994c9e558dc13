// calibrate/estimator.rs

//! # Local Estimators
//!
//! A local estimator turns one target's composite weight row into a local
//! coefficient vector. Two estimators exist:
//!
//! 1.  **Kernel smooth** (`"kernel.smooth"`): weighted least squares on the
//!     original design, assuming the coefficient surface is locally constant.
//!
//! 2.  **Local polynomial** (`"local.poly"`, see `polynomial.rs`): augments the
//!     design with coordinate-offset terms so the coefficient surface is
//!     assumed locally smooth rather than constant, reducing boundary bias.
//!
//! Both return the zero-order coefficients, the fitted value at the target and
//! its leverage (hat value). A non-invertible weighted design is reported as
//! `SingularNeighborhood`; the calibrator records it for that point only.

use crate::kernel::SpecError;
use crate::linalg::{EquilibratedCholesky, LinalgError};
use crate::polynomial::{LocalPolyOptions, LocalPolynomialEstimator};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default lower bound on the smallest squared pivot of an equilibrated
/// weighted normal matrix.
pub const DEFAULT_SINGULAR_TOLERANCE: f64 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimationError {
    #[error(
        "The weighted design at target {target} is singular: {support} samples carry weight for {parameters} parameters."
    )]
    SingularNeighborhood {
        target: usize,
        support: usize,
        parameters: usize,
    },

    #[error(
        "Target {target} has only {support} samples with positive weight, fewer than the {parameters} local parameters."
    )]
    InsufficientSupport {
        target: usize,
        support: usize,
        parameters: usize,
    },
}

/// Outcome of one target point's estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointStatus {
    /// Estimated with the given polynomial degree (0 for kernel smoothing).
    Estimated { degree: usize },
    /// Non-invertible weighted design; the row holds NaN.
    Singular,
}

impl PointStatus {
    pub fn is_estimated(&self) -> bool {
        matches!(self, PointStatus::Estimated { .. })
    }
}

impl fmt::Display for PointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointStatus::Estimated { degree } => write!(f, "ok(degree={degree})"),
            PointStatus::Singular => f.write_str("singular"),
        }
    }
}

/// Everything an estimator may read for one target.
pub struct LocalProblem<'a> {
    pub target: usize,
    pub weights: ArrayView1<'a, f64>,
    /// `n x (p + 1)` design including the intercept column.
    pub design: ArrayView2<'a, f64>,
    pub response: ArrayView1<'a, f64>,
    /// Per-dimension coordinates, `None` for dimensions without any.
    pub coordinates: &'a [Option<ArrayView2<'a, f64>>],
    /// Per-dimension bandwidths resolved for this target.
    pub bandwidths: &'a [f64],
}

impl LocalProblem<'_> {
    /// Indices of samples with strictly positive weight.
    pub fn support(&self) -> Vec<usize> {
        self.weights
            .iter()
            .enumerate()
            .filter_map(|(j, &w)| (w > 0.0).then_some(j))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalFit {
    /// Zero-order coefficients, length `p + 1`.
    pub coefficients: Array1<f64>,
    pub fitted: f64,
    pub hat_value: f64,
    pub degree: usize,
}

pub trait LocalEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    fn estimate(&self, problem: &LocalProblem<'_>) -> Result<LocalFit, EstimationError>;
}

/// Result of a weighted least squares solve on a support subset.
pub(crate) struct WeightedSolution {
    pub beta: Array1<f64>,
    /// `w_i z_i' (Z'WZ)^{-1} z_i`.
    pub hat_value: f64,
}

/// Solves `(Z'WZ) beta = Z'Wy` over the support rows only.
///
/// `design` and `response` are already restricted to the support, `weights`
/// likewise. `target_row` is the target's design row and `target_weight` its
/// own weight (zero in leave-one-out mode, which makes the hat value zero).
pub(crate) fn weighted_least_squares(
    design: ArrayView2<f64>,
    weights: ArrayView1<f64>,
    response: ArrayView1<f64>,
    target_row: &Array1<f64>,
    target_weight: f64,
    tolerance: f64,
) -> Result<WeightedSolution, LinalgError> {
    let mut weighted = design.to_owned();
    for (mut row, &w) in weighted.axis_iter_mut(Axis(0)).zip(weights.iter()) {
        row *= w;
    }
    let xtwx: Array2<f64> = design.t().dot(&weighted);
    let xtwy: Array1<f64> = weighted.t().dot(&response);

    let chol = EquilibratedCholesky::factor(&xtwx, tolerance)?;
    let beta = chol.solve(&xtwy);
    let hat_value = if target_weight > 0.0 {
        target_weight * chol.inverse_quadratic_form(target_row)
    } else {
        0.0
    };
    Ok(WeightedSolution { beta, hat_value })
}

pub(crate) fn check_tolerance(tolerance: f64) -> Result<(), SpecError> {
    if !(tolerance.is_finite() && tolerance > 0.0 && tolerance < 1.0) {
        return Err(SpecError::InvalidSolverOption(format!(
            "singular_tolerance must lie in (0, 1), got {tolerance}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSmoothOptions {
    pub singular_tolerance: f64,
}

impl Default for KernelSmoothOptions {
    fn default() -> Self {
        Self {
            singular_tolerance: DEFAULT_SINGULAR_TOLERANCE,
        }
    }
}

/// `beta_i = (X'W_iX)^{-1} X'W_i y`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelSmoothEstimator {
    options: KernelSmoothOptions,
}

impl KernelSmoothEstimator {
    pub fn new(options: KernelSmoothOptions) -> Self {
        Self { options }
    }
}

impl LocalEstimator for KernelSmoothEstimator {
    fn name(&self) -> &'static str {
        Solver::KERNEL_SMOOTH
    }

    fn estimate(&self, problem: &LocalProblem<'_>) -> Result<LocalFit, EstimationError> {
        let parameters = problem.design.ncols();
        let support = problem.support();
        let singular = || EstimationError::SingularNeighborhood {
            target: problem.target,
            support: support.len(),
            parameters,
        };
        if support.len() < parameters {
            return Err(EstimationError::InsufficientSupport {
                target: problem.target,
                support: support.len(),
                parameters,
            });
        }

        let design = problem.design.select(Axis(0), &support);
        let weights = problem.weights.select(Axis(0), &support);
        let response = problem.response.select(Axis(0), &support);
        let target_row = problem.design.row(problem.target).to_owned();

        let solution = weighted_least_squares(
            design.view(),
            weights.view(),
            response.view(),
            &target_row,
            problem.weights[problem.target],
            self.options.singular_tolerance,
        )
        .map_err(|_| singular())?;

        let fitted = target_row.dot(&solution.beta);
        Ok(LocalFit {
            coefficients: solution.beta,
            fitted,
            hat_value: solution.hat_value,
            degree: 0,
        })
    }
}

/// Local estimator selection, each variant carrying its own options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Solver {
    #[serde(rename = "kernel.smooth")]
    KernelSmooth(KernelSmoothOptions),
    #[serde(rename = "local.poly")]
    LocalPoly(LocalPolyOptions),
}

impl Solver {
    pub const KERNEL_SMOOTH: &'static str = "kernel.smooth";
    pub const LOCAL_POLY: &'static str = "local.poly";

    pub fn kernel_smooth() -> Self {
        Solver::KernelSmooth(KernelSmoothOptions::default())
    }

    pub fn local_poly() -> Self {
        Solver::LocalPoly(LocalPolyOptions::default())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Solver::KernelSmooth(_) => Self::KERNEL_SMOOTH,
            Solver::LocalPoly(_) => Self::LOCAL_POLY,
        }
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        match self {
            Solver::KernelSmooth(options) => check_tolerance(options.singular_tolerance),
            Solver::LocalPoly(options) => options.validate(),
        }
    }

    /// Runs `f` with the concrete estimator this variant selects.
    pub(crate) fn with_estimator<R>(&self, f: impl FnOnce(&dyn LocalEstimator) -> R) -> R {
        match self {
            Solver::KernelSmooth(options) => f(&KernelSmoothEstimator::new(*options)),
            Solver::LocalPoly(options) => f(&LocalPolynomialEstimator::new(*options)),
        }
    }
}

impl Default for Solver {
    fn default() -> Self {
        Solver::kernel_smooth()
    }
}

impl FromStr for Solver {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            Self::KERNEL_SMOOTH => Ok(Solver::kernel_smooth()),
            Self::LOCAL_POLY => Ok(Solver::local_poly()),
            other => Err(SpecError::UnknownSolver(other.to_string())),
        }
    }
}
