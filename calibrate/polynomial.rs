//! # Local Polynomial Estimator
//!
//! Kernel smoothing assumes every coefficient is constant inside the
//! neighborhood. Near the edge of the coordinate space the neighborhood is
//! one-sided, so a sloped coefficient surface gets pulled toward the interior.
//! The local polynomial estimator lets each coefficient vary within the
//! neighborhood:
//!
//! `beta_a(u_j) ~ beta_a(u_i) + sum_{c, m} gamma_{a,c,m} ((u_jc - u_ic) / b)^m`
//!
//! which, multiplied through by `x_ja`, adds the columns
//! `x_ja * ((u_jc - u_ic) / b)^m` to the weighted design. Only the zero-order
//! block `beta_a(u_i)` is reported; the `gamma` terms absorb the local trend.
//!
//! Offsets are divided by the target's bandwidth in that dimension. This is a
//! column rescaling, so the zero-order block and the hat value are unchanged;
//! it only keeps the normal matrix well conditioned.
//!
//! When the neighborhood cannot support the expanded design the degree is
//! lowered one step at a time, down to plain kernel smoothing at degree 0.

use crate::estimator::{
    DEFAULT_SINGULAR_TOLERANCE, EstimationError, LocalEstimator, LocalFit, LocalProblem,
    Solver, check_tolerance, weighted_least_squares,
};
use crate::kernel::SpecError;
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};

/// Highest polynomial degree accepted in the offsets.
pub const MAX_LOCAL_DEGREE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalPolyOptions {
    pub degree: usize,
    pub singular_tolerance: f64,
}

impl Default for LocalPolyOptions {
    fn default() -> Self {
        Self {
            degree: 1,
            singular_tolerance: DEFAULT_SINGULAR_TOLERANCE,
        }
    }
}

impl LocalPolyOptions {
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.degree > MAX_LOCAL_DEGREE {
            return Err(SpecError::InvalidSolverOption(format!(
                "local polynomial degree must be at most {MAX_LOCAL_DEGREE}, got {}",
                self.degree
            )));
        }
        check_tolerance(self.singular_tolerance)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalPolynomialEstimator {
    options: LocalPolyOptions,
}

impl LocalPolynomialEstimator {
    pub fn new(options: LocalPolyOptions) -> Self {
        Self { options }
    }
}

/// Target-centred, bandwidth-scaled offsets of the support rows, one column
/// per coordinate column across all dimensions that have coordinates.
fn scaled_offsets(problem: &LocalProblem<'_>, support: &[usize]) -> Array2<f64> {
    let mut columns: Vec<(&ArrayView2<f64>, usize, f64)> = Vec::new();
    for (k, coords) in problem.coordinates.iter().enumerate() {
        let Some(coords) = coords else { continue };
        let bandwidth = problem.bandwidths.get(k).copied().unwrap_or(1.0);
        let scale = if bandwidth.is_finite() && bandwidth > 0.0 {
            bandwidth
        } else {
            1.0
        };
        for c in 0..coords.ncols() {
            columns.push((coords, c, scale));
        }
    }

    let mut offsets = Array2::zeros((support.len(), columns.len()));
    for (col, (coords, c, scale)) in columns.iter().enumerate() {
        let origin = coords[(problem.target, *c)];
        for (row, &j) in support.iter().enumerate() {
            offsets[(row, col)] = (coords[(j, *c)] - origin) / *scale;
        }
    }
    offsets
}

/// `[X | X * t | X * t^2 | ...]` over the support rows, where each `t` block
/// iterates every offset column for every predictor column.
fn expanded_design(base: ArrayView2<f64>, offsets: ArrayView2<f64>, degree: usize) -> Array2<f64> {
    let (rows, q) = base.dim();
    let terms = offsets.ncols();
    let mut design = Array2::zeros((rows, q * (1 + degree * terms)));
    design.slice_mut(s![.., ..q]).assign(&base);

    let mut col = q;
    for a in 0..q {
        for t in 0..terms {
            for m in 1..=degree {
                for row in 0..rows {
                    design[(row, col)] = base[(row, a)] * offsets[(row, t)].powi(m as i32);
                }
                col += 1;
            }
        }
    }
    design
}

impl LocalEstimator for LocalPolynomialEstimator {
    fn name(&self) -> &'static str {
        Solver::LOCAL_POLY
    }

    fn estimate(&self, problem: &LocalProblem<'_>) -> Result<LocalFit, EstimationError> {
        let q = problem.design.ncols();
        let support = problem.support();
        if support.len() < q {
            return Err(EstimationError::InsufficientSupport {
                target: problem.target,
                support: support.len(),
                parameters: q,
            });
        }

        let base = problem.design.select(Axis(0), &support);
        let weights = problem.weights.select(Axis(0), &support);
        let response = problem.response.select(Axis(0), &support);
        let offsets = scaled_offsets(problem, &support);
        let target_weight = problem.weights[problem.target];
        let target_base = problem.design.row(problem.target);

        let max_degree = if offsets.ncols() == 0 {
            0
        } else {
            self.options.degree
        };

        for degree in (0..=max_degree).rev() {
            let design = expanded_design(base.view(), offsets.view(), degree);
            if design.ncols() > support.len() {
                continue;
            }
            // Every offset of the target itself is zero.
            let mut target_row = Array1::zeros(design.ncols());
            target_row.slice_mut(s![..q]).assign(&target_base);

            match weighted_least_squares(
                design.view(),
                weights.view(),
                response.view(),
                &target_row,
                target_weight,
                self.options.singular_tolerance,
            ) {
                Ok(solution) => {
                    let coefficients = solution.beta.slice(s![..q]).to_owned();
                    let fitted = target_base.dot(&coefficients);
                    return Ok(LocalFit {
                        coefficients,
                        fitted,
                        hat_value: solution.hat_value,
                        degree,
                    });
                }
                Err(err) => {
                    log::trace!(
                        "Target {} rejected local degree {}: {}",
                        problem.target,
                        degree,
                        err
                    );
                }
            }
        }

        Err(EstimationError::SingularNeighborhood {
            target: problem.target,
            support: support.len(),
            parameters: q,
        })
    }
}
