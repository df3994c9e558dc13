// calibrate/calibrator.rs

//! # Model Calibration
//!
//! Calibration fits one local regression per sample. For each target `i`:
//!
//! 1.  The `WeightComposer` builds the product-kernel weight row.
//! 2.  The selected local estimator solves the weighted problem and reports
//!     the zero-order coefficients, the fitted value and the leverage.
//! 3.  When leave-one-out is enabled the target's own weight is zeroed and the
//!     estimator runs again, giving the cross-validation residual.
//!
//! Targets are independent, so the loop is a parallel map merged by index.
//! A point whose neighborhood is singular gets a NaN row and a `Singular`
//! status; the remaining points are unaffected.
//!
//! The calibrator holds no state that depends on the bandwidths, so the same
//! instance (and its optional distance cache) serves every evaluation of a
//! bandwidth search.

use crate::data::{DataError, Dataset};
use crate::diagnostics::Diagnostics;
use crate::distance::{DistanceCache, DistanceError, DistanceProvider};
use crate::estimator::{LocalEstimator, LocalFit, LocalProblem, PointStatus, Solver};
use crate::kernel::{KernelSpec, ResolvedKernel, SpecError, resolve_specs};
use crate::output::CoefficientTable;
use crate::weights::{SelfWeight, WeightComposer};
use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Invalid dataset: {0}")]
    Data(#[from] DataError),

    #[error("Invalid distance source: {0}")]
    Distance(#[from] DistanceError),

    #[error("Invalid specification: {0}")]
    InvalidSpec(#[from] SpecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Run the per-target loop on the rayon pool.
    pub parallel: bool,
    /// Also compute leave-one-out fits, needed for the CV diagnostic.
    pub leave_one_out: bool,
    /// Lower clamp for adaptive neighbor counts.
    pub min_neighbors: usize,
    /// Materialize every dimension's distance matrix once up front.
    pub cache_distances: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            leave_one_out: true,
            min_neighbors: 1,
            cache_distances: false,
        }
    }
}

/// Everything one calibration run produces.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub table: CoefficientTable,
    pub diagnostics: Diagnostics,
    pub kernels: Vec<ResolvedKernel>,
}

impl Calibration {
    pub fn coefficients(&self) -> &Array2<f64> {
        &self.table.coefficients
    }

    pub fn statuses(&self) -> &[PointStatus] {
        &self.table.status
    }
}

struct PointResult {
    fit: Option<LocalFit>,
    status: PointStatus,
    loo_residual: Option<f64>,
}

pub struct ModelCalibrator<'a> {
    dataset: &'a Dataset,
    solver: Solver,
    config: CalibrationConfig,
    design: Array2<f64>,
    cache: Option<DistanceCache>,
    max_distances: Vec<f64>,
}

impl<'a> ModelCalibrator<'a> {
    pub fn new(
        dataset: &'a Dataset,
        solver: Solver,
        config: CalibrationConfig,
    ) -> Result<Self, CalibrationError> {
        solver.validate()?;
        let n = dataset.n_samples();
        if config.min_neighbors == 0 || config.min_neighbors > n {
            return Err(SpecError::InvalidMinNeighbors {
                min_neighbors: config.min_neighbors,
                n,
            }
            .into());
        }

        let cache = config
            .cache_distances
            .then(|| DistanceCache::build(dataset.groups()));
        let max_distances = match &cache {
            Some(cache) => cache.max_distances().to_vec(),
            None => dataset.max_distances(),
        };
        Ok(Self {
            dataset,
            solver,
            config,
            design: dataset.design_matrix(),
            cache,
            max_distances,
        })
    }

    /// Same calibrator with distance caching switched on.
    pub fn with_cached_distances(mut self) -> Self {
        if self.cache.is_none() {
            let cache = DistanceCache::build(self.dataset.groups());
            self.max_distances = cache.max_distances().to_vec();
            self.cache = Some(cache);
            self.config.cache_distances = true;
        }
        self
    }

    pub fn dataset(&self) -> &Dataset {
        self.dataset
    }

    pub fn solver(&self) -> &Solver {
        &self.solver
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Largest pairwise distance per dimension, the bound for fixed bandwidths.
    pub fn max_distances(&self) -> &[f64] {
        &self.max_distances
    }

    pub fn resolve(&self, specs: &[KernelSpec]) -> Result<Vec<ResolvedKernel>, SpecError> {
        resolve_specs(
            specs,
            self.dataset.n_dimensions(),
            self.dataset.n_samples(),
            &self.max_distances,
            self.config.min_neighbors,
        )
    }

    pub fn calibrate(&self, specs: &[KernelSpec]) -> Result<Calibration, CalibrationError> {
        log::info!(
            "Calibrating {} points ({} predictors, {} dimensions) with solver '{}'.",
            self.dataset.n_samples(),
            self.dataset.n_predictors(),
            self.dataset.n_dimensions(),
            self.solver.name()
        );
        let calibration = self.calibrate_with(specs, self.config.leave_one_out)?;
        for (k, kernel) in calibration.kernels.iter().enumerate() {
            log::debug!(
                "Dimension {k}: {} kernel ({} support), bandwidth {:?}.",
                kernel.function,
                if kernel.function.has_compact_support() {
                    "compact"
                } else {
                    "unbounded"
                },
                kernel.bandwidth
            );
        }
        let d = &calibration.diagnostics;
        log::info!(
            "Calibration finished: RSS={:.6}, ENP={:.4}, AICc={:.4}, CV={}",
            d.rss,
            d.enp,
            d.aicc,
            d.cv.map_or_else(|| "n/a".to_string(), |cv| format!("{cv:.6}"))
        );
        Ok(calibration)
    }

    /// Calibration with an explicit leave-one-out choice, used by the
    /// optimizer to skip the second pass when its criterion does not need it.
    pub fn calibrate_with(
        &self,
        specs: &[KernelSpec],
        leave_one_out: bool,
    ) -> Result<Calibration, CalibrationError> {
        let kernels = self.resolve(specs)?;
        let results = self
            .solver
            .with_estimator(|estimator| self.run_points(estimator, &kernels, leave_one_out));
        Ok(self.assemble(results, kernels, leave_one_out))
    }

    fn providers(&self) -> Vec<&dyn DistanceProvider> {
        match &self.cache {
            Some(cache) => cache.providers(),
            None => self
                .dataset
                .groups()
                .iter()
                .map(|g| g as &dyn DistanceProvider)
                .collect(),
        }
    }

    fn run_points(
        &self,
        estimator: &dyn LocalEstimator,
        kernels: &[ResolvedKernel],
        leave_one_out: bool,
    ) -> Vec<PointResult> {
        let composer = WeightComposer::new(self.providers(), kernels);
        let coordinates: Vec<Option<ArrayView2<f64>>> = self
            .dataset
            .groups()
            .iter()
            .map(|g| g.coordinates())
            .collect();
        let response = self.dataset.response();

        let estimate_point = |target: usize| -> PointResult {
            let row = composer.row(target, SelfWeight::Include);
            let coordinates: Vec<Option<ArrayView2<f64>>> = coordinates
                .iter()
                .map(|c| c.as_ref().map(|v| v.view()))
                .collect();
            let problem = LocalProblem {
                target,
                weights: row.weights.view(),
                design: self.design.view(),
                response: response.view(),
                coordinates: &coordinates,
                bandwidths: &row.bandwidths,
            };
            let (fit, status) = match estimator.estimate(&problem) {
                Ok(fit) => {
                    let status = PointStatus::Estimated { degree: fit.degree };
                    (Some(fit), status)
                }
                Err(err) => {
                    log::debug!("{}: {err}", estimator.name());
                    (None, PointStatus::Singular)
                }
            };

            let loo_residual = leave_one_out.then(|| {
                let loo_row = row.leave_one_out();
                let loo_coordinates: Vec<Option<ArrayView2<f64>>> = problem
                    .coordinates
                    .iter()
                    .map(|c| c.as_ref().map(|v| v.view()))
                    .collect();
                let loo_problem = LocalProblem {
                    target: problem.target,
                    weights: loo_row.weights.view(),
                    design: problem.design.view(),
                    response: problem.response.view(),
                    coordinates: &loo_coordinates,
                    bandwidths: problem.bandwidths,
                };
                estimator
                    .estimate(&loo_problem)
                    .map_or(f64::NAN, |loo| response[target] - loo.fitted)
            });

            PointResult {
                fit,
                status,
                loo_residual,
            }
        };

        let n = self.dataset.n_samples();
        if self.config.parallel {
            (0..n).into_par_iter().map(estimate_point).collect()
        } else {
            (0..n).map(estimate_point).collect()
        }
    }

    fn assemble(
        &self,
        results: Vec<PointResult>,
        kernels: Vec<ResolvedKernel>,
        leave_one_out: bool,
    ) -> Calibration {
        let n = self.dataset.n_samples();
        let q = self.design.ncols();
        let response = self.dataset.response();

        let mut coefficients = Array2::from_elem((n, q), f64::NAN);
        let mut fitted = Array1::from_elem(n, f64::NAN);
        let mut residuals = Array1::from_elem(n, f64::NAN);
        let mut hat_values = Array1::from_elem(n, f64::NAN);
        let mut loo_residuals = Array1::from_elem(n, f64::NAN);
        let mut status = Vec::with_capacity(n);

        for (i, result) in results.into_iter().enumerate() {
            if let Some(fit) = result.fit {
                coefficients.row_mut(i).assign(&fit.coefficients);
                fitted[i] = fit.fitted;
                residuals[i] = response[i] - fit.fitted;
                hat_values[i] = fit.hat_value;
            }
            if let Some(e) = result.loo_residual {
                loo_residuals[i] = e;
            }
            status.push(result.status);
        }

        let diagnostics = Diagnostics::compute(
            residuals.view(),
            hat_values.view(),
            &status,
            leave_one_out.then(|| loo_residuals.view()),
        );
        if diagnostics.singular_points > 0 {
            log::warn!(
                "{} of {} points have singular neighborhoods and were left as NaN rows.",
                diagnostics.singular_points,
                n
            );
        }
        if diagnostics.loo_singular_points > 0 {
            log::warn!(
                "{} leave-one-out fits were singular; CV covers the remaining points only.",
                diagnostics.loo_singular_points
            );
        }

        Calibration {
            table: CoefficientTable {
                names: self.dataset.coefficient_names(),
                coefficients,
                fitted,
                residuals,
                hat_values,
                status,
            },
            diagnostics,
            kernels,
        }
    }
}

/// One-shot calibration with the default configuration.
pub fn calibrate(
    dataset: &Dataset,
    specs: &[KernelSpec],
    solver: Solver,
) -> Result<Calibration, CalibrationError> {
    ModelCalibrator::new(dataset, solver, CalibrationConfig::default())?.calibrate(specs)
}
