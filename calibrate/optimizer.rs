// calibrate/optimizer.rs

//! # Bandwidth Optimization
//!
//! The bandwidth vector (one entry per coordinate dimension) is chosen by
//! minimizing a calibration criterion (CV or AICc). Every objective evaluation
//! is a full calibration, and the criterion is piecewise constant in adaptive
//! fractions, so a derivative-free Nelder-Mead simplex is used.
//!
//! Adaptive entries are neighbor fractions and fixed entries are distances.
//! Candidates outside the feasible region (an adaptive fraction whose rounded
//! neighbor count falls outside `[min_neighbors, n]`, a fixed bandwidth outside
//! `(0, max pairwise distance]`) score `+inf` without being calibrated, which
//! keeps the simplex inside the region.
//!
//! Adaptive coordinates are measured in neighbors: the first simplex edge
//! spans at least two neighbors, the simplex only counts as resolved once it
//! is narrower than a quarter of a neighbor, and a converged search finishes
//! with a one-neighbor-at-a-time descent so the reported fraction is a local
//! minimum over neighbor counts.
//!
//! The search never fails once the initial specification validates. Hitting
//! the iteration budget, the deadline or a cancellation request returns the
//! best vector found with the reason in `Termination`.

use crate::calibrator::{CalibrationConfig, CalibrationError, ModelCalibrator};
use crate::data::Dataset;
use crate::diagnostics::{Criterion, Objective};
use crate::estimator::Solver;
use crate::kernel::{KernelSpec, neighbor_count};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Simplex step used for a zero starting coordinate.
const ZERO_COORDINATE_STEP: f64 = 0.00025;

/// Smallest initial simplex edge along an adaptive coordinate, in neighbors.
const MIN_ADAPTIVE_STEP_NEIGHBORS: f64 = 2.0;

/// Simplex spread along an adaptive coordinate that counts as resolved, in
/// neighbors.
const ADAPTIVE_TOLERANCE_NEIGHBORS: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub max_iterations: usize,
    pub max_evaluations: usize,
    /// Relative simplex diameter below which the search may stop. Adaptive
    /// coordinates use a quarter neighbor instead.
    pub x_tolerance: f64,
    /// Relative spread of vertex values below which the search may stop.
    pub f_tolerance: f64,
    /// Initial simplex edge as a fraction of each starting coordinate.
    pub initial_step: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_seconds: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            max_evaluations: 400,
            x_tolerance: 1e-4,
            f_tolerance: 1e-6,
            initial_step: 0.05,
            deadline_seconds: None,
        }
    }
}

/// Cooperative cancellation flag shared between the caller and a running search.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    Converged,
    /// The iteration or evaluation budget ran out first.
    IterationLimit,
    Cancelled,
    DeadlineReached,
    /// Every vertex of the starting simplex scored `+inf`.
    NoFiniteStart,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Termination::Converged => "converged",
            Termination::IterationLimit => "iteration limit reached",
            Termination::Cancelled => "cancelled",
            Termination::DeadlineReached => "deadline reached",
            Termination::NoFiniteStart => "no finite criterion value around the start",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationOutcome {
    pub kernel_specs: Vec<KernelSpec>,
    pub criterion_value: f64,
    pub initial_value: f64,
    pub termination: Termination,
    pub iterations: usize,
    pub evaluations: usize,
}

impl OptimizationOutcome {
    pub fn converged(&self) -> bool {
        self.termination == Termination::Converged
    }
}

pub struct BandwidthOptimizer<'a> {
    calibrator: ModelCalibrator<'a>,
    objective: Box<dyn Objective>,
    config: OptimizerConfig,
    cancellation: CancellationToken,
}

impl<'a> BandwidthOptimizer<'a> {
    /// Distances are cached for the whole search regardless of
    /// `calibration.cache_distances`.
    pub fn new(
        dataset: &'a Dataset,
        solver: Solver,
        criterion: Criterion,
        calibration: CalibrationConfig,
        config: OptimizerConfig,
    ) -> Result<Self, CalibrationError> {
        let calibrator = ModelCalibrator::new(dataset, solver, calibration)?.with_cached_distances();
        Ok(Self {
            calibrator,
            objective: criterion.strategy(),
            config,
            cancellation: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn calibrator(&self) -> &ModelCalibrator<'a> {
        &self.calibrator
    }

    /// Specs for a candidate vector. Adaptive fractions are capped at 1.
    fn specs_for(template: &[KernelSpec], x: &Array1<f64>) -> Vec<KernelSpec> {
        template
            .iter()
            .zip(x.iter())
            .map(|(spec, &value)| {
                let bandwidth = if spec.adaptive { value.min(1.0) } else { value };
                spec.with_bandwidth(bandwidth)
            })
            .collect()
    }

    fn is_feasible(&self, template: &[KernelSpec], x: &Array1<f64>) -> bool {
        let n = self.calibrator.dataset().n_samples();
        let min_neighbors = self.calibrator.config().min_neighbors;
        let max_distances = self.calibrator.max_distances();
        template.iter().zip(x.iter()).enumerate().all(|(k, (spec, &value))| {
            if !(value.is_finite() && value > 0.0) {
                return false;
            }
            if spec.adaptive {
                let count = neighbor_count(value, n);
                count >= min_neighbors && count <= n
            } else {
                max_distances.get(k).is_some_and(|&max| value <= max)
            }
        })
    }

    /// Criterion value of a candidate, `+inf` when infeasible or unusable.
    pub fn evaluate(&self, template: &[KernelSpec], x: &Array1<f64>) -> f64 {
        if !self.is_feasible(template, x) {
            return f64::INFINITY;
        }
        let specs = Self::specs_for(template, x);
        match self
            .calibrator
            .calibrate_with(&specs, self.objective.requires_leave_one_out())
        {
            Ok(calibration) => self.objective.score(&calibration.diagnostics),
            Err(err) => {
                log::debug!("Candidate {:?} rejected: {}", x, err);
                f64::INFINITY
            }
        }
    }

    /// Initial edges and resolution per coordinate. Adaptive coordinates are
    /// sized in neighbors of this dataset.
    fn simplex_scale(&self, template: &[KernelSpec], x0: &Array1<f64>) -> internal::SimplexScale {
        let n = self.calibrator.dataset().n_samples() as f64;
        let mut scale = internal::SimplexScale::relative(x0, &self.config);
        for (k, spec) in template.iter().enumerate() {
            if spec.adaptive {
                scale.steps[k] = scale.steps[k].max(MIN_ADAPTIVE_STEP_NEIGHBORS / n);
                scale.tolerances[k] = ADAPTIVE_TOLERANCE_NEIGHBORS / n;
            }
        }
        scale
    }

    /// Moves adaptive coordinates one neighbor at a time while the criterion
    /// improves. Fractions are snapped to `count / n` first, which leaves the
    /// criterion unchanged.
    fn refine_counts<S>(
        &self,
        template: &[KernelSpec],
        result: &mut internal::SimplexResult,
        should_stop: S,
    ) where
        S: Fn() -> Option<Termination>,
    {
        let n = self.calibrator.dataset().n_samples();
        let adaptive: Vec<usize> = template
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.adaptive)
            .map(|(k, _)| k)
            .collect();
        if adaptive.is_empty() || !result.value.is_finite() {
            return;
        }
        for &k in &adaptive {
            result.x[k] = neighbor_count(result.x[k].min(1.0), n) as f64 / n as f64;
        }

        let mut improved = true;
        while improved {
            improved = false;
            for &k in &adaptive {
                let count = neighbor_count(result.x[k], n);
                for candidate in [count.saturating_sub(1), count + 1] {
                    if candidate == 0 || candidate == count || candidate > n {
                        continue;
                    }
                    if let Some(termination) = should_stop() {
                        result.termination = termination;
                        return;
                    }
                    if result.evaluations >= self.config.max_evaluations {
                        result.termination = Termination::IterationLimit;
                        return;
                    }
                    let mut trial = result.x.clone();
                    trial[k] = candidate as f64 / n as f64;
                    let value = self.evaluate(template, &trial);
                    result.evaluations += 1;
                    if value < result.value {
                        log::debug!(
                            "Neighbor refinement: dimension {k} {count} -> {candidate} neighbors, {} {:.6}",
                            self.objective.name(),
                            value
                        );
                        result.x = trial;
                        result.value = value;
                        improved = true;
                        break;
                    }
                }
            }
        }
    }

    pub fn optimize(&self, initial: &[KernelSpec]) -> Result<OptimizationOutcome, CalibrationError> {
        self.calibrator.resolve(initial)?;
        let x0: Array1<f64> = initial.iter().map(|spec| spec.bandwidth).collect();
        log::info!(
            "Optimizing {} bandwidths under {} starting from {:?}.",
            x0.len(),
            self.objective.name(),
            x0.to_vec()
        );

        let started = Instant::now();
        // A deadline too far out to represent is no deadline.
        let deadline = self
            .config
            .deadline_seconds
            .filter(|seconds| !seconds.is_nan())
            .and_then(|seconds| Duration::try_from_secs_f64(seconds.max(0.0)).ok())
            .and_then(|budget| started.checked_add(budget));
        let should_stop = || {
            if self.cancellation.is_cancelled() {
                Some(Termination::Cancelled)
            } else if deadline.is_some_and(|d| Instant::now() >= d) {
                Some(Termination::DeadlineReached)
            } else {
                None
            }
        };

        let mut result = internal::nelder_mead(
            |x| self.evaluate(initial, x),
            &x0,
            &self.simplex_scale(initial, &x0),
            &self.config,
            &should_stop,
        );
        if result.termination == Termination::Converged {
            self.refine_counts(initial, &mut result, &should_stop);
        }

        let outcome = OptimizationOutcome {
            kernel_specs: Self::specs_for(initial, &result.x),
            criterion_value: result.value,
            initial_value: result.initial_value,
            termination: result.termination,
            iterations: result.iterations,
            evaluations: result.evaluations,
        };
        match outcome.termination {
            Termination::Converged => log::info!(
                "Bandwidth search converged after {} iterations ({} calibrations): {} {:.6} -> {:.6}.",
                outcome.iterations,
                outcome.evaluations,
                self.objective.name(),
                outcome.initial_value,
                outcome.criterion_value
            ),
            Termination::NoFiniteStart => log::warn!(
                "No bandwidths around the start {:?} give a finite {}; every candidate is infeasible or has singular fits. Try a wider starting bandwidth.",
                x0.to_vec(),
                self.objective.name()
            ),
            other => log::warn!(
                "Bandwidth search stopped without converging ({}) after {} iterations; returning the best vector found, {} = {:.6}.",
                other,
                outcome.iterations,
                self.objective.name(),
                outcome.criterion_value
            ),
        }
        Ok(outcome)
    }
}

/// One-shot search with default calibration and optimizer settings.
pub fn optimize(
    dataset: &Dataset,
    initial: &[KernelSpec],
    criterion: Criterion,
    solver: Solver,
) -> Result<OptimizationOutcome, CalibrationError> {
    BandwidthOptimizer::new(
        dataset,
        solver,
        criterion,
        CalibrationConfig::default(),
        OptimizerConfig::default(),
    )?
    .optimize(initial)
}

/// Internal module for the simplex search itself.
mod internal {
    use super::*;

    const REFLECTION: f64 = 1.0;
    const EXPANSION: f64 = 2.0;
    const CONTRACTION: f64 = 0.5;
    const SHRINK: f64 = 0.5;

    pub(super) struct SimplexResult {
        pub x: Array1<f64>,
        pub value: f64,
        pub initial_value: f64,
        pub termination: Termination,
        pub iterations: usize,
        pub evaluations: usize,
    }

    /// Per-coordinate simplex geometry.
    pub(super) struct SimplexScale {
        /// Initial edge along each coordinate.
        pub steps: Array1<f64>,
        /// Largest distance from the best vertex, along each coordinate, at
        /// which the simplex counts as resolved.
        pub tolerances: Array1<f64>,
    }

    impl SimplexScale {
        /// Edges and tolerances proportional to the starting point.
        pub fn relative(x0: &Array1<f64>, config: &OptimizerConfig) -> Self {
            let steps = x0.mapv(|x| {
                if x == 0.0 {
                    ZERO_COORDINATE_STEP
                } else {
                    config.initial_step * x.abs()
                }
            });
            let tolerances = x0.mapv(|x| config.x_tolerance * (1.0 + x.abs()));
            Self { steps, tolerances }
        }
    }

    struct Counted<F> {
        f: F,
        evaluations: usize,
    }

    impl<F: FnMut(&Array1<f64>) -> f64> Counted<F> {
        fn call(&mut self, x: &Array1<f64>) -> f64 {
            self.evaluations += 1;
            let value = (self.f)(x);
            if value.is_nan() { f64::INFINITY } else { value }
        }
    }

    /// Minimizes `f` from `x0`. `should_stop` is polled once per iteration,
    /// after `x0` has been evaluated.
    pub(super) fn nelder_mead<F, S>(
        f: F,
        x0: &Array1<f64>,
        scale: &SimplexScale,
        config: &OptimizerConfig,
        should_stop: S,
    ) -> SimplexResult
    where
        F: FnMut(&Array1<f64>) -> f64,
        S: Fn() -> Option<Termination>,
    {
        let mut objective = Counted { f, evaluations: 0 };
        let dim = x0.len();
        let initial_value = objective.call(x0);

        if let Some(termination) = should_stop() {
            return SimplexResult {
                x: x0.clone(),
                value: initial_value,
                initial_value,
                termination,
                iterations: 0,
                evaluations: objective.evaluations,
            };
        }

        // Axis-aligned start; a step that leaves the feasible region is
        // mirrored to the other side of x0.
        let mut simplex: Vec<(Array1<f64>, f64)> = Vec::with_capacity(dim + 1);
        simplex.push((x0.clone(), initial_value));
        for k in 0..dim {
            let step = scale.steps[k];
            let mut forward = x0.clone();
            forward[k] += step;
            let forward_value = objective.call(&forward);
            if forward_value.is_finite() {
                simplex.push((forward, forward_value));
                continue;
            }
            let mut backward = x0.clone();
            backward[k] -= step;
            let backward_value = objective.call(&backward);
            if backward_value.is_finite() {
                simplex.push((backward, backward_value));
            } else {
                simplex.push((forward, forward_value));
            }
        }

        if simplex.iter().all(|(_, value)| !value.is_finite()) {
            return SimplexResult {
                x: x0.clone(),
                value: initial_value,
                initial_value,
                termination: Termination::NoFiniteStart,
                iterations: 0,
                evaluations: objective.evaluations,
            };
        }

        let f_scale = if initial_value.is_finite() {
            1.0 + initial_value.abs()
        } else {
            1.0
        };
        let mut iterations = 0;

        let termination = loop {
            simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
            let best = simplex[0].1;
            let worst = simplex[dim].1;

            let f_spread = worst - best;
            let resolved = (0..dim).all(|k| {
                simplex
                    .iter()
                    .skip(1)
                    .all(|(v, _)| (v[k] - simplex[0].0[k]).abs() <= scale.tolerances[k])
            });
            if f_spread.is_finite() && f_spread <= config.f_tolerance * f_scale && resolved {
                break Termination::Converged;
            }
            if iterations >= config.max_iterations || objective.evaluations >= config.max_evaluations
            {
                break Termination::IterationLimit;
            }
            if let Some(termination) = should_stop() {
                break termination;
            }
            iterations += 1;

            let mut centroid = Array1::<f64>::zeros(dim);
            for (vertex, _) in &simplex[..dim] {
                centroid += vertex;
            }
            centroid /= dim as f64;

            let worst_vertex = simplex[dim].0.clone();
            let second_worst = simplex[dim.saturating_sub(1)].1;

            let reflected = &centroid + &((&centroid - &worst_vertex) * REFLECTION);
            let reflected_value = objective.call(&reflected);

            if reflected_value < best {
                let expanded = &centroid + &((&reflected - &centroid) * EXPANSION);
                let expanded_value = objective.call(&expanded);
                simplex[dim] = if expanded_value < reflected_value {
                    (expanded, expanded_value)
                } else {
                    (reflected, reflected_value)
                };
                log::debug!("Simplex iteration {iterations}: expansion, best {best:.6}");
                continue;
            }
            if reflected_value < second_worst {
                simplex[dim] = (reflected, reflected_value);
                log::debug!("Simplex iteration {iterations}: reflection, best {best:.6}");
                continue;
            }

            let (contracted, contracted_value, accepted) = if reflected_value < worst {
                let point = &centroid + &((&reflected - &centroid) * CONTRACTION);
                let value = objective.call(&point);
                let accepted = value <= reflected_value;
                (point, value, accepted)
            } else {
                let point = &centroid + &((&worst_vertex - &centroid) * CONTRACTION);
                let value = objective.call(&point);
                let accepted = value < worst;
                (point, value, accepted)
            };
            if accepted {
                simplex[dim] = (contracted, contracted_value);
                log::debug!("Simplex iteration {iterations}: contraction, best {best:.6}");
                continue;
            }

            let anchor = simplex[0].0.clone();
            for (vertex, value) in simplex.iter_mut().skip(1) {
                let shrunk = &anchor + &((&*vertex - &anchor) * SHRINK);
                *value = objective.call(&shrunk);
                *vertex = shrunk;
            }
            log::debug!("Simplex iteration {iterations}: shrink, best {best:.6}");
        };

        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let (x, value) = simplex.swap_remove(0);
        SimplexResult {
            x,
            value,
            initial_value,
            termination,
            iterations,
            evaluations: objective.evaluations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::CoordinateGroup;
    use crate::kernel::KernelFunction;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::mpsc;
    use std::thread;

    fn dataset(n: usize) -> Dataset {
        let mut rng = StdRng::seed_from_u64(42);
        let coords = Array2::from_shape_fn((n, 1), |(i, _)| i as f64 / n as f64 * 10.0);
        let x = Array2::from_shape_fn((n, 1), |_| rng.gen_range(-1.0..1.0));
        let y = Array1::from_shape_fn(n, |i| {
            let u = coords[(i, 0)];
            (u / 3.0).sin() + (1.0 + 0.2 * u) * x[(i, 0)] + rng.gen_range(-0.1..0.1)
        });
        Dataset::new(y, x, vec![CoordinateGroup::euclidean(coords).unwrap()]).unwrap()
    }

    fn optimizer(data: &Dataset, criterion: Criterion, config: OptimizerConfig) -> BandwidthOptimizer<'_> {
        BandwidthOptimizer::new(
            data,
            Solver::kernel_smooth(),
            criterion,
            CalibrationConfig {
                parallel: false,
                ..CalibrationConfig::default()
            },
            config,
        )
        .unwrap()
    }

    #[test]
    fn simplex_finds_quadratic_minimum() {
        let config = OptimizerConfig {
            max_iterations: 1000,
            max_evaluations: 4000,
            x_tolerance: 1e-8,
            f_tolerance: 1e-12,
            ..OptimizerConfig::default()
        };
        let x0 = array![0.5, 0.5];
        let result = internal::nelder_mead(
            |x| (x[0] - 1.0).powi(2) + 10.0 * (x[1] + 2.0).powi(2),
            &x0,
            &internal::SimplexScale::relative(&x0, &config),
            &config,
            || None,
        );
        assert_eq!(result.termination, Termination::Converged);
        assert_abs_diff_eq!(result.x[0], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(result.x[1], -2.0, epsilon = 1e-3);
        assert!(result.value < result.initial_value);
    }

    #[test]
    fn simplex_steps_away_from_infeasible_side() {
        // Everything above 1 is infeasible; the start sits on the boundary.
        let x0 = array![1.0];
        let config = OptimizerConfig::default();
        let result = internal::nelder_mead(
            |x| {
                if x[0] > 1.0 {
                    f64::INFINITY
                } else {
                    (x[0] - 0.3).powi(2)
                }
            },
            &x0,
            &internal::SimplexScale::relative(&x0, &config),
            &config,
            || None,
        );
        assert_eq!(result.termination, Termination::Converged);
        assert_abs_diff_eq!(result.x[0], 0.3, epsilon = 1e-2);
    }

    #[test]
    fn infeasible_candidates_score_infinity() {
        let data = dataset(30);
        let opt = optimizer(&data, Criterion::Aicc, OptimizerConfig::default());
        let adaptive = [KernelSpec::adaptive(KernelFunction::Gaussian, 0.5)];
        assert!(opt.evaluate(&adaptive, &array![0.5]).is_finite());
        // 0.01 * 30 rounds to 0 neighbors.
        assert_eq!(opt.evaluate(&adaptive, &array![0.01]), f64::INFINITY);
        assert_eq!(opt.evaluate(&adaptive, &array![1.2]), f64::INFINITY);
        assert_eq!(opt.evaluate(&adaptive, &array![-0.5]), f64::INFINITY);

        let fixed = [KernelSpec::fixed(KernelFunction::Gaussian, 2.0)];
        let max = opt.calibrator().max_distances()[0];
        assert!(opt.evaluate(&fixed, &array![2.0]).is_finite());
        assert_eq!(opt.evaluate(&fixed, &array![max * 1.5]), f64::INFINITY);
        assert_eq!(opt.evaluate(&fixed, &array![0.0]), f64::INFINITY);
    }

    #[test]
    fn pre_cancelled_search_returns_the_start() {
        let data = dataset(25);
        let token = CancellationToken::new();
        token.cancel();
        let initial = [KernelSpec::golden(KernelFunction::Bisquare)];
        let outcome = optimizer(&data, Criterion::Cv, OptimizerConfig::default())
            .with_cancellation(token.clone())
            .optimize(&initial)
            .unwrap();
        assert_eq!(outcome.termination, Termination::Cancelled);
        assert!(!outcome.converged());
        assert_eq!(outcome.evaluations, 1);
        assert_eq!(outcome.kernel_specs, initial.to_vec());
        assert_eq!(outcome.criterion_value, outcome.initial_value);
    }

    #[test]
    fn expired_deadline_stops_the_search() {
        let data = dataset(25);
        let config = OptimizerConfig {
            deadline_seconds: Some(0.0),
            ..OptimizerConfig::default()
        };
        let outcome = optimizer(&data, Criterion::Aicc, config)
            .optimize(&[KernelSpec::golden(KernelFunction::Gaussian)])
            .unwrap();
        assert_eq!(outcome.termination, Termination::DeadlineReached);
    }

    #[test]
    fn exhausted_budget_is_reported_not_fatal() {
        let data = dataset(40);
        let config = OptimizerConfig {
            max_iterations: 2,
            x_tolerance: 1e-14,
            f_tolerance: 1e-14,
            ..OptimizerConfig::default()
        };
        let outcome = optimizer(&data, Criterion::Cv, config)
            .optimize(&[KernelSpec::fixed(KernelFunction::Gaussian, 3.0)])
            .unwrap();
        assert_eq!(outcome.termination, Termination::IterationLimit);
        assert_eq!(outcome.iterations, 2);
        assert!(outcome.criterion_value <= outcome.initial_value);
    }

    #[test]
    fn search_never_worsens_the_criterion() {
        let data = dataset(60);
        let initial = [KernelSpec::fixed(KernelFunction::Gaussian, 4.0)];
        let outcome = optimize(&data, &initial, Criterion::Aicc, Solver::kernel_smooth()).unwrap();
        assert!(outcome.criterion_value.is_finite());
        assert!(outcome.criterion_value <= outcome.initial_value);
        assert!(!outcome.kernel_specs[0].adaptive);
        assert!(outcome.kernel_specs[0].bandwidth > 0.0);
    }

    #[test]
    fn cancellation_from_another_thread_keeps_the_best_vertex() {
        let token = CancellationToken::new();
        let (request_tx, request_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            request_rx.recv().unwrap();
            remote.cancel();
            done_tx.send(()).unwrap();
        });

        let x0 = array![3.0, -1.0];
        let config = OptimizerConfig::default();
        let mut calls = 0;
        let mut best_seen = f64::INFINITY;
        let result = internal::nelder_mead(
            |x| {
                calls += 1;
                let value = (x[0] - 1.0).powi(2) + (x[1] - 2.0).powi(2);
                best_seen = best_seen.min(value);
                if calls == 12 {
                    request_tx.send(()).unwrap();
                    done_rx.recv().unwrap();
                }
                value
            },
            &x0,
            &internal::SimplexScale::relative(&x0, &config),
            &config,
            || token.is_cancelled().then_some(Termination::Cancelled),
        );
        canceller.join().unwrap();

        assert_eq!(result.termination, Termination::Cancelled);
        assert!(result.iterations > 0);
        assert_eq!(result.evaluations, calls);
        assert_eq!(result.value, best_seen);
        assert!(result.value < result.initial_value);
        assert_abs_diff_eq!(
            (result.x[0] - 1.0).powi(2) + (result.x[1] - 2.0).powi(2),
            result.value,
            epsilon = 1e-12
        );
    }

    #[test]
    fn all_infinite_start_stops_immediately() {
        let x0 = array![0.5, 0.5];
        let config = OptimizerConfig::default();
        let result = internal::nelder_mead(
            |_| f64::INFINITY,
            &x0,
            &internal::SimplexScale::relative(&x0, &config),
            &config,
            || None,
        );
        assert_eq!(result.termination, Termination::NoFiniteStart);
        assert_eq!(result.iterations, 0);
        // x0, then a forward and a backward step per coordinate.
        assert_eq!(result.evaluations, 5);
        assert_eq!(result.x, x0);
    }

    #[test]
    fn adaptive_steps_span_whole_neighbors() {
        let data = dataset(20);
        let opt = optimizer(&data, Criterion::Cv, OptimizerConfig::default());
        let template = [
            KernelSpec::golden(KernelFunction::Bisquare),
            KernelSpec::fixed(KernelFunction::Gaussian, 2.0),
        ];
        let scale = opt.simplex_scale(&template, &array![0.618, 2.0]);
        assert_abs_diff_eq!(scale.steps[0], 2.0 / 20.0, epsilon = 1e-15);
        assert_abs_diff_eq!(scale.tolerances[0], 0.25 / 20.0, epsilon = 1e-15);
        assert_abs_diff_eq!(scale.steps[1], 0.1, epsilon = 1e-15);
        assert_abs_diff_eq!(scale.tolerances[1], 3e-4, epsilon = 1e-15);
    }

    #[test]
    fn small_adaptive_search_ends_at_a_neighbor_count_minimum() {
        let n = 20;
        let data = dataset(n);
        let opt = optimizer(&data, Criterion::Cv, OptimizerConfig::default());
        let template = [KernelSpec::golden(KernelFunction::Bisquare)];
        let outcome = opt.optimize(&template).unwrap();
        assert!(outcome.converged());
        assert!(outcome.criterion_value.is_finite());

        let count = neighbor_count(outcome.kernel_specs[0].bandwidth, n);
        assert_abs_diff_eq!(
            outcome.kernel_specs[0].bandwidth,
            count as f64 / n as f64,
            epsilon = 1e-15
        );
        for neighbor in [count - 1, count + 1] {
            if neighbor == 0 || neighbor > n {
                continue;
            }
            let value = opt.evaluate(&template, &array![neighbor as f64 / n as f64]);
            assert!(value >= outcome.criterion_value, "{neighbor} neighbors: {value}");
        }
    }

    #[test]
    fn singular_seed_is_widened_into_a_finite_region() {
        // 0.03 of 40 samples is one neighbor: every leave-one-out fit is empty.
        let data = dataset(40);
        let opt = optimizer(&data, Criterion::Cv, OptimizerConfig::default());
        let template = [KernelSpec::adaptive(KernelFunction::Gaussian, 0.03)];
        let outcome = opt.optimize(&template).unwrap();
        assert_eq!(outcome.initial_value, f64::INFINITY);
        assert!(outcome.criterion_value.is_finite());
        assert!(outcome.kernel_specs[0].bandwidth > 0.03);
    }

    #[test]
    fn far_deadline_is_treated_as_none() {
        let data = dataset(25);
        let config = OptimizerConfig {
            max_iterations: 2,
            x_tolerance: 1e-14,
            f_tolerance: 1e-14,
            deadline_seconds: Some(1e20),
            ..OptimizerConfig::default()
        };
        let outcome = optimizer(&data, Criterion::Aicc, config)
            .optimize(&[KernelSpec::fixed(KernelFunction::Gaussian, 3.0)])
            .unwrap();
        assert_eq!(outcome.termination, Termination::IterationLimit);
    }

    #[test]
    fn invalid_initial_specs_fail_before_searching() {
        let data = dataset(20);
        let opt = optimizer(&data, Criterion::Cv, OptimizerConfig::default());
        assert!(matches!(
            opt.optimize(&[KernelSpec::adaptive(KernelFunction::Gaussian, 2.0)]),
            Err(CalibrationError::InvalidSpec(_))
        ));
    }
}
