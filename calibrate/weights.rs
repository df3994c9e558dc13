//! # Product-Kernel Weight Composition
//!
//! The composite weight between target `i` and sample `j` is the product of
//! the per-dimension kernel weights:
//!
//! `w(i, j) = prod_k K_k(d_k(i, j), b_k(i))`
//!
//! Each axis attenuates influence independently, which is how the engine gets
//! an effective multidimensional bandwidth. A compact-support kernel that
//! returns zero on any axis zeroes the composite regardless of the others.
//! Adaptive bandwidths `b_k(i)` depend on the target row, so they are resolved
//! while building that row.

use crate::distance::DistanceProvider;
use crate::kernel::ResolvedKernel;
use ndarray::{Array1, Array2};

/// Whether the target's own observation contributes to its fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfWeight {
    /// `w(i, i)` is the kernel evaluated at distance zero.
    Include,
    /// `w(i, i) = 0`, for cross-validation.
    LeaveOneOut,
}

/// Composite weights for one target, plus the bandwidth each dimension used.
#[derive(Debug, Clone)]
pub struct WeightRow {
    pub target: usize,
    pub weights: Array1<f64>,
    pub bandwidths: Vec<f64>,
}

impl WeightRow {
    /// Number of samples with strictly positive weight.
    pub fn support(&self) -> usize {
        self.weights.iter().filter(|&&w| w > 0.0).count()
    }

    /// Same row with the target's own weight forced to zero.
    pub fn leave_one_out(&self) -> WeightRow {
        let mut weights = self.weights.clone();
        weights[self.target] = 0.0;
        WeightRow {
            target: self.target,
            weights,
            bandwidths: self.bandwidths.clone(),
        }
    }
}

pub struct WeightComposer<'a> {
    providers: Vec<&'a dyn DistanceProvider>,
    kernels: &'a [ResolvedKernel],
}

impl<'a> WeightComposer<'a> {
    /// `providers[k]` measures distances for `kernels[k]`. Both lists come
    /// from validated inputs, so their lengths agree.
    pub fn new(providers: Vec<&'a dyn DistanceProvider>, kernels: &'a [ResolvedKernel]) -> Self {
        debug_assert_eq!(providers.len(), kernels.len());
        Self { providers, kernels }
    }

    pub fn n_samples(&self) -> usize {
        self.providers.first().map_or(0, |p| p.len())
    }

    pub fn row(&self, target: usize, mode: SelfWeight) -> WeightRow {
        let n = self.n_samples();
        let mut weights = Array1::<f64>::ones(n);
        let mut bandwidths = Vec::with_capacity(self.kernels.len());

        for (provider, kernel) in self.providers.iter().zip(self.kernels) {
            let distances = provider.distances_from(target);
            let bandwidth = kernel.row_bandwidth(distances.view());
            bandwidths.push(bandwidth);
            weights
                .iter_mut()
                .zip(distances.iter())
                .for_each(|(w, &d)| {
                    if *w > 0.0 {
                        *w *= kernel.weight(d, bandwidth);
                    }
                });
        }

        if mode == SelfWeight::LeaveOneOut {
            weights[target] = 0.0;
        }
        WeightRow {
            target,
            weights,
            bandwidths,
        }
    }

    /// Single composite weight `w(i, j)`, using target `i`'s bandwidths.
    pub fn weight(&self, i: usize, j: usize, mode: SelfWeight) -> f64 {
        if i == j && mode == SelfWeight::LeaveOneOut {
            return 0.0;
        }
        self.providers
            .iter()
            .zip(self.kernels)
            .map(|(provider, kernel)| {
                let bandwidth = kernel.row_bandwidth(provider.distances_from(i).view());
                kernel.weight(provider.distance(i, j), bandwidth)
            })
            .product()
    }

    /// Dense `n x n` weight matrix, row `i` being target `i`.
    pub fn matrix(&self, mode: SelfWeight) -> Array2<f64> {
        let n = self.n_samples();
        let mut out = Array2::zeros((n, n));
        for i in 0..n {
            out.row_mut(i).assign(&self.row(i, mode).weights);
        }
        out
    }
}
