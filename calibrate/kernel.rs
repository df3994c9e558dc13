// calibrate/kernel.rs

//! # Kernel Functions and Bandwidth Specifications
//!
//! Every coordinate dimension of a GWDR model carries its own kernel: a decay
//! function mapping a distance to a weight in `[0, 1]`, plus a bandwidth that is
//! either an absolute distance (fixed) or a fraction of the sample count
//! (adaptive). Adaptive bandwidths are resolved per target row to the distance
//! of its k-th nearest neighbor along that dimension, counting the target
//! itself as the first neighbor.
//!
//! Specifications arrive loosely from callers and config files; `resolve_specs`
//! validates them once against the dataset and produces `ResolvedKernel`s that
//! the rest of the engine can trust.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Conventional starting point for adaptive bandwidth searches.
pub const GOLDEN_FRACTION: f64 = 0.618;

/// Guards `fraction * n` against representation error just below a half.
const HALF_UP_EPSILON: f64 = 1e-9;

/// A specification-level failure. Always raised before any numerical work.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpecError {
    #[error("No kernel specifications were supplied; at least one coordinate dimension is required.")]
    Empty,

    #[error(
        "Received {specs} kernel specifications for {groups} coordinate groups. Exactly one specification per group is required."
    )]
    CountMismatch { specs: usize, groups: usize },

    #[error(
        "Kernel specification {index} has bandwidth {bandwidth}. Bandwidths must be positive and finite."
    )]
    NonPositiveBandwidth { index: usize, bandwidth: f64 },

    #[error(
        "Adaptive kernel specification {index} has neighbor fraction {fraction}. Adaptive bandwidths are fractions of the sample count in (0, 1]."
    )]
    AdaptiveFractionOutOfRange { index: usize, fraction: f64 },

    #[error(
        "Fixed kernel specification {index} has bandwidth {bandwidth}, which exceeds the dimension's maximum pairwise distance {max_distance}."
    )]
    FixedBandwidthTooLarge {
        index: usize,
        bandwidth: f64,
        max_distance: f64,
    },

    #[error("min_neighbors ({min_neighbors}) must lie in [1, {n}] for a dataset of {n} samples.")]
    InvalidMinNeighbors { min_neighbors: usize, n: usize },

    #[error(
        "Unknown kernel function '{0}'. Expected one of: gaussian, bisquare, boxcar, exponential, tricube."
    )]
    UnknownKernel(String),

    #[error("Unknown solver '{0}'. Expected 'kernel.smooth' or 'local.poly'.")]
    UnknownSolver(String),

    #[error("Unknown optimization criterion '{0}'. Expected 'CV' or 'AICc'.")]
    UnknownCriterion(String),

    #[error("Invalid solver option: {0}")]
    InvalidSolverOption(String),
}

/// Per-dimension decay function converting a distance into a weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelFunction {
    /// `exp(-0.5 (d/b)^2)`, unbounded support.
    Gaussian,
    /// `(1 - (d/b)^2)^2` for `d < b`, else 0.
    Bisquare,
    /// 1 for `d <= b`, else 0.
    Boxcar,
    /// `exp(-d/b)`, unbounded support.
    Exponential,
    /// `(1 - (d/b)^3)^3` for `d < b`, else 0.
    Tricube,
}

impl KernelFunction {
    pub const ALL: [KernelFunction; 5] = [
        KernelFunction::Gaussian,
        KernelFunction::Bisquare,
        KernelFunction::Boxcar,
        KernelFunction::Exponential,
        KernelFunction::Tricube,
    ];

    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            KernelFunction::Gaussian => "gaussian",
            KernelFunction::Bisquare => "bisquare",
            KernelFunction::Boxcar => "boxcar",
            KernelFunction::Exponential => "exponential",
            KernelFunction::Tricube => "tricube",
        }
    }

    /// True when the kernel returns exactly zero beyond its bandwidth.
    #[inline]
    pub const fn has_compact_support(&self) -> bool {
        matches!(
            self,
            KernelFunction::Bisquare | KernelFunction::Boxcar | KernelFunction::Tricube
        )
    }

    /// Evaluates the kernel. A zero bandwidth degenerates to the indicator of
    /// zero distance, the limit every kernel approaches as `b -> 0`.
    #[inline]
    pub fn weight(&self, distance: f64, bandwidth: f64) -> f64 {
        if bandwidth <= 0.0 || bandwidth.is_nan() {
            return if distance <= 0.0 { 1.0 } else { 0.0 };
        }
        let u = distance / bandwidth;
        match self {
            KernelFunction::Gaussian => (-0.5 * u * u).exp(),
            KernelFunction::Bisquare => {
                if distance < bandwidth {
                    let t = 1.0 - u * u;
                    t * t
                } else {
                    0.0
                }
            }
            KernelFunction::Boxcar => {
                if distance <= bandwidth {
                    1.0
                } else {
                    0.0
                }
            }
            KernelFunction::Exponential => (-u).exp(),
            KernelFunction::Tricube => {
                if distance < bandwidth {
                    let t = 1.0 - u * u * u;
                    t * t * t
                } else {
                    0.0
                }
            }
        }
    }
}

impl fmt::Display for KernelFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KernelFunction {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        KernelFunction::ALL
            .into_iter()
            .find(|kernel| kernel.name() == lowered)
            .ok_or_else(|| SpecError::UnknownKernel(s.to_string()))
    }
}

/// Caller-facing kernel specification for one coordinate dimension.
///
/// For adaptive kernels `bandwidth` is the neighbor fraction in `(0, 1]`;
/// for fixed kernels it is an absolute distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub bandwidth: f64,
    pub kernel: KernelFunction,
    #[serde(default)]
    pub adaptive: bool,
}

impl KernelSpec {
    pub fn fixed(kernel: KernelFunction, bandwidth: f64) -> Self {
        Self {
            bandwidth,
            kernel,
            adaptive: false,
        }
    }

    pub fn adaptive(kernel: KernelFunction, fraction: f64) -> Self {
        Self {
            bandwidth: fraction,
            kernel,
            adaptive: true,
        }
    }

    /// Adaptive kernel seeded at the golden-ratio neighbor fraction.
    pub fn golden(kernel: KernelFunction) -> Self {
        Self::adaptive(kernel, GOLDEN_FRACTION)
    }

    pub fn with_bandwidth(self, bandwidth: f64) -> Self {
        Self { bandwidth, ..self }
    }
}

/// Bandwidth after validation against a concrete dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bandwidth {
    Fixed(f64),
    Adaptive { neighbors: usize },
}

/// A validated kernel ready to produce weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedKernel {
    pub function: KernelFunction,
    pub bandwidth: Bandwidth,
}

impl ResolvedKernel {
    /// The bandwidth applied to one target row, given that row's distances
    /// to every sample along this dimension.
    pub fn row_bandwidth(&self, distances: ArrayView1<f64>) -> f64 {
        match self.bandwidth {
            Bandwidth::Fixed(b) => b,
            Bandwidth::Adaptive { neighbors } => kth_smallest(distances, neighbors),
        }
    }

    #[inline]
    pub fn weight(&self, distance: f64, row_bandwidth: f64) -> f64 {
        self.function.weight(distance, row_bandwidth)
    }
}

/// Converts a neighbor fraction into a count with round-half-up. The result
/// is not clamped; callers decide whether out-of-range counts are clamped or
/// rejected.
pub fn neighbor_count(fraction: f64, n: usize) -> usize {
    let raw = fraction * n as f64;
    if !raw.is_finite() || raw <= 0.0 {
        return 0;
    }
    (raw + 0.5 + HALF_UP_EPSILON).floor() as usize
}

/// Neighbor count clamped into `[min_neighbors, n]`.
pub fn resolve_neighbor_count(fraction: f64, n: usize, min_neighbors: usize) -> usize {
    let lower = min_neighbors.clamp(1, n.max(1));
    neighbor_count(fraction, n).clamp(lower, n.max(lower))
}

/// k-th smallest value (1-based). Returns the maximum when `k` exceeds the length.
pub fn kth_smallest(values: ArrayView1<f64>, k: usize) -> f64 {
    let mut buffer: Vec<f64> = values.iter().copied().collect();
    if buffer.is_empty() {
        return 0.0;
    }
    let index = k.clamp(1, buffer.len()) - 1;
    let (_, nth, _) = buffer.select_nth_unstable_by(index, |a, b| a.total_cmp(b));
    *nth
}

/// Validates a kernel specification list against the dataset and resolves
/// adaptive fractions into neighbor counts.
///
/// `max_distances[k]` is the largest pairwise distance of dimension `k`; it is
/// only consulted for fixed kernels.
pub fn resolve_specs(
    specs: &[KernelSpec],
    groups: usize,
    n: usize,
    max_distances: &[f64],
    min_neighbors: usize,
) -> Result<Vec<ResolvedKernel>, SpecError> {
    if specs.is_empty() {
        return Err(SpecError::Empty);
    }
    if specs.len() != groups {
        return Err(SpecError::CountMismatch {
            specs: specs.len(),
            groups,
        });
    }
    if min_neighbors == 0 || min_neighbors > n {
        return Err(SpecError::InvalidMinNeighbors { min_neighbors, n });
    }

    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            if !(spec.bandwidth.is_finite() && spec.bandwidth > 0.0) {
                return Err(SpecError::NonPositiveBandwidth {
                    index,
                    bandwidth: spec.bandwidth,
                });
            }
            let bandwidth = if spec.adaptive {
                if spec.bandwidth > 1.0 {
                    return Err(SpecError::AdaptiveFractionOutOfRange {
                        index,
                        fraction: spec.bandwidth,
                    });
                }
                Bandwidth::Adaptive {
                    neighbors: resolve_neighbor_count(spec.bandwidth, n, min_neighbors),
                }
            } else {
                let max_distance = max_distances.get(index).copied().unwrap_or(f64::INFINITY);
                if spec.bandwidth > max_distance * (1.0 + 1e-12) {
                    return Err(SpecError::FixedBandwidthTooLarge {
                        index,
                        bandwidth: spec.bandwidth,
                        max_distance,
                    });
                }
                Bandwidth::Fixed(spec.bandwidth)
            };
            Ok(ResolvedKernel {
                function: spec.kernel,
                bandwidth,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn kernel_values_match_closed_forms() {
        let d = 0.5;
        let b = 1.0;
        assert_abs_diff_eq!(
            KernelFunction::Gaussian.weight(d, b),
            (-0.125f64).exp(),
            epsilon = 1e-15
        );
        assert_abs_diff_eq!(KernelFunction::Bisquare.weight(d, b), 0.5625, epsilon = 1e-15);
        assert_abs_diff_eq!(KernelFunction::Boxcar.weight(d, b), 1.0);
        assert_abs_diff_eq!(
            KernelFunction::Exponential.weight(d, b),
            (-0.5f64).exp(),
            epsilon = 1e-15
        );
        assert_abs_diff_eq!(
            KernelFunction::Tricube.weight(d, b),
            0.875f64.powi(3),
            epsilon = 1e-15
        );
    }

    #[test]
    fn compact_kernels_vanish_at_and_beyond_bandwidth() {
        assert_eq!(KernelFunction::Bisquare.weight(1.0, 1.0), 0.0);
        assert_eq!(KernelFunction::Tricube.weight(1.0, 1.0), 0.0);
        // Boxcar includes its boundary.
        assert_eq!(KernelFunction::Boxcar.weight(1.0, 1.0), 1.0);
        assert_eq!(KernelFunction::Boxcar.weight(1.0 + 1e-12, 1.0), 0.0);
        assert!(KernelFunction::Gaussian.weight(50.0, 1.0) >= 0.0);

        for kernel in KernelFunction::ALL {
            let beyond = kernel.weight(1.5, 1.0);
            assert_eq!(kernel.has_compact_support(), beyond == 0.0, "{kernel}");
        }
    }

    #[test]
    fn zero_bandwidth_is_an_indicator() {
        for kernel in KernelFunction::ALL {
            assert_eq!(kernel.weight(0.0, 0.0), 1.0, "{kernel}");
            assert_eq!(kernel.weight(0.1, 0.0), 0.0, "{kernel}");
        }
    }

    #[test]
    fn kernel_names_parse_case_insensitively() {
        assert_eq!("Gaussian".parse::<KernelFunction>().unwrap(), KernelFunction::Gaussian);
        assert_eq!(" TRICUBE ".parse::<KernelFunction>().unwrap(), KernelFunction::Tricube);
        match "epanechnikov".parse::<KernelFunction>() {
            Err(SpecError::UnknownKernel(name)) => assert_eq!(name, "epanechnikov"),
            other => panic!("Expected UnknownKernel, got {:?}", other),
        }
    }

    #[test]
    fn neighbor_count_rounds_half_up() {
        assert_eq!(neighbor_count(0.025, 20), 1); // 0.5 -> 1
        assert_eq!(neighbor_count(0.35, 10), 4); // 3.5 -> 4
        assert_eq!(neighbor_count(0.618, 200), 124);
        assert_eq!(neighbor_count(0.0, 10), 0);
        assert_eq!(resolve_neighbor_count(0.01, 10, 3), 3);
        assert_eq!(resolve_neighbor_count(1.0, 10, 3), 10);
    }

    #[test]
    fn kth_smallest_counts_the_target_itself() {
        let distances = array![0.0, 3.0, 1.0, 2.0];
        assert_eq!(kth_smallest(distances.view(), 1), 0.0);
        assert_eq!(kth_smallest(distances.view(), 2), 1.0);
        assert_eq!(kth_smallest(distances.view(), 4), 3.0);
        assert_eq!(kth_smallest(distances.view(), 10), 3.0);
    }

    #[test]
    fn resolve_specs_rejects_malformed_lists() {
        let spec = KernelSpec::fixed(KernelFunction::Gaussian, 1.0);
        assert_eq!(
            resolve_specs(&[], 1, 10, &[5.0], 1).unwrap_err(),
            SpecError::Empty
        );
        assert_eq!(
            resolve_specs(&[spec], 2, 10, &[5.0, 5.0], 1).unwrap_err(),
            SpecError::CountMismatch { specs: 1, groups: 2 }
        );
        assert!(matches!(
            resolve_specs(&[spec.with_bandwidth(-1.0)], 1, 10, &[5.0], 1),
            Err(SpecError::NonPositiveBandwidth { index: 0, .. })
        ));
        assert!(matches!(
            resolve_specs(&[spec.with_bandwidth(6.0)], 1, 10, &[5.0], 1),
            Err(SpecError::FixedBandwidthTooLarge { index: 0, .. })
        ));
        assert!(matches!(
            resolve_specs(
                &[KernelSpec::adaptive(KernelFunction::Bisquare, 1.5)],
                1,
                10,
                &[5.0],
                1
            ),
            Err(SpecError::AdaptiveFractionOutOfRange { index: 0, .. })
        ));
    }

    #[test]
    fn resolve_specs_turns_fractions_into_counts() {
        let resolved = resolve_specs(
            &[
                KernelSpec::golden(KernelFunction::Gaussian),
                KernelSpec::fixed(KernelFunction::Boxcar, 2.0),
            ],
            2,
            50,
            &[10.0, 10.0],
            1,
        )
        .unwrap();
        assert_eq!(resolved[0].bandwidth, Bandwidth::Adaptive { neighbors: 31 });
        assert_eq!(resolved[1].bandwidth, Bandwidth::Fixed(2.0));
    }
}
