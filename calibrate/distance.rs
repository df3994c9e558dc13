// calibrate/distance.rs

//! # Per-Dimension Distance Sources
//!
//! Each coordinate dimension of a GWDR model measures closeness on its own.
//! Most dimensions are plain coordinates (a 1-D time axis, a 2-D position) and
//! use the Euclidean norm over the group's columns. Spaces without a natural
//! coordinate difference, such as origin-destination flows, are supplied as a
//! precomputed symmetric distance matrix that already encodes the
//! domain-specific formula.
//!
//! Distances never depend on the bandwidth, so `DistanceCache` can materialize
//! every dimension once and serve the bandwidth optimizer for its whole run.

use rayon::prelude::*;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use thiserror::Error;

/// Absolute tolerance (scaled by the matrix magnitude) for symmetry and
/// zero-diagonal checks on precomputed matrices.
const PRECOMPUTED_TOLERANCE: f64 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistanceError {
    #[error("A coordinate group must have at least one column.")]
    NoColumns,

    #[error("Coordinate group contains a non-finite value at row {row}, column {column}.")]
    NonFiniteCoordinate { row: usize, column: usize },

    #[error("Precomputed distance matrix must be square, but has shape {rows}x{cols}.")]
    NotSquare { rows: usize, cols: usize },

    #[error("Precomputed distance matrix is not symmetric: d[{i},{j}] = {forward} but d[{j},{i}] = {backward}.")]
    Asymmetric {
        i: usize,
        j: usize,
        forward: f64,
        backward: f64,
    },

    #[error("Precomputed distance matrix has nonzero diagonal entry {value} at index {index}.")]
    NonZeroDiagonal { index: usize, value: f64 },

    #[error("Precomputed distance matrix has an invalid entry {value} at ({i}, {j}); distances must be finite and nonnegative.")]
    InvalidEntry { i: usize, j: usize, value: f64 },

    #[error("Coordinates attached to a precomputed group have {found} rows, but the distance matrix has {expected}.")]
    CoordinateRowMismatch { expected: usize, found: usize },

    #[error("Euclidean coordinate groups already carry their coordinates.")]
    CoordinatesAlreadyPresent,
}

/// A source of pairwise distances between the `n` samples along one dimension.
pub trait DistanceProvider: Send + Sync {
    /// Number of samples the provider covers.
    fn len(&self) -> usize;

    fn distance(&self, i: usize, j: usize) -> f64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distances from sample `i` to every sample, including itself.
    fn distances_from(&self, i: usize) -> Array1<f64> {
        Array1::from_shape_fn(self.len(), |j| self.distance(i, j))
    }

    /// Largest pairwise distance; the upper bound for fixed bandwidths.
    fn max_distance(&self) -> f64 {
        let n = self.len();
        (0..n)
            .into_par_iter()
            .map(|i| {
                ((i + 1)..n)
                    .map(|j| self.distance(i, j))
                    .fold(0.0_f64, f64::max)
            })
            .reduce(|| 0.0_f64, f64::max)
    }
}

/// Euclidean norm restricted to one group of coordinate columns.
#[derive(Debug, Clone, PartialEq)]
pub struct EuclideanDistance {
    coordinates: Array2<f64>,
}

impl EuclideanDistance {
    pub fn new(coordinates: Array2<f64>) -> Result<Self, DistanceError> {
        if coordinates.ncols() == 0 {
            return Err(DistanceError::NoColumns);
        }
        if let Some(((row, column), _)) = coordinates.indexed_iter().find(|(_, v)| !v.is_finite())
        {
            return Err(DistanceError::NonFiniteCoordinate { row, column });
        }
        Ok(Self { coordinates })
    }

    pub fn coordinates(&self) -> ArrayView2<'_, f64> {
        self.coordinates.view()
    }
}

impl DistanceProvider for EuclideanDistance {
    fn len(&self) -> usize {
        self.coordinates.nrows()
    }

    #[inline]
    fn distance(&self, i: usize, j: usize) -> f64 {
        let a = self.coordinates.row(i);
        let b = self.coordinates.row(j);
        a.iter()
            .zip(b.iter())
            .map(|(&ai, &bi)| {
                let diff = ai - bi;
                diff * diff
            })
            .sum::<f64>()
            .sqrt()
    }
}

/// A caller-supplied, validated `n x n` distance matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecomputedDistance {
    matrix: Array2<f64>,
}

impl PrecomputedDistance {
    /// Validates shape, symmetry, diagonal and sign before accepting the matrix.
    pub fn new(matrix: Array2<f64>) -> Result<Self, DistanceError> {
        let (rows, cols) = matrix.dim();
        if rows != cols {
            return Err(DistanceError::NotSquare { rows, cols });
        }
        if let Some(((i, j), &value)) = matrix
            .indexed_iter()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(DistanceError::InvalidEntry { i, j, value });
        }

        let scale = matrix.iter().fold(1.0_f64, |acc, &v| acc.max(v));
        let tolerance = PRECOMPUTED_TOLERANCE * scale;
        for index in 0..rows {
            let value = matrix[(index, index)];
            if value.abs() > tolerance {
                return Err(DistanceError::NonZeroDiagonal { index, value });
            }
        }
        for i in 0..rows {
            for j in (i + 1)..rows {
                let forward = matrix[(i, j)];
                let backward = matrix[(j, i)];
                if (forward - backward).abs() > tolerance {
                    return Err(DistanceError::Asymmetric {
                        i,
                        j,
                        forward,
                        backward,
                    });
                }
            }
        }
        Ok(Self { matrix })
    }

    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }
}

impl DistanceProvider for PrecomputedDistance {
    fn len(&self) -> usize {
        self.matrix.nrows()
    }

    #[inline]
    fn distance(&self, i: usize, j: usize) -> f64 {
        self.matrix[(i, j)]
    }

    fn distances_from(&self, i: usize) -> Array1<f64> {
        self.matrix.row(i).to_owned()
    }
}

/// One coordinate dimension of the dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinateGroup {
    Euclidean(EuclideanDistance),
    /// Precomputed distances, optionally with coordinates so the local
    /// polynomial estimator can still form offsets in this dimension.
    Precomputed {
        distances: PrecomputedDistance,
        coordinates: Option<Array2<f64>>,
    },
}

impl CoordinateGroup {
    pub fn euclidean(columns: Array2<f64>) -> Result<Self, DistanceError> {
        Ok(CoordinateGroup::Euclidean(EuclideanDistance::new(columns)?))
    }

    pub fn precomputed(matrix: Array2<f64>) -> Result<Self, DistanceError> {
        Ok(CoordinateGroup::Precomputed {
            distances: PrecomputedDistance::new(matrix)?,
            coordinates: None,
        })
    }

    /// Attaches coordinates to a precomputed group.
    pub fn with_coordinates(self, columns: Array2<f64>) -> Result<Self, DistanceError> {
        match self {
            CoordinateGroup::Euclidean(_) => Err(DistanceError::CoordinatesAlreadyPresent),
            CoordinateGroup::Precomputed { distances, .. } => {
                if columns.nrows() != distances.len() {
                    return Err(DistanceError::CoordinateRowMismatch {
                        expected: distances.len(),
                        found: columns.nrows(),
                    });
                }
                let checked = EuclideanDistance::new(columns)?;
                Ok(CoordinateGroup::Precomputed {
                    distances,
                    coordinates: Some(checked.coordinates),
                })
            }
        }
    }

    /// Coordinates usable for local polynomial offsets, if the group has any.
    pub fn coordinates(&self) -> Option<ArrayView2<'_, f64>> {
        match self {
            CoordinateGroup::Euclidean(euclidean) => Some(euclidean.coordinates()),
            CoordinateGroup::Precomputed { coordinates, .. } => {
                coordinates.as_ref().map(|c| c.view())
            }
        }
    }

    fn provider(&self) -> &dyn DistanceProvider {
        match self {
            CoordinateGroup::Euclidean(euclidean) => euclidean,
            CoordinateGroup::Precomputed { distances, .. } => distances,
        }
    }
}

impl DistanceProvider for CoordinateGroup {
    fn len(&self) -> usize {
        self.provider().len()
    }

    #[inline]
    fn distance(&self, i: usize, j: usize) -> f64 {
        self.provider().distance(i, j)
    }

    fn distances_from(&self, i: usize) -> Array1<f64> {
        self.provider().distances_from(i)
    }

    fn max_distance(&self) -> f64 {
        self.provider().max_distance()
    }
}

/// Materialized distance matrices for every dimension of a dataset.
#[derive(Debug, Clone)]
pub struct DistanceCache {
    matrices: Vec<PrecomputedDistance>,
    max_distances: Vec<f64>,
}

impl DistanceCache {
    pub fn build(groups: &[CoordinateGroup]) -> Self {
        let matrices: Vec<PrecomputedDistance> = groups
            .iter()
            .map(|group| match group {
                CoordinateGroup::Precomputed { distances, .. } => distances.clone(),
                CoordinateGroup::Euclidean(euclidean) => {
                    let n = euclidean.len();
                    let mut matrix = Array2::<f64>::zeros((n, n));
                    matrix
                        .axis_iter_mut(Axis(0))
                        .into_par_iter()
                        .enumerate()
                        .for_each(|(i, mut row)| {
                            for j in 0..n {
                                row[j] = euclidean.distance(i, j);
                            }
                        });
                    PrecomputedDistance { matrix }
                }
            })
            .collect();
        let max_distances = matrices
            .iter()
            .map(|m| m.matrix.iter().fold(0.0_f64, |acc, &v| acc.max(v)))
            .collect();
        log::debug!(
            "Cached {} distance matrices for {} samples.",
            matrices.len(),
            groups.first().map_or(0, |g| g.len())
        );
        Self {
            matrices,
            max_distances,
        }
    }

    pub fn providers(&self) -> Vec<&dyn DistanceProvider> {
        self.matrices
            .iter()
            .map(|m| m as &dyn DistanceProvider)
            .collect()
    }

    pub fn max_distances(&self) -> &[f64] {
        &self.max_distances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn euclidean_uses_every_column_of_the_group() {
        let group = CoordinateGroup::euclidean(array![[0.0, 0.0], [3.0, 4.0], [6.0, 8.0]]).unwrap();
        assert_abs_diff_eq!(group.distance(0, 1), 5.0);
        assert_abs_diff_eq!(group.distance(0, 2), 10.0);
        assert_abs_diff_eq!(group.max_distance(), 10.0);
        assert_eq!(group.distances_from(1), array![5.0, 0.0, 5.0]);
    }

    #[test]
    fn euclidean_rejects_non_finite_coordinates() {
        let err = EuclideanDistance::new(array![[0.0], [f64::NAN]]).unwrap_err();
        assert_eq!(err, DistanceError::NonFiniteCoordinate { row: 1, column: 0 });
        assert_eq!(
            EuclideanDistance::new(Array2::zeros((3, 0))).unwrap_err(),
            DistanceError::NoColumns
        );
    }

    #[test]
    fn precomputed_matrix_is_validated() {
        assert!(matches!(
            PrecomputedDistance::new(Array2::zeros((2, 3))),
            Err(DistanceError::NotSquare { rows: 2, cols: 3 })
        ));
        assert!(matches!(
            PrecomputedDistance::new(array![[0.0, 1.0], [2.0, 0.0]]),
            Err(DistanceError::Asymmetric { i: 0, j: 1, .. })
        ));
        assert!(matches!(
            PrecomputedDistance::new(array![[0.5, 1.0], [1.0, 0.0]]),
            Err(DistanceError::NonZeroDiagonal { index: 0, .. })
        ));
        assert!(matches!(
            PrecomputedDistance::new(array![[0.0, -1.0], [-1.0, 0.0]]),
            Err(DistanceError::InvalidEntry { i: 0, j: 1, .. })
        ));
        let ok = PrecomputedDistance::new(array![[0.0, 2.0], [2.0, 0.0]]).unwrap();
        assert_eq!(ok.max_distance(), 2.0);
    }

    #[test]
    fn coordinates_attach_only_to_precomputed_groups() {
        let matrix = array![[0.0, 1.0], [1.0, 0.0]];
        let group = CoordinateGroup::precomputed(matrix)
            .unwrap()
            .with_coordinates(array![[0.0, 0.0, 1.0, 1.0], [1.0, 0.0, 2.0, 1.0]])
            .unwrap();
        assert_eq!(group.coordinates().unwrap().ncols(), 4);

        let wrong_rows = CoordinateGroup::precomputed(array![[0.0, 1.0], [1.0, 0.0]])
            .unwrap()
            .with_coordinates(array![[0.0]]);
        assert!(matches!(
            wrong_rows,
            Err(DistanceError::CoordinateRowMismatch { expected: 2, found: 1 })
        ));

        let euclidean = CoordinateGroup::euclidean(array![[0.0], [1.0]]).unwrap();
        assert_eq!(
            euclidean.with_coordinates(array![[0.0], [1.0]]).unwrap_err(),
            DistanceError::CoordinatesAlreadyPresent
        );
    }

    #[test]
    fn cache_matches_direct_distances() {
        let groups = vec![
            CoordinateGroup::euclidean(array![[0.0], [1.0], [4.0]]).unwrap(),
            CoordinateGroup::precomputed(array![[0.0, 2.0, 3.0], [2.0, 0.0, 1.0], [3.0, 1.0, 0.0]])
                .unwrap(),
        ];
        let cache = DistanceCache::build(&groups);
        let providers = cache.providers();
        for (k, group) in groups.iter().enumerate() {
            for i in 0..3 {
                assert_eq!(providers[k].distances_from(i), group.distances_from(i));
            }
        }
        assert_eq!(cache.max_distances(), &[4.0, 3.0]);
    }
}
