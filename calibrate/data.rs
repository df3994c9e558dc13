//! # Dataset Container and Validation
//!
//! The dataset is the only caller-owned input of the engine and stays
//! immutable for its whole lifetime. It holds:
//!
//! - the response vector `y` (length `n`),
//! - the predictor matrix `X` (`n x p`, without the intercept; the constant
//!   column is prepended by `design_matrix`),
//! - `d >= 1` coordinate groups, one per kernel specification.
//!
//! Validation happens once, here, so the numerical core can assume that every
//! array is finite and that `n` agrees across all of them.

use crate::distance::{CoordinateGroup, DistanceError, DistanceProvider};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use thiserror::Error;

pub const INTERCEPT_NAME: &str = "Intercept";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("The dataset contains no samples.")]
    Empty,

    #[error("{what} has {found} rows, but the response has {expected}. All inputs must describe the same samples.")]
    LengthMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    #[error("Non-finite values (NaN or Infinity) were found in {0}. The engine requires finite data.")]
    NonFiniteValues(String),

    #[error("At least one coordinate group is required.")]
    NoCoordinateGroups,

    #[error("Received {found} predictor names for {expected} predictor columns.")]
    PredictorNameCount { expected: usize, found: usize },

    #[error("Invalid coordinate group: {0}")]
    Distance(#[from] DistanceError),
}

/// Validated samples located in a multidimensional coordinate space.
#[derive(Debug, Clone)]
pub struct Dataset {
    y: Array1<f64>,
    x: Array2<f64>,
    groups: Vec<CoordinateGroup>,
    predictor_names: Vec<String>,
}

impl Dataset {
    pub fn new(
        y: Array1<f64>,
        x: Array2<f64>,
        groups: Vec<CoordinateGroup>,
    ) -> Result<Self, DataError> {
        let n = y.len();
        if n == 0 {
            return Err(DataError::Empty);
        }
        if x.nrows() != n {
            return Err(DataError::LengthMismatch {
                what: "The predictor matrix".to_string(),
                expected: n,
                found: x.nrows(),
            });
        }
        if groups.is_empty() {
            return Err(DataError::NoCoordinateGroups);
        }
        for (index, group) in groups.iter().enumerate() {
            if group.len() != n {
                return Err(DataError::LengthMismatch {
                    what: format!("Coordinate group {index}"),
                    expected: n,
                    found: group.len(),
                });
            }
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValues("the response".to_string()));
        }
        if let Some(column) = x
            .axis_iter(Axis(1))
            .position(|col| col.iter().any(|v| !v.is_finite()))
        {
            return Err(DataError::NonFiniteValues(format!(
                "predictor column {}",
                column + 1
            )));
        }

        let predictor_names = (1..=x.ncols()).map(|i| format!("x{i}")).collect();
        Ok(Self {
            y,
            x,
            groups,
            predictor_names,
        })
    }

    /// Overrides the default `x1..xp` predictor names used in output tables.
    pub fn with_predictor_names(mut self, names: Vec<String>) -> Result<Self, DataError> {
        if names.len() != self.x.ncols() {
            return Err(DataError::PredictorNameCount {
                expected: self.x.ncols(),
                found: names.len(),
            });
        }
        self.predictor_names = names;
        Ok(self)
    }

    pub fn n_samples(&self) -> usize {
        self.y.len()
    }

    pub fn n_predictors(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_dimensions(&self) -> usize {
        self.groups.len()
    }

    pub fn response(&self) -> ArrayView1<'_, f64> {
        self.y.view()
    }

    pub fn predictors(&self) -> ArrayView2<'_, f64> {
        self.x.view()
    }

    pub fn groups(&self) -> &[CoordinateGroup] {
        &self.groups
    }

    pub fn predictor_names(&self) -> &[String] {
        &self.predictor_names
    }

    /// `Intercept` followed by the predictor names.
    pub fn coefficient_names(&self) -> Vec<String> {
        std::iter::once(INTERCEPT_NAME.to_string())
            .chain(self.predictor_names.iter().cloned())
            .collect()
    }

    /// `[1 | X]`, shape `n x (p + 1)`.
    pub fn design_matrix(&self) -> Array2<f64> {
        let (n, p) = self.x.dim();
        let mut design = Array2::ones((n, p + 1));
        design.slice_mut(s![.., 1..]).assign(&self.x);
        design
    }

    pub fn max_distances(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.max_distance()).collect()
    }
}
