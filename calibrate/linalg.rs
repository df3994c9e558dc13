//! Thin bridge between `ndarray` and `faer` for the dense solves the local
//! estimators need, plus the equilibrated Cholesky used on weighted normal
//! equations.

use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("Matrix has a non-positive or non-finite diagonal entry at index {index}.")]
    DegenerateDiagonal { index: usize },
    #[error("Smallest equilibrated pivot {pivot:.3e} at index {index} is below the singularity tolerance.")]
    NearSingular { index: usize, pivot: f64 },
}

/// An ndarray operand seen by faer: borrowed when the memory layout allows
/// it, copied otherwise. Vectors become single-column matrices.
enum FaerOperand<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerOperand<'a> {
    fn matrix<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => {
                FaerOperand::Borrowed(MatRef::from_row_major_slice(slice, rows, cols))
            }
            Some(slice) if array.t().is_standard_layout() => {
                FaerOperand::Borrowed(MatRef::from_column_major_slice(slice, rows, cols))
            }
            _ => FaerOperand::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)])),
        }
    }

    fn column<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        match array.as_slice() {
            Some(slice) => FaerOperand::Borrowed(MatRef::from_row_major_slice(slice, len, 1)),
            None => FaerOperand::Owned(Mat::from_fn(len, 1, |i, _| array[i])),
        }
    }

    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerOperand::Borrowed(view) => *view,
            FaerOperand::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Lower Cholesky factor of a symmetric positive definite matrix.
pub(crate) struct CholeskyFactor {
    llt: solvers::Llt<f64>,
}

impl CholeskyFactor {
    pub(crate) fn new<S: Data<Elem = f64>>(matrix: &ArrayBase<S, Ix2>) -> Result<Self, LinalgError> {
        let llt = FaerOperand::matrix(matrix)
            .as_ref()
            .llt(Side::Lower)
            .map_err(LinalgError::Cholesky)?;
        Ok(Self { llt })
    }

    pub(crate) fn solve(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let sol = self.llt.solve(FaerOperand::column(rhs).as_ref());
        Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)])
    }

    /// Diagonal of `L`.
    pub(crate) fn pivots(&self) -> Array1<f64> {
        let diagonal = self.llt.L().diagonal().column_vector().as_mat();
        Array1::from_shape_fn(diagonal.nrows(), |i| diagonal[(i, 0)])
    }
}

/// Cholesky factor of `D A D`, where `D = diag(A)^{-1/2}`.
///
/// Equilibration gives the scaled matrix a unit diagonal, so the squared
/// pivots of its factor lie in `(0, 1]` regardless of predictor units and a
/// single tolerance detects rank deficiency.
pub struct EquilibratedCholesky {
    factor: CholeskyFactor,
    scale: Array1<f64>,
}

impl EquilibratedCholesky {
    pub fn factor(matrix: &Array2<f64>, tolerance: f64) -> Result<Self, LinalgError> {
        let q = matrix.nrows();
        let mut scale = Array1::zeros(q);
        for index in 0..q {
            let d = matrix[(index, index)];
            if !(d.is_finite() && d > 0.0) {
                return Err(LinalgError::DegenerateDiagonal { index });
            }
            scale[index] = d.sqrt().recip();
        }
        let scaled = Array2::from_shape_fn((q, q), |(i, j)| matrix[(i, j)] * scale[i] * scale[j]);
        let factor = CholeskyFactor::new(&scaled)?;

        if let Some((index, &pivot)) = factor
            .pivots()
            .iter()
            .enumerate()
            .find(|(_, p)| !(p.is_finite() && **p * **p >= tolerance))
        {
            return Err(LinalgError::NearSingular {
                index,
                pivot: pivot * pivot,
            });
        }
        Ok(Self { factor, scale })
    }

    /// `A^{-1} rhs`.
    pub fn solve(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let scaled_rhs = rhs * &self.scale;
        let sol = self.factor.solve(&scaled_rhs);
        sol * &self.scale
    }

    /// `v' A^{-1} v`.
    pub fn inverse_quadratic_form(&self, v: &Array1<f64>) -> f64 {
        v.dot(&self.solve(v))
    }
}
