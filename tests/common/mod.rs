//! Synthetic datasets shared by the integration tests.

#![allow(dead_code)]

use gwdr::{CoordinateGroup, Dataset};
use ndarray::{Array1, Array2, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Samples on a 2-D unit square with three predictors and smoothly varying
/// coefficients. Returns the dataset and the true `n x 4` coefficient matrix.
pub fn surface_dataset(n: usize, noise_sd: f64, seed: u64) -> (Dataset, Array2<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let noise = Normal::new(0.0, noise_sd.max(1e-300)).unwrap();

    let coords = Array2::from_shape_fn((n, 2), |_| rng.gen_range(0.0..1.0));
    let x = Array2::from_shape_fn((n, 3), |_| normal.sample(&mut rng));
    let truth = Array2::from_shape_fn((n, 4), |(i, a)| {
        let (u, v) = (coords[(i, 0)], coords[(i, 1)]);
        match a {
            0 => 1.0 + 0.5 * (u + v),
            1 => 2.0 - 0.5 * u,
            2 => 0.5 + 0.5 * v,
            _ => -1.0 + 0.25 * (u + v),
        }
    });
    let y = Array1::from_shape_fn(n, |i| {
        let signal = truth[(i, 0)]
            + (0..3).map(|a| truth[(i, a + 1)] * x[(i, a)]).sum::<f64>();
        if noise_sd > 0.0 {
            signal + noise.sample(&mut rng)
        } else {
            signal
        }
    });
    let group = CoordinateGroup::euclidean(coords).unwrap();
    (Dataset::new(y, x, vec![group]).unwrap(), truth)
}

/// One predictor over a single coordinate axis at the given positions, with
/// coefficients linear in the position: `b0 = 1 + u`, `b1 = 2 - 1.5u`.
pub fn line_dataset(positions: &[f64], noise_sd: f64, seed: u64) -> (Dataset, Array2<f64>) {
    let n = positions.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let x = Array2::from_shape_fn((n, 1), |_| rng.gen_range(-2.0..2.0));
    let truth = Array2::from_shape_fn((n, 2), |(i, a)| {
        let u = positions[i];
        if a == 0 { 1.0 + u } else { 2.0 - 1.5 * u }
    });
    let y = Array1::from_shape_fn(n, |i| {
        let noise = if noise_sd > 0.0 {
            rng.gen_range(-noise_sd..noise_sd)
        } else {
            0.0
        };
        truth[(i, 0)] + truth[(i, 1)] * x[(i, 0)] + noise
    });
    let coords = Array2::from_shape_fn((n, 1), |(i, _)| positions[i]);
    let group = CoordinateGroup::euclidean(coords).unwrap();
    (Dataset::new(y, x, vec![group]).unwrap(), truth)
}

/// `[1 | X]` with the given predictors.
pub fn with_intercept(x: &Array2<f64>) -> Array2<f64> {
    let (n, p) = x.dim();
    let mut design = Array2::ones((n, p + 1));
    design.slice_mut(s![.., 1..]).assign(x);
    design
}

/// Dense solve by Gaussian elimination with partial pivoting; an independent
/// reference for the engine's factorizations.
pub fn solve_dense(a: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut m = a.clone();
    let mut rhs = b.clone();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| m[(i, col)].abs().total_cmp(&m[(j, col)].abs()))
            .unwrap();
        if pivot != col {
            for k in 0..n {
                m.swap((col, k), (pivot, k));
            }
            rhs.swap(col, pivot);
        }
        for row in (col + 1)..n {
            let factor = m[(row, col)] / m[(col, col)];
            for k in col..n {
                m[(row, k)] -= factor * m[(col, k)];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    let mut out = Array1::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| m[(row, k)] * out[k]).sum();
        out[row] = (rhs[row] - tail) / m[(row, row)];
    }
    out
}

/// Weighted least squares `(X'WX)^{-1} X'Wy` through `solve_dense`.
pub fn weighted_fit(design: &Array2<f64>, y: &Array1<f64>, w: &Array1<f64>) -> Array1<f64> {
    let q = design.ncols();
    let mut xtwx = Array2::<f64>::zeros((q, q));
    let mut xtwy = Array1::<f64>::zeros(q);
    for (j, row) in design.rows().into_iter().enumerate() {
        for a in 0..q {
            xtwy[a] += w[j] * row[a] * y[j];
            for b in 0..q {
                xtwx[(a, b)] += w[j] * row[a] * row[b];
            }
        }
    }
    solve_dense(&xtwx, &xtwy)
}
