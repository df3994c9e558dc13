#![deny(dead_code)]
#![deny(unused_imports)]

//! # GWDR calibration engine
//!
//! Locally weighted regression whose coefficients vary over an arbitrary
//! multidimensional coordinate space: space, space-time, or origin-destination
//! flows given as precomputed distances. Each dimension carries its own kernel
//! and bandwidth, and the per-dimension weights multiply into one composite
//! weight per sample pair.
//!
//! The pieces, leaves first:
//!
//! - `kernel`: decay functions, bandwidth specifications and their validation.
//! - `distance`: Euclidean and precomputed distance sources, plus a cache.
//! - `weights`: product-kernel weight rows, with a leave-one-out mode.
//! - `estimator` / `polynomial`: kernel smoothing and local polynomial fits.
//! - `calibrator`: the per-point loop and the run diagnostics.
//! - `optimizer`: a Nelder-Mead search over the bandwidth vector.

pub mod calibrator;
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod distance;
pub mod estimator;
pub mod kernel;
pub mod linalg;
pub mod optimizer;
pub mod output;
pub mod polynomial;
pub mod weights;

pub use calibrator::{Calibration, CalibrationConfig, CalibrationError, ModelCalibrator, calibrate};
pub use config::{ConfigError, EngineConfig};
pub use data::{DataError, Dataset};
pub use diagnostics::{Criterion, Diagnostics, Objective};
pub use distance::{CoordinateGroup, DistanceCache, DistanceError, DistanceProvider};
pub use estimator::{EstimationError, KernelSmoothOptions, PointStatus, Solver};
pub use kernel::{GOLDEN_FRACTION, KernelFunction, KernelSpec, SpecError};
pub use optimizer::{
    BandwidthOptimizer, CancellationToken, OptimizationOutcome, OptimizerConfig, Termination,
    optimize,
};
pub use output::{BaselineTable, CoefficientTable, OutputError};
pub use polynomial::LocalPolyOptions;
