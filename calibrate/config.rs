//! Engine configuration in a human-readable TOML format. A minimal file only
//! needs the kernel list:
//!
//! ```toml
//! [[kernels]]
//! bandwidth = 0.618
//! kernel = "gaussian"
//! adaptive = true
//! ```
//!
//! Every other section falls back to its defaults.

use crate::calibrator::{Calibration, CalibrationConfig, CalibrationError, ModelCalibrator};
use crate::data::Dataset;
use crate::diagnostics::Criterion;
use crate::estimator::Solver;
use crate::kernel::KernelSpec;
use crate::optimizer::{BandwidthOptimizer, OptimizationOutcome, OptimizerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write the configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse the configuration TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize the configuration to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub criterion: Criterion,
    pub kernels: Vec<KernelSpec>,
    pub solver: Solver,
    pub calibration: CalibrationConfig,
    pub optimizer: OptimizerConfig,
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_toml_string()?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn calibrator<'a>(&self, dataset: &'a Dataset) -> Result<ModelCalibrator<'a>, CalibrationError> {
        ModelCalibrator::new(dataset, self.solver, self.calibration)
    }

    /// Calibrates with the configured kernels.
    pub fn calibrate(&self, dataset: &Dataset) -> Result<Calibration, CalibrationError> {
        self.calibrator(dataset)?.calibrate(&self.kernels)
    }

    pub fn optimizer<'a>(&self, dataset: &'a Dataset) -> Result<BandwidthOptimizer<'a>, CalibrationError> {
        BandwidthOptimizer::new(
            dataset,
            self.solver,
            self.criterion,
            self.calibration,
            self.optimizer,
        )
    }

    /// Searches bandwidths starting from the configured kernels.
    pub fn optimize(&self, dataset: &Dataset) -> Result<OptimizationOutcome, CalibrationError> {
        self.optimizer(dataset)?.optimize(&self.kernels)
    }
}
