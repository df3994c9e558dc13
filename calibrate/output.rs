//! Tabular results. `CoefficientTable` is the calibration's primary output:
//! one row per sample with the local coefficients, fitted value, residual,
//! leverage and estimation status. `BaselineTable` ingests coefficient tables
//! produced elsewhere (for example a reference GWR or GTWR fit) so the two can
//! be compared column by column.
//!
//! Both tables are tab separated with a header row.

use crate::estimator::PointStatus;
use ndarray::{Array1, Array2, ArrayView1};
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

pub const FITTED_COLUMN: &str = "fitted";
pub const RESIDUAL_COLUMN: &str = "residual";
pub const HAT_VALUE_COLUMN: &str = "hatValue";
pub const STATUS_COLUMN: &str = "status";

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("I/O error while accessing a results table: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed tab-separated table: {0}")]
    Csv(#[from] csv::Error),

    #[error("Column '{column}' row {row} holds '{value}', which is not a number.")]
    Parse {
        row: usize,
        column: String,
        value: String,
    },

    #[error("Expected {expected} column names for the value matrix but received {found}.")]
    ShapeMismatch { expected: usize, found: usize },

    #[error("Tables have different row counts: {expected} versus {found}.")]
    RowMismatch { expected: usize, found: usize },

    #[error("The tables share no coefficient columns.")]
    NoSharedColumns,
}

/// Per-sample local coefficients and fit statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientTable {
    /// `Intercept` followed by the predictor names.
    pub names: Vec<String>,
    /// `n x (p + 1)`, NaN rows for singular points.
    pub coefficients: Array2<f64>,
    pub fitted: Array1<f64>,
    pub residuals: Array1<f64>,
    pub hat_values: Array1<f64>,
    pub status: Vec<PointStatus>,
}

impl CoefficientTable {
    pub fn n_rows(&self) -> usize {
        self.coefficients.nrows()
    }

    /// A coefficient column by name.
    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|index| self.coefficients.column(index))
    }

    pub fn headers(&self) -> Vec<String> {
        self.names
            .iter()
            .cloned()
            .chain(
                [FITTED_COLUMN, RESIDUAL_COLUMN, HAT_VALUE_COLUMN, STATUS_COLUMN]
                    .into_iter()
                    .map(String::from),
            )
            .collect()
    }

    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<(), OutputError> {
        let mut out = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);
        out.write_record(self.headers())?;
        for i in 0..self.n_rows() {
            let mut record: Vec<String> = self
                .coefficients
                .row(i)
                .iter()
                .map(|v| v.to_string())
                .collect();
            record.push(self.fitted[i].to_string());
            record.push(self.residuals[i].to_string());
            record.push(self.hat_values[i].to_string());
            record.push(self.status[i].to_string());
            out.write_record(&record)?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn save_tsv(&self, path: &Path) -> Result<(), OutputError> {
        let file = BufWriter::new(fs::File::create(path)?);
        self.write_tsv(file)
    }

    /// Root mean squared difference for every coefficient column present in
    /// both tables, over rows where both values are finite.
    pub fn column_rmse(&self, baseline: &BaselineTable) -> Result<Vec<(String, f64)>, OutputError> {
        if baseline.n_rows() != self.n_rows() {
            return Err(OutputError::RowMismatch {
                expected: self.n_rows(),
                found: baseline.n_rows(),
            });
        }
        let scores: Vec<(String, f64)> = self
            .names
            .iter()
            .filter_map(|name| {
                let ours = self.column(name)?;
                let theirs = baseline.column(name)?;
                Some((name.clone(), rmse(ours, theirs)))
            })
            .collect();
        if scores.is_empty() {
            return Err(OutputError::NoSharedColumns);
        }
        Ok(scores)
    }
}

fn rmse(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let (sum, count) = a
        .iter()
        .zip(b.iter())
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .fold((0.0, 0usize), |(sum, count), (x, y)| {
            (sum + (x - y).powi(2), count + 1)
        });
    if count == 0 {
        f64::NAN
    } else {
        (sum / count as f64).sqrt()
    }
}

/// Reference coefficients in the same tabular shape as `CoefficientTable`.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineTable {
    names: Vec<String>,
    values: Array2<f64>,
}

impl BaselineTable {
    pub fn from_array(names: Vec<String>, values: Array2<f64>) -> Result<Self, OutputError> {
        if names.len() != values.ncols() {
            return Err(OutputError::ShapeMismatch {
                expected: values.ncols(),
                found: names.len(),
            });
        }
        Ok(Self { names, values })
    }

    /// Reads a tab-separated table with a header row. The `status` column,
    /// if present, is skipped; every other column must be numeric.
    pub fn read_tsv<R: Read>(reader: R) -> Result<Self, OutputError> {
        let mut input = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_reader(reader);
        let headers = input.headers()?.clone();
        let kept: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(_, name)| *name != STATUS_COLUMN)
            .map(|(index, name)| (index, name.trim().to_string()))
            .collect();

        let mut flat = Vec::new();
        let mut rows = 0;
        for record in input.records() {
            let record = record?;
            for (index, name) in &kept {
                let raw = record.get(*index).unwrap_or("").trim();
                let value = raw.parse::<f64>().map_err(|_| OutputError::Parse {
                    row: rows + 1,
                    column: name.clone(),
                    value: raw.to_string(),
                })?;
                flat.push(value);
            }
            rows += 1;
        }

        let names: Vec<String> = kept.into_iter().map(|(_, name)| name).collect();
        let values = Array2::from_shape_vec((rows, names.len()), flat).map_err(|_| {
            OutputError::ShapeMismatch {
                expected: names.len(),
                found: names.len(),
            }
        })?;
        Self::from_array(names, values)
    }

    pub fn load_tsv(path: &Path) -> Result<Self, OutputError> {
        Self::read_tsv(BufReader::new(fs::File::open(path)?))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|index| self.values.column(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::NamedTempFile;

    fn table() -> CoefficientTable {
        CoefficientTable {
            names: vec!["Intercept".into(), "x1".into()],
            coefficients: array![[1.0, 2.0], [f64::NAN, f64::NAN], [1.5, 2.5]],
            fitted: array![3.0, f64::NAN, 4.0],
            residuals: array![0.1, f64::NAN, -0.2],
            hat_values: array![0.4, f64::NAN, 0.3],
            status: vec![
                PointStatus::Estimated { degree: 1 },
                PointStatus::Singular,
                PointStatus::Estimated { degree: 0 },
            ],
        }
    }

    #[test]
    fn tsv_has_header_and_one_row_per_sample() {
        let mut buffer = Vec::new();
        table().write_tsv(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "Intercept\tx1\tfitted\tresidual\thatValue\tstatus");
        assert_eq!(lines[1], "1\t2\t3\t0.1\t0.4\tok(degree=1)");
        assert_eq!(lines[2], "NaN\tNaN\tNaN\tNaN\tNaN\tsingular");
    }

    #[test]
    fn saved_table_reads_back_as_baseline() {
        let file = NamedTempFile::new().unwrap();
        table().save_tsv(file.path()).unwrap();
        let baseline = BaselineTable::load_tsv(file.path()).unwrap();
        assert_eq!(
            baseline.names(),
            &["Intercept", "x1", "fitted", "residual", "hatValue"]
        );
        assert_eq!(baseline.n_rows(), 3);
        assert!(baseline.column("x1").unwrap()[1].is_nan());

        let scores = table().column_rmse(&baseline).unwrap();
        assert_eq!(scores.len(), 2);
        assert_abs_diff_eq!(scores[0].1, 0.0);
    }

    #[test]
    fn rmse_skips_non_finite_rows() {
        let baseline = BaselineTable::from_array(
            vec!["x1".into()],
            array![[2.0], [100.0], [1.5]],
        )
        .unwrap();
        let scores = table().column_rmse(&baseline).unwrap();
        assert_eq!(scores[0].0, "x1");
        // Differences 0 and 1 over the two finite rows.
        assert_abs_diff_eq!(scores[0].1, 0.5f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn malformed_baselines_are_rejected() {
        let text = "Intercept\tx1\n1.0\tabc\n";
        match BaselineTable::read_tsv(text.as_bytes()) {
            Err(OutputError::Parse { row, column, value }) => {
                assert_eq!((row, column.as_str(), value.as_str()), (1, "x1", "abc"));
            }
            other => panic!("Expected a parse error, got {:?}", other),
        }

        let short = BaselineTable::from_array(vec!["x1".into()], array![[1.0], [2.0]]).unwrap();
        assert!(matches!(
            table().column_rmse(&short),
            Err(OutputError::RowMismatch { expected: 3, found: 2 })
        ));
        let unrelated = BaselineTable::from_array(vec!["z".into()], array![[1.0], [2.0], [3.0]])
            .unwrap();
        assert!(matches!(
            table().column_rmse(&unrelated),
            Err(OutputError::NoSharedColumns)
        ));
    }
}
