use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Standard scaler parameters, one entry per tabular feature column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerParams {
    columns: Vec<String>,
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl ScalerParams {
    pub fn new(columns: Vec<String>, mean: Vec<f64>, scale: Vec<f64>) -> Result<Self> {
        let params = Self {
            columns,
            mean,
            scale,
        };
        params.validate()?;
        Ok(params)
    }

    /// Fits mean and population standard deviation per column, skipping
    /// missing values. Constant columns get a scale of 1.
    pub fn fit(columns: Vec<String>, rows: &[Vec<Option<f64>>]) -> Self {
        let mut mean = Vec::with_capacity(columns.len());
        let mut scale = Vec::with_capacity(columns.len());

        for index in 0..columns.len() {
            let values: Vec<f64> = rows.iter().filter_map(|row| row.get(index).copied().flatten()).collect();
            if values.is_empty() {
                mean.push(0.0);
                scale.push(1.0);
                continue;
            }

            let count = values.len() as f64;
            let m = values.iter().sum::<f64>() / count;
            let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / count;
            let std = variance.sqrt();

            mean.push(m);
            scale.push(if std < 10.0 * f64::EPSILON { 1.0 } else { std });
        }

        Self {
            columns,
            mean,
            scale,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let params: ScalerParams = serde_json::from_reader(reader)?;
        params.validate()?;
        Ok(params)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.mean.len() != self.columns.len() || self.scale.len() != self.columns.len() {
            return Err(Error::ScalerShape {
                columns: self.columns.len(),
                mean: self.mean.len(),
                scale: self.scale.len(),
            });
        }
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Scales one raw row laid out like [`columns`](Self::columns). Missing
    /// values are filled with the column mean, i.e. 0 after scaling.
    pub fn transform(&self, row: &[Option<f64>]) -> Vec<f32> {
        self.mean
            .iter()
            .zip(&self.scale)
            .enumerate()
            .map(|(i, (mean, scale))| match row.get(i).copied().flatten() {
                Some(_) if scale.abs() < 1e-8 => 0.0,
                Some(value) => ((value - mean) / scale) as f32,
                None => 0.0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn fit_computes_population_statistics() {
        let rows = vec![
            vec![Some(1.0), Some(5.0)],
            vec![Some(3.0), Some(5.0)],
            vec![None, Some(5.0)],
        ];

        let scaler = ScalerParams::fit(columns(&["a", "b"]), &rows);

        assert_eq!(scaler.mean(), &[2.0, 5.0]);
        assert_eq!(scaler.scale(), &[1.0, 1.0]);
    }

    #[test]
    fn transform_standardises_and_fills_missing() {
        let scaler =
            ScalerParams::new(columns(&["a", "b", "c"]), vec![10.0, 0.0, 1.0], vec![2.0, 1.0, 0.0])
                .unwrap();

        let scaled = scaler.transform(&[Some(14.0), None, Some(3.0)]);

        assert_eq!(scaled, vec![2.0, 0.0, 0.0]);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let err = ScalerParams::new(columns(&["a", "b"]), vec![0.0], vec![1.0, 1.0]).unwrap_err();

        assert!(matches!(
            err,
            Error::ScalerShape {
                columns: 2,
                mean: 1,
                scale: 2
            }
        ));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scaler.json");
        let scaler = ScalerParams::fit(
            columns(&["sbytes", "dbytes"]),
            &[vec![Some(100.0), Some(0.0)], vec![Some(300.0), Some(40.0)]],
        );

        scaler.save(&path).unwrap();

        assert_eq!(ScalerParams::load(&path).unwrap(), scaler);
    }

    #[test]
    fn load_rejects_inconsistent_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scaler.json");
        std::fs::write(&path, r#"{"columns":["a"],"mean":[],"scale":[1.0]}"#).unwrap();

        assert!(matches!(
            ScalerParams::load(&path),
            Err(Error::ScalerShape { .. })
        ));
    }
}
