use std::collections::{BTreeSet, HashMap};

use log::debug;
use rayon::prelude::*;

use crate::data::{FlowItem, FlowRecord, FlowTable};
use crate::error::{EncodeError, Error, FieldIssue, Result};
use crate::scaler::ScalerParams;
use crate::sequence;

/// Three-way label used for training.
pub const TARGET_COLUMN: &str = "class3";

/// Identifiers and labels, never model inputs.
pub const IGNORED_COLUMNS: [&str; 4] = ["id", "attack_cat", "label", TARGET_COLUMN];

pub const CATEGORICAL_COLUMNS: [&str; 3] = ["proto", "service", "state"];

/// Label encoding of the categorical columns, fitted on one table: each
/// distinct value maps to its rank among the sorted distinct values.
#[derive(Debug, Clone, Default)]
pub struct CategoricalEncoder {
    classes: HashMap<String, Vec<String>>,
}

impl CategoricalEncoder {
    pub fn fit(table: &FlowTable) -> Self {
        let classes = CATEGORICAL_COLUMNS
            .iter()
            .filter(|column| table.has_column(column))
            .map(|column| {
                let values: BTreeSet<&str> = table
                    .records()
                    .iter()
                    .map(|record| record.get(column).unwrap_or_default())
                    .collect();
                (
                    column.to_string(),
                    values.into_iter().map(String::from).collect(),
                )
            })
            .collect();

        Self { classes }
    }

    pub fn is_fitted(&self, column: &str) -> bool {
        self.classes.contains_key(column)
    }

    pub fn encode(&self, column: &str, value: &str) -> Option<f64> {
        let classes = self.classes.get(column)?;
        classes
            .binary_search_by(|class| class.as_str().cmp(value))
            .ok()
            .map(|index| index as f64)
    }
}

/// Tabular columns of a table, in header order.
pub fn feature_columns(table: &FlowTable) -> Vec<String> {
    table
        .headers()
        .iter()
        .filter(|header| !IGNORED_COLUMNS.contains(&header.as_str()))
        .cloned()
        .collect()
}

/// Raw tabular values of one record, `None` where the value is absent.
pub fn raw_features(
    row: usize,
    record: &FlowRecord,
    columns: &[String],
    encoder: &CategoricalEncoder,
) -> Result<Vec<Option<f64>>> {
    columns
        .iter()
        .map(|column| {
            let raw = record.get(column).map(str::trim);
            if encoder.is_fitted(column) {
                return Ok(encoder.encode(column, raw.unwrap_or_default()));
            }
            match raw {
                None | Some("") => Ok(None),
                Some(raw) => {
                    let value: f64 = raw.parse().map_err(|_| Error::Feature {
                        row,
                        column: column.clone(),
                        issue: FieldIssue::Malformed(raw.to_string()),
                    })?;
                    if !value.is_finite() {
                        return Err(Error::Feature {
                            row,
                            column: column.clone(),
                            issue: FieldIssue::NonFinite,
                        });
                    }
                    Ok(Some(value))
                }
            }
        })
        .collect()
}

fn target(row: usize, record: &FlowRecord) -> Result<usize> {
    record
        .get(TARGET_COLUMN)
        .map(str::trim)
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|value| value.fract() == 0.0 && (0.0..3.0).contains(value))
        .map(|value| value as usize)
        .ok_or(Error::Target {
            row,
            column: TARGET_COLUMN,
        })
}

/// Turns flow tables into model inputs: categorical encoding, reindexing to
/// the scaler's columns, scaling, and sequence encoding.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    scaler: ScalerParams,
    seq_len: usize,
}

impl Preprocessor {
    pub fn new(scaler: ScalerParams, seq_len: usize) -> Result<Self> {
        if seq_len == 0 {
            return Err(EncodeError::InvalidConfiguration { seq_len }.into());
        }
        Ok(Self { scaler, seq_len })
    }

    pub fn scaler(&self) -> &ScalerParams {
        &self.scaler
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Items for inference; targets are left at 0.
    pub fn prepare(&self, table: &FlowTable) -> Result<Vec<FlowItem>> {
        self.prepare_with(table, false)
    }

    /// Items for training; every row needs a valid target.
    pub fn prepare_labeled(&self, table: &FlowTable) -> Result<Vec<FlowItem>> {
        self.prepare_with(table, true)
    }

    fn prepare_with(&self, table: &FlowTable, labeled: bool) -> Result<Vec<FlowItem>> {
        let encoder = CategoricalEncoder::fit(table);
        let missing: Vec<&String> = self
            .scaler
            .columns()
            .iter()
            .filter(|column| !table.has_column(column))
            .collect();
        if !missing.is_empty() {
            debug!("Columns {missing:?} absent from input, filled with training means");
        }

        table
            .records()
            .par_iter()
            .enumerate()
            .map(|(row, record)| {
                let raw = raw_features(row, record, self.scaler.columns(), &encoder)?;
                let sequence = sequence::encode(record, self.seq_len)
                    .map_err(|source| Error::Row { row, source })?;
                let target = if labeled { target(row, record)? } else { 0 };

                Ok(FlowItem {
                    tabular: self.scaler.transform(&raw),
                    sequence: sequence.to_rows(),
                    target,
                })
            })
            .collect()
    }
}

/// Fits a scaler on the feature columns of a training table.
pub fn fit_scaler(table: &FlowTable) -> Result<ScalerParams> {
    let columns = feature_columns(table);
    let encoder = CategoricalEncoder::fit(table);
    let rows = table
        .records()
        .par_iter()
        .enumerate()
        .map(|(row, record)| raw_features(row, record, &columns, &encoder))
        .collect::<Result<Vec<_>>>()?;

    Ok(ScalerParams::fit(columns, &rows))
}
