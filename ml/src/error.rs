use thiserror::Error;

/// Why a numeric flow field was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldIssue {
    Malformed(String),
    NonFinite,
    Negative(f64),
}

impl std::fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldIssue::Malformed(raw) => write!(f, "{raw:?} is not a number"),
            FieldIssue::NonFinite => write!(f, "value is not finite"),
            FieldIssue::Negative(value) => write!(f, "value {value} is negative"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("invalid configuration: sequence length must be positive, got {seq_len}")]
    InvalidConfiguration { seq_len: usize },

    #[error("invalid record: field `{field}`: {issue}")]
    InvalidRecord { field: &'static str, issue: FieldIssue },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("row {row}: {source}")]
    Row { row: usize, source: EncodeError },

    #[error("row {row}: column `{column}`: {issue}")]
    Feature {
        row: usize,
        column: String,
        issue: FieldIssue,
    },

    #[error("row {row}: missing or invalid target in column `{column}`")]
    Target { row: usize, column: &'static str },

    #[error("{records} records but {predictions} predictions")]
    Mismatch { records: usize, predictions: usize },

    #[error("unknown class index {0}")]
    UnknownClass(usize),

    #[error("scaler has {columns} columns but {mean} means and {scale} scales")]
    ScalerShape {
        columns: usize,
        mean: usize,
        scale: usize,
    },

    #[error("artifact {path}: {message}")]
    Artifact { path: String, message: String },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
