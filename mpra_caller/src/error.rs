use std::fmt;

use polars::prelude::PolarsError;
use thiserror::Error;

/// Fatal problems. Any of these aborts the run, because a bad schema or a
/// broken join would otherwise produce call tables with the wrong rows.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("required column `{0}` is missing from the count table")]
    MissingColumn(String),

    #[error("count column `{column}` holds an invalid value at row {row}: {detail}")]
    InvalidCount {
        column: String,
        row: usize,
        detail: String,
    },

    #[error("channel `{channel}` sums to zero and cannot be normalized")]
    ZeroSumChannel { channel: String },

    #[error("invalid assay layout: {0}")]
    Layout(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("identifier join mismatch: {0}")]
    JoinMismatch(String),

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Recoverable conditions, collected into the run output next to the calls.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineWarning {
    /// Items skipped by a test because they had too few observations or the
    /// wrong allele composition.
    InsufficientData {
        stage: &'static str,
        condition: String,
        excluded: Vec<String>,
        reason: String,
    },
    /// A rank-sum pool with no variance; the item got p = 1.
    NumericDegeneracy {
        stage: &'static str,
        condition: String,
        id: String,
    },
    /// Fewer barcodes than expected passed the DNA abundance threshold.
    LowBarcodeRetention { retained: usize, total: usize, minimum_fraction: f64 },
    /// A replicate channel with no signal was dropped from the ratio matrix.
    ExcludedChannel { channel: String, reason: String },
    /// Barcodes dropped before quantile normalization for a non-finite ratio.
    NonFiniteRatios { dropped: usize, total: usize },
}

impl fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineWarning::InsufficientData { stage, condition, excluded, reason } => {
                let preview: Vec<&str> = excluded.iter().take(5).map(|s| s.as_str()).collect();
                let more = if excluded.len() > preview.len() { ", ..." } else { "" };
                write!(
                    f,
                    "[{stage}/{condition}] {} item(s) untested ({reason}): {}{more}",
                    excluded.len(),
                    preview.join(", ")
                )
            }
            PipelineWarning::NumericDegeneracy { stage, condition, id } => {
                write!(f, "[{stage}/{condition}] zero-variance rank pool for `{id}`, p set to 1")
            }
            PipelineWarning::LowBarcodeRetention { retained, total, minimum_fraction } => {
                let fraction = if *total == 0 { 0.0 } else { *retained as f64 / *total as f64 };
                write!(
                    f,
                    "only {retained}/{total} barcodes ({:.1}%) passed the DNA abundance filter, expected at least {:.0}%",
                    fraction * 100.0,
                    minimum_fraction * 100.0
                )
            }
            PipelineWarning::ExcludedChannel { channel, reason } => {
                write!(f, "channel `{channel}` excluded: {reason}")
            }
            PipelineWarning::NonFiniteRatios { dropped, total } => {
                write!(f, "{dropped}/{total} barcodes dropped for a non-finite activity ratio")
            }
        }
    }
}
