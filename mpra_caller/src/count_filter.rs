use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult, PipelineWarning};
use crate::helper_functions::has_column;
use crate::layout::AssayLayout;
use crate::normalization::log2_cpm_column;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    /// Flag value marking a valid variant construct; other rows are dropped.
    pub keep_flag: String,
    /// Minimum pooled-DNA log2 CPM for a barcode to be kept.
    pub min_log2_count: f64,
    /// Retained fraction below which the run is flagged as under-powered.
    pub min_retained_fraction: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            keep_flag: "var".to_string(),
            min_log2_count: 8.0,
            min_retained_fraction: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetentionReport {
    pub total: usize,
    pub retained: usize,
}

impl RetentionReport {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.retained as f64 / self.total as f64
        }
    }
}

pub fn pooled_dna_column(condition: &str) -> String {
    format!("{condition}_DNA_pooled")
}

/// Keeps rows whose `flag_column` equals the configured keep value and adds
/// one pooled DNA column per condition (sum of its DNA replicates).
///
/// Pooled columns are recomputed from the raw DNA channels, so running the
/// filter on its own output changes nothing.
pub fn filter_counts(
    raw: &DataFrame,
    flag_column: &str,
    layout: &AssayLayout,
    params: &FilterParams,
) -> PipelineResult<DataFrame> {
    if !has_column(raw, flag_column) {
        return Err(PipelineError::MissingColumn(flag_column.to_string()));
    }

    let mut pooled = Vec::with_capacity(layout.conditions().len());
    for condition in layout.conditions() {
        let sum = condition
            .dna_channels
            .iter()
            .map(|c| col(c.as_str()).cast(DataType::Float64))
            .reduce(|a, b| a + b)
            .ok_or_else(|| PipelineError::Layout(format!("condition `{}` has no DNA channel", condition.name)))?;
        pooled.push(sum.alias(pooled_dna_column(&condition.name)));
    }

    let before = raw.height();
    let filtered = raw
        .clone()
        .lazy()
        .filter(col(flag_column).cast(DataType::String).eq(lit(params.keep_flag.as_str())))
        .with_columns(pooled)
        .collect()?;

    info!(
        "Restriction-site filter kept {}/{} barcodes (flag `{}` == `{}`)",
        filtered.height(),
        before,
        flag_column,
        params.keep_flag
    );
    Ok(filtered)
}

/// Drops barcodes whose pooled DNA log2 CPM is below `min_log2_count` in any
/// condition. Works on the log table, so re-application is a no-op.
pub fn apply_abundance_threshold(
    log_table: &DataFrame,
    layout: &AssayLayout,
    params: &FilterParams,
) -> PipelineResult<(DataFrame, RetentionReport, Option<PipelineWarning>)> {
    let predicate = layout
        .conditions()
        .iter()
        .map(|c| col(log2_cpm_column(&pooled_dna_column(&c.name)).as_str()).gt_eq(lit(params.min_log2_count)))
        .reduce(|a, b| a.and(b))
        .ok_or_else(|| PipelineError::Layout("no conditions defined".into()))?;

    let kept = log_table.clone().lazy().filter(predicate).collect()?;
    let report = RetentionReport {
        total: log_table.height(),
        retained: kept.height(),
    };
    info!(
        "DNA abundance filter (log2 CPM >= {}) kept {}/{} barcodes ({:.1}%)",
        params.min_log2_count,
        report.retained,
        report.total,
        report.fraction() * 100.0
    );

    let warning = if report.fraction() < params.min_retained_fraction {
        let w = PipelineWarning::LowBarcodeRetention {
            retained: report.retained,
            total: report.total,
            minimum_fraction: params.min_retained_fraction,
        };
        warn!("{}", w);
        Some(w)
    } else {
        debug!("Barcode retention above {:.0}%", params.min_retained_fraction * 100.0);
        None
    };

    Ok((kept, report, warning))
}
