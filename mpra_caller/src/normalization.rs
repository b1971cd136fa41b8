use ndarray::{Array2, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::count_filter::{apply_abundance_threshold, pooled_dna_column, FilterParams, RetentionReport};
use crate::data_handling::count_table::{barcode_annotations, MetadataColumns};
use crate::error::{PipelineError, PipelineResult, PipelineWarning};
use crate::helper_functions::{f64_column, median};
use crate::layout::AssayLayout;
use crate::models::BarcodeAnnotation;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationParams {
    pub pseudocount: f64,
    pub scale: f64,
}

impl NormalizationParams {
    /// A zero pseudocount is allowed; rows it leaves non-finite are dropped later.
    pub fn validate(&self) -> PipelineResult<()> {
        if !self.pseudocount.is_finite() || self.pseudocount < 0.0 {
            return Err(PipelineError::InvalidParameter(format!(
                "pseudocount must be finite and non-negative, got {}",
                self.pseudocount
            )));
        }
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(PipelineError::InvalidParameter(format!(
                "scale must be finite and positive, got {}",
                self.scale
            )));
        }
        Ok(())
    }
}

impl Default for NormalizationParams {
    fn default() -> Self {
        Self {
            pseudocount: 1.0,
            scale: 1e6,
        }
    }
}

pub fn cpm_column(channel: &str) -> String {
    format!("{channel}_cpm")
}

pub fn log2_cpm_column(channel: &str) -> String {
    format!("{channel}_log2cpm")
}

/// One (condition, replicate) column of the ratio matrix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RatioChannel {
    pub condition: String,
    pub replicate: String,
    pub rna_column: String,
}

impl RatioChannel {
    pub fn name(&self) -> String {
        format!("{}_ratio_{}", self.condition, self.replicate)
    }
}

/// Quantile-normalized, median-centred log2(RNA/DNA) per barcode (rows) and
/// ratio channel (columns).
#[derive(Debug, Clone)]
pub struct RatioTable {
    pub barcodes: Vec<BarcodeAnnotation>,
    pub channels: Vec<RatioChannel>,
    pub values: Array2<f64>,
}

impl RatioTable {
    /// Conditions in channel order, without duplicates.
    pub fn conditions(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for channel in &self.channels {
            if !out.contains(&channel.condition) {
                out.push(channel.condition.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedCounts {
    /// Filtered counts with CPM and log2 CPM columns, after the abundance threshold.
    pub log_table: DataFrame,
    pub ratios: RatioTable,
    pub retention: RetentionReport,
    /// Layout without channels that were excluded for lack of signal.
    pub layout: AssayLayout,
    pub warnings: Vec<PipelineWarning>,
}

/// Adds `<channel>_cpm` and `<channel>_log2cpm` for every RNA channel and
/// pooled DNA column.
///
/// An RNA channel with zero raw counts is excluded (returned layout lacks it)
/// and reported; a zero pooled DNA column aborts, since every ratio of that
/// condition would be undefined.
pub fn compute_log_cpm(
    filtered: &DataFrame,
    layout: &AssayLayout,
    params: &NormalizationParams,
) -> PipelineResult<(DataFrame, AssayLayout, Vec<PipelineWarning>)> {
    params.validate()?;
    let mut warnings = Vec::new();
    let mut excluded = Vec::new();

    for condition in layout.conditions() {
        let pooled = pooled_dna_column(&condition.name);
        if column_sum(filtered, &pooled)? <= 0.0 {
            return Err(PipelineError::ZeroSumChannel { channel: pooled });
        }
        for channel in &condition.rna_channels {
            if excluded.contains(&channel.column) {
                continue;
            }
            if column_sum(filtered, &channel.column)? <= 0.0 {
                let w = PipelineWarning::ExcludedChannel {
                    channel: channel.column.clone(),
                    reason: "column sums to zero".into(),
                };
                warn!("{}", w);
                warnings.push(w);
                excluded.push(channel.column.clone());
            }
        }
    }
    let layout = if excluded.is_empty() {
        layout.clone()
    } else {
        layout.without_rna_channels(&excluded).map_err(|_| PipelineError::ZeroSumChannel {
            channel: excluded.join(","),
        })?
    };

    let mut channels: Vec<String> = Vec::new();
    for condition in layout.conditions() {
        let pooled = pooled_dna_column(&condition.name);
        for name in std::iter::once(pooled).chain(condition.rna_channels.iter().map(|r| r.column.clone())) {
            if !channels.contains(&name) {
                channels.push(name);
            }
        }
    }

    let cpm: Vec<Expr> = channels
        .iter()
        .map(|c| {
            let shifted = col(c.as_str()).cast(DataType::Float64) + lit(params.pseudocount);
            (shifted.clone() * lit(params.scale) / shifted.sum()).alias(cpm_column(c))
        })
        .collect();
    let log2: Vec<Expr> = channels
        .iter()
        .map(|c| col(cpm_column(c).as_str()).log(2.0).alias(log2_cpm_column(c)))
        .collect();

    let table = filtered
        .clone()
        .lazy()
        .with_columns(cpm)
        .with_columns(log2)
        .collect()?;
    debug!("Computed CPM for {} channels", channels.len());

    Ok((table, layout, warnings))
}

fn column_sum(df: &DataFrame, name: &str) -> PipelineResult<f64> {
    Ok(f64_column(df, name)?.into_iter().flatten().sum())
}

/// log2(RNA CPM) - log2(pooled DNA CPM) for every (condition, replicate).
pub fn ratio_matrix(log_table: &DataFrame, layout: &AssayLayout) -> PipelineResult<(Vec<RatioChannel>, Array2<f64>)> {
    let mut channels = Vec::new();
    let mut exprs = Vec::new();
    for condition in layout.conditions() {
        let dna = log2_cpm_column(&pooled_dna_column(&condition.name));
        for rna in &condition.rna_channels {
            let channel = RatioChannel {
                condition: condition.name.clone(),
                replicate: rna.replicate.clone(),
                rna_column: rna.column.clone(),
            };
            exprs.push((col(log2_cpm_column(&rna.column).as_str()) - col(dna.as_str())).alias(channel.name()));
            channels.push(channel);
        }
    }

    let ratios = log_table.clone().lazy().select(exprs).collect()?;
    let mut columns = Vec::with_capacity(channels.len());
    for channel in &channels {
        let values: Vec<f64> = f64_column(&ratios, &channel.name())?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        columns.push(values);
    }

    let matrix = Array2::from_shape_fn((ratios.height(), channels.len()), |(i, j)| columns[j][i]);
    Ok((channels, matrix))
}

/// Keeps only rows whose ratios are finite in every column. Returns the kept
/// row indices alongside the reduced matrix.
pub fn finite_rows(matrix: &Array2<f64>) -> (Vec<usize>, Array2<f64>) {
    let keep: Vec<usize> = matrix
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, row)| row.iter().all(|v| v.is_finite()))
        .map(|(i, _)| i)
        .collect();
    let reduced = matrix.select(Axis(0), &keep);
    (keep, reduced)
}

/// Rank-based quantile normalization across columns.
///
/// The reference distribution is the position-wise mean of the sorted
/// columns. Values tied within a column all receive the mean reference value
/// of the rank span they occupy. Input must be finite; see [`finite_rows`].
pub fn quantile_normalize(matrix: &Array2<f64>) -> Array2<f64> {
    let (nrows, ncols) = matrix.dim();
    if nrows == 0 || ncols == 0 {
        return matrix.clone();
    }

    let mut orders = Vec::with_capacity(ncols);
    let mut reference = vec![0.0; nrows];
    for j in 0..ncols {
        let column = matrix.column(j);
        let mut order: Vec<usize> = (0..nrows).collect();
        order.sort_by(|&a, &b| column[a].total_cmp(&column[b]));
        for (position, &row) in order.iter().enumerate() {
            reference[position] += column[row];
        }
        orders.push(order);
    }
    for value in reference.iter_mut() {
        *value /= ncols as f64;
    }

    let mut normalized = Array2::<f64>::zeros((nrows, ncols));
    for (j, order) in orders.iter().enumerate() {
        let column = matrix.column(j);
        let mut start = 0;
        while start < nrows {
            let mut end = start + 1;
            while end < nrows && column[order[end]] == column[order[start]] {
                end += 1;
            }
            let fill = reference[start..end].iter().sum::<f64>() / (end - start) as f64;
            for &row in &order[start..end] {
                normalized[[row, j]] = fill;
            }
            start = end;
        }
    }
    normalized
}

/// Shifts the whole matrix so its global median is zero.
pub fn recenter(mut matrix: Array2<f64>) -> Array2<f64> {
    let values: Vec<f64> = matrix.iter().copied().collect();
    if let Some(center) = median(&values) {
        matrix.mapv_inplace(|v| v - center);
    }
    matrix
}

/// Full normalizer: CPM/log2, abundance threshold, ratios, quantile
/// normalization and recentering.
pub fn normalize(
    filtered: &DataFrame,
    layout: &AssayLayout,
    columns: &MetadataColumns,
    filter: &FilterParams,
    params: &NormalizationParams,
) -> PipelineResult<NormalizedCounts> {
    let (log_table, layout, mut warnings) = compute_log_cpm(filtered, layout, params)?;
    let (log_table, retention, retention_warning) = apply_abundance_threshold(&log_table, &layout, filter)?;
    warnings.extend(retention_warning);

    let (channels, raw_ratios) = ratio_matrix(&log_table, &layout)?;
    let (keep, finite) = finite_rows(&raw_ratios);
    let mut barcodes = barcode_annotations(&log_table, columns)?;
    if keep.len() < barcodes.len() {
        let w = PipelineWarning::NonFiniteRatios {
            dropped: barcodes.len() - keep.len(),
            total: barcodes.len(),
        };
        warn!("{}", w);
        warnings.push(w);
        barcodes = keep.iter().map(|&i| barcodes[i].clone()).collect();
    }
    let values = recenter(quantile_normalize(&finite));
    info!(
        "Quantile-normalized {} barcodes across {} ratio channels",
        barcodes.len(),
        channels.len()
    );

    Ok(NormalizedCounts {
        log_table,
        ratios: RatioTable { barcodes, channels, values },
        retention,
        layout,
        warnings,
    })
}
