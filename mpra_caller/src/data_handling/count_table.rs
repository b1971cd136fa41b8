use std::path::PathBuf;

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{PipelineError, PipelineResult};
use crate::helper_functions::{f64_column, has_column, read_table, string_column};
use crate::models::{AlleleType, BarcodeAnnotation, Dataset};

/// Names of the identifying columns in the raw count table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataColumns {
    pub chr: String,
    pub pos: String,
    pub ref_allele: String,
    pub alt_allele: String,
    pub allele_type: String,
    pub oligo: String,
    pub construct: String,
    pub allele: String,
    pub clean: String,
}

impl Default for MetadataColumns {
    fn default() -> Self {
        Self {
            chr: "chr".into(),
            pos: "pos".into(),
            ref_allele: "ref".into(),
            alt_allele: "alt".into(),
            allele_type: "type".into(),
            oligo: "oligo".into(),
            construct: "construct".into(),
            allele: "byallele".into(),
            clean: "clean".into(),
        }
    }
}

impl MetadataColumns {
    pub fn required(&self) -> [&str; 9] {
        [
            &self.chr,
            &self.pos,
            &self.ref_allele,
            &self.alt_allele,
            &self.allele_type,
            &self.oligo,
            &self.construct,
            &self.allele,
            &self.clean,
        ]
    }
}

/// Barcode-level DNA/RNA count table, one row per barcode.
pub struct CountTableDataset {
    pub path: PathBuf,
    pub separator: u8,
    pub columns: MetadataColumns,
}

impl Dataset for CountTableDataset {
    fn load(&self) -> PipelineResult<DataFrame> {
        info!("Reading barcode counts from {}", self.path.display());
        let df = match read_table(&self.path, self.separator) {
            Ok(df) => df,
            Err(e) => {
                error!("Failed to read count table: {}", e);
                return Err(e.into());
            }
        };
        validate_metadata(&df, &self.columns)?;
        info!("Loaded {} barcodes x {} columns", df.height(), df.width());
        Ok(df)
    }
}

pub fn validate_metadata(df: &DataFrame, columns: &MetadataColumns) -> PipelineResult<()> {
    for name in columns.required() {
        if !has_column(df, name) {
            error!("Count table lacks metadata column `{}`", name);
            return Err(PipelineError::MissingColumn(name.to_string()));
        }
    }
    Ok(())
}

/// Every channel must hold non-negative integer counts with no gaps.
pub fn validate_counts(df: &DataFrame, channels: &[&str]) -> PipelineResult<()> {
    for &channel in channels {
        let values = f64_column(df, channel)?;
        for (row, value) in values.iter().enumerate() {
            let detail = match value {
                None => Some("missing count"),
                Some(v) if !v.is_finite() => Some("non-finite count"),
                Some(v) if *v < 0.0 => Some("negative count"),
                Some(v) if v.fract() != 0.0 => Some("fractional count"),
                _ => None,
            };
            if let Some(detail) = detail {
                return Err(PipelineError::InvalidCount {
                    column: channel.to_string(),
                    row,
                    detail: detail.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Extracts row metadata. Construct, allele and type must be present; the
/// descriptive columns fall back to `NA`.
pub fn barcode_annotations(df: &DataFrame, columns: &MetadataColumns) -> PipelineResult<Vec<BarcodeAnnotation>> {
    let required = |name: &str| -> PipelineResult<Vec<String>> {
        string_column(df, name)?
            .into_iter()
            .enumerate()
            .map(|(row, v)| {
                v.ok_or_else(|| {
                    PipelineError::JoinMismatch(format!("row {row} has no value in `{name}`"))
                })
            })
            .collect()
    };
    let descriptive = |name: &str| -> PipelineResult<Vec<String>> {
        Ok(string_column(df, name)?
            .into_iter()
            .map(|v| v.unwrap_or_else(|| "NA".to_string()))
            .collect())
    };

    let construct = required(&columns.construct)?;
    let allele = required(&columns.allele)?;
    let allele_type = required(&columns.allele_type)?;
    let chr = descriptive(&columns.chr)?;
    let pos = descriptive(&columns.pos)?;
    let ref_allele = descriptive(&columns.ref_allele)?;
    let alt_allele = descriptive(&columns.alt_allele)?;
    let oligo = descriptive(&columns.oligo)?;

    let annotations = (0..df.height())
        .map(|i| BarcodeAnnotation {
            chr: chr[i].clone(),
            pos: pos[i].clone(),
            ref_allele: ref_allele[i].clone(),
            alt_allele: alt_allele[i].clone(),
            oligo: oligo[i].clone(),
            construct: construct[i].clone(),
            allele: allele[i].clone(),
            allele_type: AlleleType::parse(&allele_type[i]),
        })
        .collect();
    Ok(annotations)
}
