use std::fmt;

use polars::frame::DataFrame;
use serde::Serialize;

use crate::error::PipelineResult;

/// A delimited table the pipeline reads from disk.
pub trait Dataset {
    fn load(&self) -> PipelineResult<DataFrame>;
}

/// Haplotype label of an allele within its construct.
///
/// Positive-control constructs may carry extra mutant designs, which land in
/// `Other` with their original label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AlleleType {
    Ref,
    Mut,
    Other(String),
}

impl AlleleType {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "ref" | "reference" => AlleleType::Ref,
            "mut" | "mutant" | "alt" => AlleleType::Mut,
            _ => AlleleType::Other(trimmed.to_string()),
        }
    }
}

impl fmt::Display for AlleleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlleleType::Ref => write!(f, "Ref"),
            AlleleType::Mut => write!(f, "Mut"),
            AlleleType::Other(label) => write!(f, "{label}"),
        }
    }
}

/// Identifying metadata of one barcode row.
#[derive(Debug, Clone, PartialEq)]
pub struct BarcodeAnnotation {
    pub chr: String,
    pub pos: String,
    pub ref_allele: String,
    pub alt_allele: String,
    pub oligo: String,
    pub construct: String,
    pub allele: String,
    pub allele_type: AlleleType,
}
