use std::collections::HashMap;
use std::path::PathBuf;

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::helper_functions::{has_column, read_table, string_column};
use crate::models::Dataset;

/// Where to find a two-column key/value annotation table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationSource {
    pub path: PathBuf,
    pub key_column: String,
    pub value_column: String,
    #[serde(default = "default_separator")]
    pub separator: char,
}

fn default_separator() -> char {
    '\t'
}

/// Mapping *key → label* read from an annotation table (tag SNP → sentinel,
/// oligo → rsID).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationMap(pub HashMap<String, String>);

impl std::ops::Deref for AnnotationMap {
    type Target = HashMap<String, String>;
    fn deref(&self) -> &Self::Target { &self.0 }
}

pub struct AnnotationDataset {
    pub source: AnnotationSource,
}

impl Dataset for AnnotationDataset {
    fn load(&self) -> PipelineResult<DataFrame> {
        info!("Reading annotation table {}", self.source.path.display());
        let df = read_table(&self.source.path, self.source.separator as u8).map_err(|e| {
            error!("Failed to read annotation table: {}", e);
            PipelineError::from(e)
        })?;
        for name in [&self.source.key_column, &self.source.value_column] {
            if !has_column(&df, name) {
                return Err(PipelineError::MissingColumn(name.clone()));
            }
        }
        Ok(df)
    }
}

impl AnnotationDataset {
    pub fn load_map(&self) -> PipelineResult<AnnotationMap> {
        let df = self.load()?;
        annotation_map(&df, &self.source.key_column, &self.source.value_column)
    }
}

/// Builds the lookup. A key mapped to two different labels is a malformed
/// annotation and aborts; rows with an empty key or label are skipped.
pub fn annotation_map(df: &DataFrame, key_column: &str, value_column: &str) -> PipelineResult<AnnotationMap> {
    let keys = string_column(df, key_column)?;
    let values = string_column(df, value_column)?;

    let mut map = HashMap::with_capacity(keys.len());
    let mut skipped = 0usize;
    for (key, value) in keys.into_iter().zip(values) {
        let (Some(key), Some(value)) = (key, value) else {
            skipped += 1;
            continue;
        };
        if let Some(previous) = map.get(&key) {
            if *previous != value {
                return Err(PipelineError::JoinMismatch(format!(
                    "`{key}` maps to both `{previous}` and `{value}` in `{value_column}`"
                )));
            }
            continue;
        }
        map.insert(key, value);
    }
    if skipped > 0 {
        warn!("Skipped {} annotation rows with empty fields", skipped);
    }
    info!("Annotation {} -> {}: {} keys", key_column, value_column, map.len());
    Ok(AnnotationMap(map))
}
