use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::analysis::activity::ActivityParams;
use crate::analysis::differential::DifferentialParams;
use crate::analysis::qvalue::QValueParams;
use crate::analysis::rank_tests::RankTestParams;
use crate::analysis::reproducibility::ReproducibilityParams;
use crate::count_filter::FilterParams;
use crate::data_handling::annotations::AnnotationSource;
use crate::data_handling::count_table::MetadataColumns;
use crate::error::PipelineResult;
use crate::helper_functions::project_root;
use crate::layout::LayoutConfig;
use crate::normalization::NormalizationParams;

pub const CONFIG_ENV: &str = "MPRA_CONFIG";

/// Everything a run needs. All sections default, so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub counts_path: PathBuf,
    /// Single-byte field separator of the count table.
    pub separator: char,
    /// Tag SNP -> sentinel, keyed by construct id.
    pub linkage: Option<AnnotationSource>,
    /// Oligo id -> rsID.
    pub rsid: Option<AnnotationSource>,
    pub output_dir: PathBuf,
    pub columns: MetadataColumns,
    pub layout: LayoutConfig,
    pub filter: FilterParams,
    pub normalization: NormalizationParams,
    pub activity: ActivityParams,
    pub differential: DifferentialParams,
    pub rank_test: RankTestParams,
    pub qvalue: QValueParams,
    pub reproducibility: ReproducibilityParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            counts_path: PathBuf::from("./data/counts.tsv"),
            separator: '\t',
            linkage: None,
            rsid: None,
            output_dir: PathBuf::from("./results"),
            columns: MetadataColumns::default(),
            layout: LayoutConfig::default(),
            filter: FilterParams::default(),
            normalization: NormalizationParams::default(),
            activity: ActivityParams::default(),
            differential: DifferentialParams::default(),
            rank_test: RankTestParams::default(),
            qvalue: QValueParams::default(),
            reproducibility: ReproducibilityParams::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn separator_byte(&self) -> u8 {
        if self.separator.is_ascii() {
            self.separator as u8
        } else {
            warn!("Separator {:?} is not ASCII, using tab", self.separator);
            b'\t'
        }
    }
}

/// CLI argument, then `MPRA_CONFIG`, then `<project root>/config/pipeline.json`.
pub fn config_path(cli_arg: Option<String>) -> PathBuf {
    cli_arg
        .or_else(|| env::var(CONFIG_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| project_root().join("config").join("pipeline.json"))
}

/// Reads the config; a missing file means defaults, a malformed one is an error.
pub fn load_config(path: &Path) -> PipelineResult<PipelineConfig> {
    if !path.exists() {
        warn!("No config at {}, running with defaults", path.display());
        return Ok(PipelineConfig::default());
    }
    let config = PipelineConfig::from_file(path)?;
    config.normalization.validate()?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::qvalue::Pi0Estimator;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "counts_path": "counts.txt",
                "filter": {{ "min_log2_count": 6.5 }},
                "qvalue": {{ "pi0": {{ "method": "bootstrap", "seed": 11 }} }},
                "linkage": {{ "path": "ld.tsv", "key_column": "construct", "value_column": "sentinel" }}
            }}"#
        )
        .unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.counts_path, PathBuf::from("counts.txt"));
        assert_eq!(config.filter.min_log2_count, 6.5);
        assert_eq!(config.filter.keep_flag, "var");
        assert_eq!(config.activity.min_observations, 7);
        assert_eq!(config.qvalue.pi0, Pi0Estimator::Bootstrap { seed: 11, resamples: 100 });
        assert_eq!(config.linkage.unwrap().separator, '\t');
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.separator_byte(), b'\t');
        assert!(config.rsid.is_none());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn invalid_normalization_is_rejected_on_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "normalization": {{ "pseudocount": -0.5 }} }}"#).unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(crate::error::PipelineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn cli_argument_wins() {
        assert_eq!(config_path(Some("x.json".into())), PathBuf::from("x.json"));
    }
}
