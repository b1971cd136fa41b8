use std::collections::BTreeSet;

use polars::prelude::*;
use tracing::{info, warn};

use crate::aggregation::{aggregate, replicate_activity, AlleleTable};
use crate::analysis::activity::{ActivityCalls, ActivityTester};
use crate::analysis::differential::{functional_variants, DifferentialCalls, DifferentialTester};
use crate::analysis::reproducibility::{replicate_correlations, ReplicateCorrelation};
use crate::config::PipelineConfig;
use crate::count_filter::{filter_counts, RetentionReport};
use crate::data_handling::count_table::{validate_counts, validate_metadata};
use crate::error::{PipelineResult, PipelineWarning};
use crate::layout::AssayLayout;
use crate::normalization::normalize;

/// Everything a run produces. Either all of it exists or the run failed.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub layout: AssayLayout,
    pub retention: RetentionReport,
    /// Retained barcodes with CPM and log2 CPM per channel.
    pub log_table: DataFrame,
    pub alleles: AlleleTable,
    pub activity: Vec<ActivityCalls>,
    pub differential: Vec<DifferentialCalls>,
    pub functional_variants: BTreeSet<String>,
    pub correlations: Vec<ReplicateCorrelation>,
    pub warnings: Vec<PipelineWarning>,
}

pub fn run_pipeline(raw: &DataFrame, config: &PipelineConfig) -> PipelineResult<PipelineOutput> {
    validate_metadata(raw, &config.columns)?;
    let header: Vec<&str> = raw.get_column_names().iter().map(|c| c.as_str()).collect();
    let layout = config.layout.resolve(&header)?;
    validate_counts(raw, &layout.count_channels())?;

    let filtered = filter_counts(raw, &config.columns.clean, &layout, &config.filter)?;
    let normalized = normalize(
        &filtered,
        &layout,
        &config.columns,
        &config.filter,
        &config.normalization,
    )?;
    let mut warnings = normalized.warnings.clone();

    let alleles = aggregate(&normalized.ratios)?;
    let matrix = replicate_activity(&normalized.ratios, &alleles);
    let correlations = replicate_correlations(&matrix, &alleles, &config.reproducibility);

    let activity_tester = ActivityTester::new(
        config.activity.clone(),
        config.rank_test.clone(),
        config.qvalue.clone(),
    );
    let differential_tester = DifferentialTester::new(
        config.differential.clone(),
        config.rank_test.clone(),
        config.qvalue.clone(),
    );

    let mut activity = Vec::with_capacity(alleles.conditions.len());
    let mut differential = Vec::with_capacity(alleles.conditions.len());
    for condition in &alleles.conditions {
        let calls = activity_tester.test(&alleles, condition)?;
        warnings.extend(calls.warnings.iter().cloned());
        activity.push(calls);

        let calls = differential_tester.test(&alleles, condition)?;
        warnings.extend(calls.warnings.iter().cloned());
        differential.push(calls);
    }

    let functional = functional_variants(&differential);
    info!(
        "{} functional variant(s) across {} condition(s)",
        functional.len(),
        alleles.conditions.len()
    );
    if !warnings.is_empty() {
        warn!("Run finished with {} warning(s)", warnings.len());
    }

    Ok(PipelineOutput {
        layout: normalized.layout,
        retention: normalized.retention,
        log_table: normalized.log_table,
        alleles,
        activity,
        differential,
        functional_variants: functional,
        correlations,
        warnings,
    })
}
