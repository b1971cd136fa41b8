use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::path::Path;

use polars::df;
use polars::prelude::*;
use serde::Serialize;
use tracing::{error, info};

use crate::aggregation::AlleleTable;
use crate::analysis::activity::ActivityCalls;
use crate::analysis::differential::DifferentialCalls;
use crate::analysis::reproducibility::ReplicateCorrelation;
use crate::data_handling::annotations::AnnotationMap;
use crate::error::{PipelineError, PipelineResult};
use crate::helper_functions::write_table;
use crate::models::AlleleType;
use crate::pipeline::PipelineOutput;

/// Optional lookups joined onto the differential table.
#[derive(Debug, Clone, Default)]
pub struct ReportAnnotations {
    /// Oligo id -> rsID.
    pub rsid: Option<AnnotationMap>,
    /// Construct id -> sentinel SNP.
    pub linkage: Option<AnnotationMap>,
}

pub fn activity_table(per_condition: &[ActivityCalls]) -> PolarsResult<DataFrame> {
    let calls: Vec<_> = per_condition.iter().flat_map(|c| c.calls.iter()).collect();
    df!(
        "condition" => calls.iter().map(|c| c.condition.clone()).collect::<Vec<_>>(),
        "allele_id" => calls.iter().map(|c| c.allele_id.clone()).collect::<Vec<_>>(),
        "construct_id" => calls.iter().map(|c| c.construct_id.clone()).collect::<Vec<_>>(),
        "allele_type" => calls.iter().map(|c| c.allele_type.to_string()).collect::<Vec<_>>(),
        "observations" => calls.iter().map(|c| c.observations as u32).collect::<Vec<_>>(),
        "activity" => calls.iter().map(|c| c.activity).collect::<Vec<_>>(),
        "u_statistic" => calls.iter().map(|c| c.u_statistic).collect::<Vec<_>>(),
        "p_value" => calls.iter().map(|c| c.p_value).collect::<Vec<_>>(),
        "q_value" => calls.iter().map(|c| c.q_value).collect::<Vec<_>>(),
        "p_method" => calls.iter().map(|c| c.method.to_string()).collect::<Vec<_>>(),
        "is_active" => calls.iter().map(|c| c.is_active).collect::<Vec<_>>()
    )
}

/// Ref-allele oligo per construct, used for the rsID join.
fn reference_oligos(alleles: &AlleleTable) -> HashMap<&str, &str> {
    let mut oligos = HashMap::new();
    for allele in &alleles.alleles {
        if allele.allele_type == AlleleType::Ref {
            oligos.entry(allele.construct_id.as_str()).or_insert(allele.oligo.as_str());
        }
    }
    oligos
}

pub fn differential_table(
    per_condition: &[DifferentialCalls],
    alleles: &AlleleTable,
    functional: &BTreeSet<String>,
    annotations: &ReportAnnotations,
) -> PolarsResult<DataFrame> {
    let calls: Vec<_> = per_condition.iter().flat_map(|c| c.calls.iter()).collect();
    let mut df = df!(
        "condition" => calls.iter().map(|c| c.condition.clone()).collect::<Vec<_>>(),
        "construct_id" => calls.iter().map(|c| c.construct_id.clone()).collect::<Vec<_>>(),
        "ref_alleles" => calls.iter().map(|c| c.ref_alleles.clone()).collect::<Vec<_>>(),
        "mut_alleles" => calls.iter().map(|c| c.mut_alleles.clone()).collect::<Vec<_>>(),
        "ref_observations" => calls.iter().map(|c| c.ref_observations as u32).collect::<Vec<_>>(),
        "mut_observations" => calls.iter().map(|c| c.mut_observations as u32).collect::<Vec<_>>(),
        "ref_median" => calls.iter().map(|c| c.ref_median).collect::<Vec<_>>(),
        "mut_median" => calls.iter().map(|c| c.mut_median).collect::<Vec<_>>(),
        "fold_change" => calls.iter().map(|c| c.fold_change).collect::<Vec<_>>(),
        "u_statistic" => calls.iter().map(|c| c.u_statistic).collect::<Vec<_>>(),
        "p_value" => calls.iter().map(|c| c.p_value).collect::<Vec<_>>(),
        "q_value" => calls.iter().map(|c| c.q_value).collect::<Vec<_>>(),
        "p_method" => calls.iter().map(|c| c.method.to_string()).collect::<Vec<_>>(),
        "is_mfv" => calls.iter().map(|c| c.is_mfv).collect::<Vec<_>>(),
        "is_functional" => calls.iter().map(|c| functional.contains(&c.construct_id)).collect::<Vec<_>>()
    )?;

    if let Some(rsid) = &annotations.rsid {
        let oligos = reference_oligos(alleles);
        let values: Vec<Option<String>> = calls
            .iter()
            .map(|c| {
                oligos
                    .get(c.construct_id.as_str())
                    .and_then(|oligo| rsid.get(*oligo))
                    .cloned()
            })
            .collect();
        df.with_column(Column::new("rsid".into(), values))?;
    }
    if let Some(linkage) = &annotations.linkage {
        let values: Vec<Option<String>> = calls
            .iter()
            .map(|c| linkage.get(&c.construct_id).cloned())
            .collect();
        df.with_column(Column::new("sentinel".into(), values))?;
    }
    Ok(df)
}

pub fn correlation_table(correlations: &[ReplicateCorrelation]) -> PolarsResult<DataFrame> {
    df!(
        "condition" => correlations.iter().map(|c| c.condition.clone()).collect::<Vec<_>>(),
        "replicate_a" => correlations.iter().map(|c| c.replicate_a.clone()).collect::<Vec<_>>(),
        "replicate_b" => correlations.iter().map(|c| c.replicate_b.clone()).collect::<Vec<_>>(),
        "alleles" => correlations.iter().map(|c| c.alleles as u32).collect::<Vec<_>>(),
        "pearson" => correlations.iter().map(|c| c.pearson).collect::<Vec<_>>()
    )
}

/// Every functional variant must resolve to a sentinel when linkage is given.
pub fn sentinel_loci(functional: &BTreeSet<String>, linkage: &AnnotationMap) -> PipelineResult<BTreeSet<String>> {
    let mut sentinels = BTreeSet::new();
    for construct in functional {
        match linkage.get(construct) {
            Some(sentinel) => {
                sentinels.insert(sentinel.clone());
            }
            None => {
                error!("Functional variant {} has no sentinel in the linkage table", construct);
                return Err(PipelineError::JoinMismatch(format!(
                    "functional variant `{construct}` is missing from the linkage table"
                )));
            }
        }
    }
    Ok(sentinels)
}

#[derive(Debug, Clone, Serialize)]
pub struct ConditionSummary {
    pub condition: String,
    /// RNA replicates left after channel exclusion.
    pub replicates: usize,
    pub alleles_tested: usize,
    pub alleles_untested: usize,
    pub active_alleles: usize,
    /// Constructs with at least one active allele.
    pub active_constructs: usize,
    /// Constructs with at least one tested allele.
    pub constructs_tested: usize,
    pub active_construct_percent: f64,
    pub differential_tested: usize,
    pub differential_excluded: usize,
    pub mfvs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub barcodes_total: usize,
    pub barcodes_retained: usize,
    pub retention_fraction: f64,
    pub conditions: Vec<ConditionSummary>,
    pub functional_variants: usize,
    pub sentinel_loci: Option<usize>,
    pub warnings: Vec<String>,
}

pub fn summarize(output: &PipelineOutput, annotations: &ReportAnnotations) -> PipelineResult<RunSummary> {
    let sentinel_loci = match &annotations.linkage {
        Some(linkage) => Some(sentinel_loci(&output.functional_variants, linkage)?.len()),
        None => None,
    };

    let mut conditions = Vec::with_capacity(output.activity.len());
    for activity in &output.activity {
        let tested: BTreeSet<&str> = activity.calls.iter().map(|c| c.construct_id.as_str()).collect();
        let active: BTreeSet<&str> = activity.active().map(|c| c.construct_id.as_str()).collect();
        let differential = output.differential.iter().find(|d| d.condition == activity.condition);
        conditions.push(ConditionSummary {
            condition: activity.condition.clone(),
            replicates: output
                .layout
                .condition(&activity.condition)
                .map_or(0, |c| c.rna_channels.len()),
            alleles_tested: activity.calls.len(),
            alleles_untested: activity.untested.len(),
            active_alleles: activity.active().count(),
            active_constructs: active.len(),
            constructs_tested: tested.len(),
            active_construct_percent: if tested.is_empty() {
                0.0
            } else {
                100.0 * active.len() as f64 / tested.len() as f64
            },
            differential_tested: differential.map_or(0, |d| d.calls.len()),
            differential_excluded: differential.map_or(0, |d| d.excluded.len()),
            mfvs: differential.map_or(0, |d| d.mfvs().count()),
        });
    }

    Ok(RunSummary {
        barcodes_total: output.retention.total,
        barcodes_retained: output.retention.retained,
        retention_fraction: output.retention.fraction(),
        conditions,
        functional_variants: output.functional_variants.len(),
        sentinel_loci,
        warnings: output.warnings.iter().map(|w| w.to_string()).collect(),
    })
}

/// Writes the call tables, the log CPM and allele activity tables, and `summary.json`.
pub fn write_reports(output: &PipelineOutput, annotations: &ReportAnnotations, out_dir: &Path) -> PipelineResult<RunSummary> {
    let summary = summarize(output, annotations)?;
    fs::create_dir_all(out_dir)?;

    let mut activity = activity_table(&output.activity)?;
    write_table(&mut activity, &out_dir.join("activity_calls.tsv"))?;

    let mut differential = differential_table(
        &output.differential,
        &output.alleles,
        &output.functional_variants,
        annotations,
    )?;
    write_table(&mut differential, &out_dir.join("differential_calls.tsv"))?;

    let mut log_table = output.log_table.clone();
    write_table(&mut log_table, &out_dir.join("log_cpm.tsv"))?;

    let mut alleles = output.alleles.to_dataframe()?;
    write_table(&mut alleles, &out_dir.join("allele_activity.tsv"))?;

    let mut correlations = correlation_table(&output.correlations)?;
    write_table(&mut correlations, &out_dir.join("replicate_correlations.tsv"))?;

    let file = File::create(out_dir.join("summary.json"))?;
    serde_json::to_writer_pretty(file, &summary)?;

    for condition in &summary.conditions {
        info!(
            "[{}] {}/{} constructs active ({:.1}%), {} MFVs",
            condition.condition,
            condition.active_constructs,
            condition.constructs_tested,
            condition.active_construct_percent,
            condition.mfvs
        );
    }
    info!(
        "Wrote reports to {} ({} functional variants)",
        out_dir.display(),
        summary.functional_variants
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::run_pipeline;
    use crate::pipeline::tests::synthetic_counts;

    fn output() -> PipelineOutput {
        run_pipeline(&synthetic_counts(), &PipelineConfig::default()).unwrap()
    }

    fn map(pairs: &[(&str, &str)]) -> AnnotationMap {
        AnnotationMap(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>())
    }

    #[test]
    fn differential_table_joins_annotations() {
        let output = output();
        let annotations = ReportAnnotations {
            rsid: Some(map(&[("o1", "rs100")])),
            linkage: Some(map(&[("c1", "rs1"), ("c2", "rs1")])),
        };
        let df = differential_table(&output.differential, &output.alleles, &output.functional_variants, &annotations).unwrap();
        assert_eq!(df.height(), 4);
        let rsid = df.column("rsid").unwrap().str().unwrap();
        assert_eq!(rsid.get(0), Some("rs100"));
        assert_eq!(rsid.get(1), None);
        let functional = df.column("is_functional").unwrap().bool().unwrap();
        assert_eq!(functional.get(0), Some(true));
        assert_eq!(functional.get(1), Some(false));
    }

    #[test]
    fn functional_variant_without_sentinel_is_fatal() {
        let output = output();
        let annotations = ReportAnnotations {
            rsid: None,
            linkage: Some(map(&[("c2", "rs1")])),
        };
        assert!(matches!(summarize(&output, &annotations), Err(PipelineError::JoinMismatch(_))));
    }

    #[test]
    fn summary_counts_active_constructs() {
        let output = output();
        let annotations = ReportAnnotations {
            rsid: None,
            linkage: Some(map(&[("c1", "rs1")])),
        };
        let summary = summarize(&output, &annotations).unwrap();
        assert_eq!(summary.functional_variants, 1);
        assert_eq!(summary.sentinel_loci, Some(1));
        let ctrl = &summary.conditions[0];
        assert_eq!(ctrl.replicates, 2);
        assert_eq!(ctrl.constructs_tested, 3);
        assert_eq!(ctrl.active_constructs, 1);
        assert!((ctrl.active_construct_percent - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(ctrl.mfvs, 1);
    }

    #[test]
    fn writes_every_report_file() {
        let dir = tempfile::tempdir().unwrap();
        let summary = write_reports(&output(), &ReportAnnotations::default(), dir.path()).unwrap();
        assert!(summary.sentinel_loci.is_none());
        for name in [
            "activity_calls.tsv",
            "differential_calls.tsv",
            "allele_activity.tsv",
            "log_cpm.tsv",
            "replicate_correlations.tsv",
            "summary.json",
        ] {
            assert!(dir.path().join(name).exists(), "{name}");
        }
    }
}
