use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregation::AlleleTable;
use crate::analysis::qvalue::{qvalues, QValueParams};
use crate::analysis::rank_tests::{Alternative, PValueMethod, RankSumTest, RankTestParams};
use crate::error::{PipelineError, PipelineResult, PipelineWarning};
use crate::helper_functions::median;
use crate::models::AlleleType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DifferentialParams {
    /// Minimum observations in each of the Ref and Mut groups.
    pub min_observations: usize,
    /// MFV when q is strictly below this.
    pub q_threshold: f64,
}

impl Default for DifferentialParams {
    fn default() -> Self {
        Self {
            min_observations: 1,
            q_threshold: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DifferentialCall {
    pub condition: String,
    pub construct_id: String,
    /// Comma-joined when a construct carries several alleles of one type.
    pub ref_alleles: String,
    pub mut_alleles: String,
    pub ref_observations: usize,
    pub mut_observations: usize,
    pub ref_median: f64,
    pub mut_median: f64,
    /// median(Mut) - median(Ref), log2 units.
    pub fold_change: f64,
    pub u_statistic: f64,
    pub p_value: f64,
    pub q_value: f64,
    pub method: PValueMethod,
    pub is_mfv: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExclusionReason {
    SingleType,
    UnexpectedTypes,
    TooFewObservations,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExclusionReason::SingleType => "only one allele type observed",
            ExclusionReason::UnexpectedTypes => "allele types other than Ref/Mut",
            ExclusionReason::TooFewObservations => "too few Ref or Mut observations",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct DifferentialCalls {
    pub condition: String,
    pub calls: Vec<DifferentialCall>,
    pub excluded: Vec<(String, ExclusionReason)>,
    pub warnings: Vec<PipelineWarning>,
}

impl DifferentialCalls {
    pub fn mfvs(&self) -> impl Iterator<Item = &DifferentialCall> {
        self.calls.iter().filter(|c| c.is_mfv)
    }
}

/// Ref and Mut observations of one construct, ready for testing.
struct ConstructGroups<'a> {
    construct_id: &'a str,
    ref_alleles: Vec<&'a str>,
    mut_alleles: Vec<&'a str>,
    reference: Vec<f64>,
    mutant: Vec<f64>,
}

pub struct DifferentialTester {
    params: DifferentialParams,
    qvalue: QValueParams,
    rank_test: RankSumTest,
}

impl DifferentialTester {
    pub fn new(params: DifferentialParams, rank_params: RankTestParams, qvalue: QValueParams) -> Self {
        Self {
            params,
            qvalue,
            rank_test: RankSumTest::new(rank_params),
        }
    }

    fn group<'a>(&self, alleles: &'a AlleleTable, construct_id: &'a str, members: &[usize], condition: &str) -> Result<ConstructGroups<'a>, ExclusionReason> {
        let mut groups = ConstructGroups {
            construct_id,
            ref_alleles: Vec::new(),
            mut_alleles: Vec::new(),
            reference: Vec::new(),
            mutant: Vec::new(),
        };
        let mut types = BTreeSet::new();
        for &i in members {
            let allele = &alleles.alleles[i];
            let values = allele.observations(condition);
            if values.is_empty() {
                continue;
            }
            types.insert(&allele.allele_type);
            match allele.allele_type {
                AlleleType::Ref => {
                    groups.ref_alleles.push(&allele.allele_id);
                    groups.reference.extend_from_slice(values);
                }
                AlleleType::Mut => {
                    groups.mut_alleles.push(&allele.allele_id);
                    groups.mutant.extend_from_slice(values);
                }
                AlleleType::Other(_) => {}
            }
        }

        match types.len() {
            0 | 1 => return Err(ExclusionReason::SingleType),
            2 if !groups.ref_alleles.is_empty() && !groups.mut_alleles.is_empty() => {}
            _ => return Err(ExclusionReason::UnexpectedTypes),
        }
        if groups.reference.len() < self.params.min_observations || groups.mutant.len() < self.params.min_observations {
            return Err(ExclusionReason::TooFewObservations);
        }
        Ok(groups)
    }

    /// Two-sided rank-sum test of Mut against Ref for every construct whose
    /// observed allele types are exactly Ref and Mut.
    pub fn test(&self, alleles: &AlleleTable, condition: &str) -> PipelineResult<DifferentialCalls> {
        if !alleles.conditions.iter().any(|c| c == condition) {
            return Err(PipelineError::Layout(format!("no ratios for condition `{condition}`")));
        }

        let mut testable = Vec::new();
        let mut excluded = Vec::new();
        for (construct_id, members) in alleles.constructs() {
            match self.group(alleles, construct_id, &members, condition) {
                Ok(groups) => testable.push(groups),
                Err(reason) => {
                    debug!("[differential/{}] {} excluded: {}", condition, construct_id, reason);
                    excluded.push((construct_id.to_string(), reason));
                }
            }
        }

        let outcomes: Vec<_> = testable
            .par_iter()
            .map(|g| self.rank_test.compare(&g.mutant, &g.reference, Alternative::TwoSided))
            .collect();
        let p_values: Vec<f64> = outcomes.iter().map(|o| o.p_value).collect();
        let q_values = qvalues(&p_values, &self.qvalue);

        let mut warnings = Vec::new();
        let mut calls = Vec::with_capacity(testable.len());
        for ((groups, outcome), q) in testable.iter().zip(&outcomes).zip(q_values) {
            if outcome.is_degenerate() {
                let w = PipelineWarning::NumericDegeneracy {
                    stage: "differential",
                    condition: condition.to_string(),
                    id: groups.construct_id.to_string(),
                };
                warn!("{}", w);
                warnings.push(w);
            }
            let ref_median = median(&groups.reference).unwrap_or(f64::NAN);
            let mut_median = median(&groups.mutant).unwrap_or(f64::NAN);
            calls.push(DifferentialCall {
                condition: condition.to_string(),
                construct_id: groups.construct_id.to_string(),
                ref_alleles: groups.ref_alleles.join(","),
                mut_alleles: groups.mut_alleles.join(","),
                ref_observations: groups.reference.len(),
                mut_observations: groups.mutant.len(),
                ref_median,
                mut_median,
                fold_change: mut_median - ref_median,
                u_statistic: outcome.u_statistic,
                p_value: outcome.p_value,
                q_value: q,
                method: outcome.method,
                is_mfv: q < self.params.q_threshold,
            });
        }

        let mut by_reason: BTreeMap<ExclusionReason, Vec<String>> = BTreeMap::new();
        for (id, reason) in &excluded {
            by_reason.entry(*reason).or_default().push(id.clone());
        }
        for (reason, ids) in by_reason {
            let w = PipelineWarning::InsufficientData {
                stage: "differential",
                condition: condition.to_string(),
                excluded: ids,
                reason: reason.to_string(),
            };
            warn!("{}", w);
            warnings.push(w);
        }

        info!(
            "[{}] {} constructs tested Ref vs Mut, {} MFVs (q < {}), {} excluded",
            condition,
            calls.len(),
            calls.iter().filter(|c| c.is_mfv).count(),
            self.params.q_threshold,
            excluded.len()
        );

        Ok(DifferentialCalls {
            condition: condition.to_string(),
            calls,
            excluded,
            warnings,
        })
    }
}

/// Constructs that are an MFV in at least one condition.
pub fn functional_variants(per_condition: &[DifferentialCalls]) -> BTreeSet<String> {
    per_condition
        .iter()
        .flat_map(|calls| calls.mfvs().map(|c| c.construct_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::tests::record;

    fn tester() -> DifferentialTester {
        DifferentialTester::new(DifferentialParams::default(), RankTestParams::default(), QValueParams::default())
    }

    fn table(condition: &str) -> AlleleTable {
        AlleleTable {
            conditions: vec![condition.into()],
            alleles: vec![
                record("c1", "c1_A", AlleleType::Ref, condition, &[2.0, 2.0, 2.0, 2.0]),
                record("c1", "c1_G", AlleleType::Mut, condition, &[6.0, 6.0, 6.0, 6.0]),
                record("c2", "c2_C", AlleleType::Ref, condition, &[1.0, 2.0, 3.0]),
            ],
        }
    }

    #[test]
    fn separated_alleles_give_signed_fold_change() {
        let calls = tester().test(&table("CTRL"), "CTRL").unwrap();
        assert_eq!(calls.calls.len(), 1);
        let call = &calls.calls[0];
        assert_eq!(call.construct_id, "c1");
        assert_eq!(call.fold_change, 4.0);
        assert!(call.p_value < 0.01);
        assert!(call.is_mfv);
        assert_eq!(call.ref_alleles, "c1_A");
    }

    #[test]
    fn ref_only_construct_is_excluded() {
        let calls = tester().test(&table("CTRL"), "CTRL").unwrap();
        assert!(calls.calls.iter().all(|c| c.construct_id != "c2"));
        assert_eq!(calls.excluded, vec![("c2".to_string(), ExclusionReason::SingleType)]);
        assert!(matches!(
            calls.warnings.as_slice(),
            [PipelineWarning::InsufficientData { stage: "differential", .. }]
        ));
    }

    #[test]
    fn extra_allele_types_are_excluded() {
        let mut alleles = table("CTRL");
        alleles
            .alleles
            .push(record("c1", "c1_X", AlleleType::Other("Ctrl".into()), "CTRL", &[0.0]));
        let calls = tester().test(&alleles, "CTRL").unwrap();
        assert!(calls.calls.is_empty());
        assert!(calls.excluded.contains(&("c1".to_string(), ExclusionReason::UnexpectedTypes)));
    }

    #[test]
    fn identical_groups_get_p_one_and_a_warning() {
        let mut alleles = table("CTRL");
        alleles.alleles.push(record("c4", "c4_A", AlleleType::Ref, "CTRL", &[1.0, 1.0, 1.0]));
        alleles.alleles.push(record("c4", "c4_T", AlleleType::Mut, "CTRL", &[1.0, 1.0, 1.0]));
        let calls = tester().test(&alleles, "CTRL").unwrap();

        let flat = calls.calls.iter().find(|c| c.construct_id == "c4").unwrap();
        assert_eq!(flat.p_value, 1.0);
        assert_eq!(flat.method, PValueMethod::Degenerate);
        assert_eq!(flat.fold_change, 0.0);
        assert!(!flat.is_mfv);
        assert!(calls.warnings.iter().any(|w| matches!(
            w,
            PipelineWarning::NumericDegeneracy { stage: "differential", id, .. } if id == "c4"
        )));
    }

    #[test]
    fn minimum_observations_per_group() {
        let tester = DifferentialTester::new(
            DifferentialParams {
                min_observations: 5,
                ..DifferentialParams::default()
            },
            RankTestParams::default(),
            QValueParams::default(),
        );
        let calls = tester.test(&table("CTRL"), "CTRL").unwrap();
        assert!(calls.calls.is_empty());
        assert!(calls.excluded.contains(&("c1".to_string(), ExclusionReason::TooFewObservations)));
    }

    #[test]
    fn functional_variants_union_conditions() {
        let tester = tester();
        let ctrl = tester.test(&table("CTRL"), "CTRL").unwrap();

        let mut quiet = table("GATA1");
        quiet.alleles.push(record("c3", "c3_A", AlleleType::Ref, "GATA1", &[1.0, 2.0]));
        quiet.alleles.push(record("c3", "c3_G", AlleleType::Mut, "GATA1", &[1.5, 2.5]));
        let gata1 = tester.test(&quiet, "GATA1").unwrap();
        assert_eq!(gata1.calls.len(), 2);
        assert!(!gata1.calls[1].is_mfv);

        let variants = functional_variants(&[ctrl, gata1]);
        assert_eq!(variants.into_iter().collect::<Vec<_>>(), vec!["c1".to_string()]);
    }
}
