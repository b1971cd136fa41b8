use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregation::AlleleTable;
use crate::analysis::qvalue::{qvalues, QValueParams};
use crate::analysis::rank_tests::{Alternative, PValueMethod, PooledRanks, RankSumTest, RankTestParams};
use crate::error::{PipelineError, PipelineResult, PipelineWarning};
use crate::models::AlleleType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityParams {
    /// Alleles with fewer barcode x replicate observations are not tested.
    pub min_observations: usize,
    /// Active when q <= this.
    pub q_threshold: f64,
}

impl Default for ActivityParams {
    fn default() -> Self {
        Self {
            min_observations: 7,
            q_threshold: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityCall {
    pub condition: String,
    pub allele_id: String,
    pub construct_id: String,
    pub allele_type: AlleleType,
    pub observations: usize,
    pub activity: f64,
    pub u_statistic: f64,
    pub p_value: f64,
    pub q_value: f64,
    pub method: PValueMethod,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct ActivityCalls {
    pub condition: String,
    pub calls: Vec<ActivityCall>,
    /// Alleles below the observation minimum.
    pub untested: Vec<String>,
    pub warnings: Vec<PipelineWarning>,
}

impl ActivityCalls {
    pub fn active(&self) -> impl Iterator<Item = &ActivityCall> {
        self.calls.iter().filter(|c| c.is_active)
    }
}

pub struct ActivityTester {
    params: ActivityParams,
    qvalue: QValueParams,
    rank_test: RankSumTest,
}

impl ActivityTester {
    pub fn new(params: ActivityParams, rank_params: RankTestParams, qvalue: QValueParams) -> Self {
        Self {
            params,
            qvalue,
            rank_test: RankSumTest::new(rank_params),
        }
    }

    /// One-sided rank-sum test of every allele against the pooled
    /// observations of all other alleles, then q-values over the tested set.
    pub fn test(&self, alleles: &AlleleTable, condition: &str) -> PipelineResult<ActivityCalls> {
        if !alleles.conditions.iter().any(|c| c == condition) {
            return Err(PipelineError::Layout(format!("no ratios for condition `{condition}`")));
        }

        // one pool per condition; allele i owns pooled[offsets[i]..offsets[i+1]]
        let mut pooled = Vec::new();
        let mut offsets = Vec::with_capacity(alleles.alleles.len() + 1);
        offsets.push(0);
        for allele in &alleles.alleles {
            pooled.extend_from_slice(allele.observations(condition));
            offsets.push(pooled.len());
        }
        let ranks = PooledRanks::new(&pooled);
        let total = ranks.pool_size();

        let (eligible, untested): (Vec<usize>, Vec<usize>) = (0..alleles.alleles.len())
            .partition(|&i| offsets[i + 1] - offsets[i] >= self.params.min_observations);

        let outcomes: Vec<_> = eligible
            .par_iter()
            .map(|&i| {
                let n = offsets[i + 1] - offsets[i];
                let rank_sum = ranks.rank_sum(offsets[i]..offsets[i + 1]);
                self.rank_test
                    .from_rank_sum(rank_sum, n, total - n, ranks.ties(), Alternative::Greater)
            })
            .collect();

        let p_values: Vec<f64> = outcomes.iter().map(|o| o.p_value).collect();
        let q_values = qvalues(&p_values, &self.qvalue);

        let mut warnings = Vec::new();
        let mut calls = Vec::with_capacity(eligible.len());
        for ((&i, outcome), q) in eligible.iter().zip(&outcomes).zip(q_values) {
            let allele = &alleles.alleles[i];
            if outcome.is_degenerate() {
                let w = PipelineWarning::NumericDegeneracy {
                    stage: "activity",
                    condition: condition.to_string(),
                    id: allele.allele_id.clone(),
                };
                warn!("{}", w);
                warnings.push(w);
            }
            calls.push(ActivityCall {
                condition: condition.to_string(),
                allele_id: allele.allele_id.clone(),
                construct_id: allele.construct_id.clone(),
                allele_type: allele.allele_type.clone(),
                observations: offsets[i + 1] - offsets[i],
                activity: allele.activity.get(condition).copied().unwrap_or(f64::NAN),
                u_statistic: outcome.u_statistic,
                p_value: outcome.p_value,
                q_value: q,
                method: outcome.method,
                is_active: q <= self.params.q_threshold,
            });
        }

        let untested: Vec<String> = untested
            .into_iter()
            .map(|i| alleles.alleles[i].allele_id.clone())
            .collect();
        for id in &untested {
            debug!("[activity/{}] {} has too few observations", condition, id);
        }
        if !untested.is_empty() {
            let w = PipelineWarning::InsufficientData {
                stage: "activity",
                condition: condition.to_string(),
                excluded: untested.clone(),
                reason: format!("fewer than {} observations", self.params.min_observations),
            };
            warn!("{}", w);
            warnings.push(w);
        }

        let active = calls.iter().filter(|c| c.is_active).count();
        info!(
            "[{}] {} alleles tested for activity, {} active (q <= {}), {} untested",
            condition,
            calls.len(),
            active,
            self.params.q_threshold,
            untested.len()
        );

        Ok(ActivityCalls {
            condition: condition.to_string(),
            calls,
            untested,
            warnings,
        })
    }
}
