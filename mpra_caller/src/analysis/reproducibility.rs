use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregation::{AlleleTable, ReplicateActivity};
use crate::helper_functions::{pearson_correlation, quantile_sorted};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReproducibilityParams {
    /// Only alleles at or above this activity quantile (per condition) enter
    /// the replicate correlations.
    pub activity_percentile: f64,
}

impl Default for ReproducibilityParams {
    fn default() -> Self {
        Self {
            activity_percentile: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicateCorrelation {
    pub condition: String,
    pub replicate_a: String,
    pub replicate_b: String,
    pub alleles: usize,
    pub pearson: Option<f64>,
}

/// Pearson correlation between every pair of replicate columns of a
/// condition, over alleles with activity above the percentile cut-off.
pub fn replicate_correlations(
    matrix: &ReplicateActivity,
    alleles: &AlleleTable,
    params: &ReproducibilityParams,
) -> Vec<ReplicateCorrelation> {
    let mut out = Vec::new();
    for condition in &alleles.conditions {
        let mut scores: Vec<f64> = alleles
            .alleles
            .iter()
            .filter_map(|a| a.activity.get(condition).copied())
            .filter(|v| v.is_finite())
            .collect();
        scores.sort_by(f64::total_cmp);
        let Some(cutoff) = quantile_sorted(&scores, params.activity_percentile.clamp(0.0, 1.0)) else {
            continue;
        };
        let selected: Vec<usize> = alleles
            .alleles
            .iter()
            .enumerate()
            .filter(|(_, a)| a.activity.get(condition).is_some_and(|&v| v >= cutoff))
            .map(|(i, _)| i)
            .collect();

        let columns: Vec<usize> = (0..matrix.channels.len())
            .filter(|&j| matrix.channels[j].condition == *condition)
            .collect();
        for (k, &a) in columns.iter().enumerate() {
            for &b in &columns[k + 1..] {
                let (x, y): (Vec<f64>, Vec<f64>) = selected
                    .iter()
                    .map(|&i| (matrix.values[[i, a]], matrix.values[[i, b]]))
                    .filter(|(x, y)| x.is_finite() && y.is_finite())
                    .unzip();
                let pearson = pearson_correlation(&x, &y);
                info!(
                    "[{}] replicate {} vs {}: r = {} over {} alleles",
                    condition,
                    matrix.channels[a].replicate,
                    matrix.channels[b].replicate,
                    pearson.map_or("NA".to_string(), |r| format!("{r:.3}")),
                    x.len()
                );
                out.push(ReplicateCorrelation {
                    condition: condition.clone(),
                    replicate_a: matrix.channels[a].replicate.clone(),
                    replicate_b: matrix.channels[b].replicate.clone(),
                    alleles: x.len(),
                    pearson,
                });
            }
        }
    }
    out
}
