use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::helper_functions::quantile_sorted;

/// How the proportion of true nulls is estimated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Pi0Estimator {
    /// Single tuning value: pi0 = #{p > lambda} / (m (1 - lambda)).
    Fixed { lambda: f64 },
    /// Bootstrap choice of lambda over 0, 0.05, ..., 0.90.
    Bootstrap {
        #[serde(default = "default_seed")]
        seed: u64,
        #[serde(default = "default_resamples")]
        resamples: usize,
    },
}

fn default_seed() -> u64 {
    42
}

fn default_resamples() -> usize {
    100
}

impl Default for Pi0Estimator {
    fn default() -> Self {
        Pi0Estimator::Fixed { lambda: 0.5 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QValueParams {
    pub pi0: Pi0Estimator,
}

// Counts p > lambda (Storey uses >=) with a floor of one, so pi0 never hits zero.
fn pi0_at(p_values: &[f64], lambda: f64) -> f64 {
    let m = p_values.len() as f64;
    let above = p_values.iter().filter(|&&p| p > lambda).count().max(1) as f64;
    (above / (m * (1.0 - lambda))).min(1.0)
}

/// 0, 0.05, ..., 0.90 rather than the usual 0.05..0.95.
fn lambda_grid() -> Vec<f64> {
    (0..19).map(|i| i as f64 * 0.05).collect()
}

/// Estimated proportion of true nulls, always in (0, 1].
pub fn estimate_pi0(p_values: &[f64], estimator: &Pi0Estimator) -> f64 {
    if p_values.is_empty() {
        return 1.0;
    }
    match estimator {
        Pi0Estimator::Fixed { lambda } => {
            if !(0.0..1.0).contains(lambda) {
                return 1.0;
            }
            pi0_at(p_values, *lambda)
        }
        Pi0Estimator::Bootstrap { seed, resamples } => {
            let grid = lambda_grid();
            let estimates: Vec<f64> = grid.iter().map(|&l| pi0_at(p_values, l)).collect();
            let mut sorted = estimates.clone();
            sorted.sort_by(f64::total_cmp);
            let floor = quantile_sorted(&sorted, 0.1).unwrap_or(1.0);

            let mut rng = StdRng::seed_from_u64(*seed);
            let mut mse = vec![0.0; grid.len()];
            let mut sample = vec![0.0; p_values.len()];
            for _ in 0..(*resamples).max(1) {
                for slot in sample.iter_mut() {
                    *slot = p_values[rng.gen_range(0..p_values.len())];
                }
                for (k, &l) in grid.iter().enumerate() {
                    let d = pi0_at(&sample, l) - floor;
                    mse[k] += d * d;
                }
            }

            let best = mse
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(k, _)| k)
                .unwrap_or(0);
            debug!("Bootstrap pi0: lambda = {:.2}, pi0 = {:.3}", grid[best], estimates[best]);
            estimates[best]
        }
    }
}

/// q-values in input order. Non-finite p-values get NaN and are left out of m.
///
/// q is monotone in p, and never below p, so any item with q <= t also has
/// p <= t.
pub fn qvalues(p_values: &[f64], params: &QValueParams) -> Vec<f64> {
    let finite: Vec<usize> = (0..p_values.len()).filter(|&i| p_values[i].is_finite()).collect();
    let mut q = vec![f64::NAN; p_values.len()];
    if finite.is_empty() {
        return q;
    }

    let observed: Vec<f64> = finite.iter().map(|&i| p_values[i].clamp(0.0, 1.0)).collect();
    let pi0 = estimate_pi0(&observed, &params.pi0);
    let m = observed.len() as f64;

    let mut order: Vec<usize> = (0..observed.len()).collect();
    order.sort_by(|&a, &b| observed[a].total_cmp(&observed[b]));

    let mut running = 1.0f64;
    for (rank0, &k) in order.iter().enumerate().rev() {
        let p = observed[k];
        running = running.min(p * m / (rank0 + 1) as f64);
        q[finite[k]] = (pi0 * running).max(p).min(1.0);
    }
    debug!("q-values for {} tests, pi0 = {:.3}", finite.len(), pi0);
    q
}
