use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alternative {
    /// First sample tends to be larger.
    Greater,
    Less,
    TwoSided,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankTestParams {
    /// Apply the 0.5 continuity correction in the normal approximation.
    pub continuity_correction: bool,
    /// Both samples smaller than this and no ties -> exact p-value.
    pub exact_below: usize,
}

impl Default for RankTestParams {
    fn default() -> Self {
        Self {
            continuity_correction: false,
            exact_below: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PValueMethod {
    Exact,
    Normal,
    /// No variance in the pooled ranks or an empty sample; p is 1.
    Degenerate,
}

impl fmt::Display for PValueMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PValueMethod::Exact => "exact",
            PValueMethod::Normal => "normal",
            PValueMethod::Degenerate => "degenerate",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankSumOutcome {
    /// U of the first sample: its rank sum minus n(n+1)/2.
    pub u_statistic: f64,
    pub p_value: f64,
    pub method: PValueMethod,
}

impl RankSumOutcome {
    pub fn is_degenerate(&self) -> bool {
        self.method == PValueMethod::Degenerate
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TieSummary {
    /// Sum of t^3 - t over tie groups.
    pub tie_sum: f64,
    pub has_ties: bool,
    pub distinct: usize,
}

/// Mid-ranks of a pooled sample, kept in input order.
#[derive(Debug, Clone)]
pub struct PooledRanks {
    ranks: Vec<f64>,
    ties: TieSummary,
}

impl PooledRanks {
    pub fn new(values: &[f64]) -> Self {
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

        let mut ranks = vec![0.0; values.len()];
        let mut tie_sum = 0.0;
        let mut distinct = 0;
        let mut i = 0;
        while i < order.len() {
            let mut j = i + 1;
            while j < order.len() && values[order[j]] == values[order[i]] {
                j += 1;
            }
            // positions i..j share ranks i+1..=j
            let mid = (i + 1 + j) as f64 / 2.0;
            for &idx in &order[i..j] {
                ranks[idx] = mid;
            }
            let t = (j - i) as f64;
            tie_sum += t * t * t - t;
            distinct += 1;
            i = j;
        }

        Self {
            ranks,
            ties: TieSummary {
                tie_sum,
                has_ties: tie_sum > 0.0,
                distinct,
            },
        }
    }

    #[cfg(test)]
    pub fn ranks(&self) -> &[f64] {
        &self.ranks
    }

    pub fn rank_sum(&self, range: Range<usize>) -> f64 {
        self.ranks[range].iter().sum()
    }

    pub fn ties(&self) -> &TieSummary {
        &self.ties
    }

    pub fn pool_size(&self) -> usize {
        self.ranks.len()
    }
}

/// Rank-sum tester. Exact null distributions are cached per sample-size pair,
/// so one instance can be shared across threads for a whole condition.
pub struct RankSumTest {
    params: RankTestParams,
    exact_cache: Mutex<HashMap<(usize, usize), Arc<Vec<f64>>>>,
    normal: Normal,
}

impl RankSumTest {
    pub fn new(params: RankTestParams) -> Self {
        Self {
            params,
            exact_cache: Mutex::new(HashMap::new()),
            normal: Normal::standard(),
        }
    }

    /// Tests `x` against `y`.
    pub fn compare(&self, x: &[f64], y: &[f64], alternative: Alternative) -> RankSumOutcome {
        let pooled: Vec<f64> = x.iter().chain(y).copied().collect();
        let ranks = PooledRanks::new(&pooled);
        self.from_rank_sum(ranks.rank_sum(0..x.len()), x.len(), y.len(), ranks.ties(), alternative)
    }

    /// Test from a precomputed rank sum of the first sample within a pool of
    /// `n_x + n_y` values.
    pub fn from_rank_sum(
        &self,
        rank_sum: f64,
        n_x: usize,
        n_y: usize,
        ties: &TieSummary,
        alternative: Alternative,
    ) -> RankSumOutcome {
        let nx = n_x as f64;
        let ny = n_y as f64;
        let u = rank_sum - nx * (nx + 1.0) / 2.0;

        if n_x == 0 || n_y == 0 || ties.distinct < 2 {
            return degenerate(u);
        }

        if !ties.has_ties && n_x < self.params.exact_below && n_y < self.params.exact_below {
            let cdf = self.exact_cdf(n_x, n_y);
            let p = exact_p_value(&cdf, u.round() as usize, n_x * n_y, alternative);
            return RankSumOutcome {
                u_statistic: u,
                p_value: p,
                method: PValueMethod::Exact,
            };
        }

        let n = nx + ny;
        let variance = nx * ny / 12.0 * ((n + 1.0) - ties.tie_sum / (n * (n - 1.0)));
        if variance.is_nan() || variance <= 0.0 {
            return degenerate(u);
        }

        let centred = u - nx * ny / 2.0;
        let correction = if self.params.continuity_correction {
            match alternative {
                Alternative::Greater => 0.5,
                Alternative::Less => -0.5,
                Alternative::TwoSided if centred == 0.0 => 0.0,
                Alternative::TwoSided => 0.5 * centred.signum(),
            }
        } else {
            0.0
        };
        let z = (centred - correction) / variance.sqrt();
        let p = match alternative {
            Alternative::Greater => self.normal.sf(z),
            Alternative::Less => self.normal.cdf(z),
            Alternative::TwoSided => (2.0 * self.normal.cdf(z).min(self.normal.sf(z))).min(1.0),
        };

        RankSumOutcome {
            u_statistic: u,
            p_value: p,
            method: PValueMethod::Normal,
        }
    }

    fn exact_cdf(&self, n_x: usize, n_y: usize) -> Arc<Vec<f64>> {
        let key = (n_x, n_y);
        if let Ok(cache) = self.exact_cache.lock() {
            if let Some(cdf) = cache.get(&key) {
                return Arc::clone(cdf);
            }
        }
        let cdf = Arc::new(exact_u_cdf(n_x, n_y));
        if let Ok(mut cache) = self.exact_cache.lock() {
            cache.insert(key, Arc::clone(&cdf));
        }
        cdf
    }
}

fn degenerate(u: f64) -> RankSumOutcome {
    RankSumOutcome {
        u_statistic: u,
        p_value: 1.0,
        method: PValueMethod::Degenerate,
    }
}

/// Null CDF of U for sample sizes `m` and `n`: entry `u` is P(U <= u).
pub fn exact_u_cdf(m: usize, n: usize) -> Vec<f64> {
    let max_u = m * n;
    // counts[k][u]: ways to place k x-values among the first r pooled
    // positions with u (y < x) pairs so far
    let mut counts = vec![vec![0.0f64; max_u + 1]; m + 1];
    counts[0][0] = 1.0;
    for r in 1..=(m + n) {
        for k in (1..=m.min(r)).rev() {
            let below = r - k;
            if below > n {
                continue;
            }
            for u in (below..=max_u).rev() {
                let add = counts[k - 1][u - below];
                counts[k][u] += add;
            }
        }
    }

    let total: f64 = counts[m].iter().sum();
    let mut running = 0.0;
    counts[m]
        .iter()
        .map(|c| {
            running += c / total;
            running.min(1.0)
        })
        .collect()
}

fn exact_p_value(cdf: &[f64], u: usize, max_u: usize, alternative: Alternative) -> f64 {
    let u = u.min(max_u);
    let lower = cdf[u];
    // the null is symmetric, so P(U >= u) = P(U <= max_u - u)
    let upper = cdf[max_u - u];
    match alternative {
        Alternative::Greater => upper,
        Alternative::Less => lower,
        Alternative::TwoSided => {
            let tail = if 2 * u > max_u { upper } else { lower };
            (2.0 * tail).min(1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn mid_ranks_and_tie_sum() {
        let ranks = PooledRanks::new(&[3.0, 1.0, 3.0, 2.0]);
        assert_eq!(ranks.ranks(), &[3.5, 1.0, 3.5, 2.0]);
        assert_eq!(ranks.ties().tie_sum, 6.0);
        assert_eq!(ranks.ties().distinct, 3);
        assert_eq!(ranks.rank_sum(0..2), 4.5);
    }

    #[test]
    fn tied_blocks_use_normal_approximation() {
        let test = RankSumTest::new(RankTestParams::default());
        let outcome = test.compare(&[6.0; 4], &[2.0; 4], Alternative::TwoSided);
        assert_eq!(outcome.method, PValueMethod::Normal);
        assert_eq!(outcome.u_statistic, 16.0);
        assert!(close(outcome.p_value, 0.008151, 1e-5), "{}", outcome.p_value);
        assert!(outcome.p_value < 0.01);
    }

    #[test]
    fn continuity_correction_is_optional() {
        let test = RankSumTest::new(RankTestParams {
            continuity_correction: true,
            ..RankTestParams::default()
        });
        let outcome = test.compare(&[6.0; 4], &[2.0; 4], Alternative::TwoSided);
        assert!(close(outcome.p_value, 0.01312, 1e-4), "{}", outcome.p_value);
    }

    #[test]
    fn exact_p_for_separated_samples() {
        let test = RankSumTest::new(RankTestParams::default());
        let less = test.compare(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0], Alternative::Less);
        assert_eq!(less.method, PValueMethod::Exact);
        assert_eq!(less.u_statistic, 0.0);
        assert!(close(less.p_value, 0.05, 1e-12));

        let greater = test.compare(&[4.0, 5.0, 6.0], &[1.0, 2.0, 3.0], Alternative::Greater);
        assert!(close(greater.p_value, 0.05, 1e-12));

        let two_sided = test.compare(&[4.0, 5.0, 6.0], &[1.0, 2.0, 3.0], Alternative::TwoSided);
        assert!(close(two_sided.p_value, 0.1, 1e-12));
    }

    #[test]
    fn exact_cdf_is_a_symmetric_distribution() {
        let cdf = exact_u_cdf(4, 6);
        assert_eq!(cdf.len(), 25);
        assert!(close(cdf[24], 1.0, 1e-12));
        // C(10,4) = 210 arrangements, one with U = 0
        assert!(close(cdf[0], 1.0 / 210.0, 1e-12));
        let pmf = |u: usize| if u == 0 { cdf[0] } else { cdf[u] - cdf[u - 1] };
        for u in 0..=24 {
            assert!(close(pmf(u), pmf(24 - u), 1e-12));
        }
    }

    #[test]
    fn constant_pool_is_degenerate() {
        let test = RankSumTest::new(RankTestParams::default());
        let outcome = test.compare(&[1.0, 1.0, 1.0], &[1.0, 1.0], Alternative::Greater);
        assert!(outcome.is_degenerate());
        assert_eq!(outcome.p_value, 1.0);

        let empty = test.compare(&[], &[1.0, 2.0], Alternative::TwoSided);
        assert!(empty.is_degenerate());
    }

    #[test]
    fn large_samples_use_normal_approximation() {
        let test = RankSumTest::new(RankTestParams::default());
        let x: Vec<f64> = (0..60).map(|i| i as f64 + 30.5).collect();
        let y: Vec<f64> = (0..60).map(|i| i as f64).collect();
        let outcome = test.compare(&x, &y, Alternative::Greater);
        assert_eq!(outcome.method, PValueMethod::Normal);
        assert!(outcome.p_value < 1e-4);
        let reverse = test.compare(&x, &y, Alternative::Less);
        assert!(reverse.p_value > 0.99);
    }

    #[test]
    fn exact_and_normal_roughly_agree_at_moderate_size() {
        let x: Vec<f64> = (0..20).map(|i| (i * 3) as f64 + 0.5).collect();
        let y: Vec<f64> = (0..20).map(|i| (i * 2) as f64).collect();
        let exact = RankSumTest::new(RankTestParams::default()).compare(&x, &y, Alternative::TwoSided);
        let normal = RankSumTest::new(RankTestParams {
            exact_below: 0,
            ..RankTestParams::default()
        })
        .compare(&x, &y, Alternative::TwoSided);
        assert_eq!(exact.method, PValueMethod::Exact);
        assert_eq!(normal.method, PValueMethod::Normal);
        assert!(close(exact.p_value, normal.p_value, 0.01), "{} vs {}", exact.p_value, normal.p_value);
    }
}
