use crate::config::{MIN_HISTORY_PERIODS, TRADING_DAYS};
use crate::error::{OptimizeError, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tolerance for "weights sum to one".
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// ──────────────────────────────────────────────────────────────────────────────
// Covariance estimation
// ──────────────────────────────────────────────────────────────────────────────

/// How strongly the sample covariance is pulled toward the scaled identity.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shrinkage {
    /// Intensity chosen by the Ledoit-Wolf (2004) estimator.
    LedoitWolf,
    /// Fixed intensity in [0, 1]; 0 = sample covariance, 1 = scaled identity.
    Fixed(f64),
}

impl Default for Shrinkage {
    fn default() -> Self {
        Self::LedoitWolf
    }
}

/// Annualized, shrunk covariance over a fixed ordering of instruments.
#[derive(Clone, Debug)]
pub struct CovarianceMatrix {
    values: Vec<Vec<f64>>,
    shrinkage: f64,
    periods: usize,
}

impl CovarianceMatrix {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i][j]
    }

    /// Intensity actually applied, in [0, 1].
    pub fn shrinkage(&self) -> f64 {
        self.shrinkage
    }

    /// Return periods the estimate was built from.
    pub fn periods(&self) -> usize {
        self.periods
    }

    pub fn volatility(&self, i: usize) -> f64 {
        self.values[i][i].max(0.0).sqrt()
    }

    /// Eigenvalues in ascending order.
    pub fn eigenvalues(&self) -> Vec<f64> {
        if self.is_empty() {
            return Vec::new();
        }
        let n = self.len();
        let flat: Vec<f64> = self.values.iter().flatten().copied().collect();
        let m = DMatrix::from_row_slice(n, n, &flat);
        let mut eig: Vec<f64> = m.symmetric_eigenvalues().iter().copied().collect();
        eig.sort_by(|a, b| a.total_cmp(b));
        eig
    }

    /// Ratio of largest to smallest eigenvalue; infinite when singular.
    pub fn condition_number(&self) -> f64 {
        let eig = self.eigenvalues();
        match (eig.first(), eig.last()) {
            (Some(&lo), Some(&hi)) if lo > 0.0 => hi / lo,
            _ => f64::INFINITY,
        }
    }

    pub fn is_positive_semidefinite(&self) -> bool {
        let eig = self.eigenvalues();
        let scale = eig.last().map(|v| v.abs()).unwrap_or(0.0).max(1.0);
        eig.first().map(|&lo| lo >= -1e-12 * scale).unwrap_or(true)
    }
}

/// Estimates an annualized covariance matrix with shrinkage toward `μ·I`,
/// where `μ` is the average sample variance.
///
/// `returns[i]` is the periodic return series of `tickers[i]`; all series
/// must share the same length and date alignment.
pub fn estimate_covariance(
    tickers: &[String],
    returns: &[&[f64]],
    shrinkage: Shrinkage,
) -> Result<CovarianceMatrix> {
    let p = returns.len();
    if p == 0 {
        return Err(OptimizeError::DimensionMismatch(
            "cannot estimate covariance of an empty return matrix".to_string(),
        ));
    }
    if tickers.len() != p {
        return Err(OptimizeError::DimensionMismatch(format!(
            "{} tickers for {} return series",
            tickers.len(),
            p
        )));
    }

    let t = returns[0].len();
    if let Some((i, r)) = returns.iter().enumerate().find(|(_, r)| r.len() != t) {
        return Err(OptimizeError::DimensionMismatch(format!(
            "return series for {} has {} periods, expected {}",
            tickers[i],
            r.len(),
            t
        )));
    }
    if t < MIN_HISTORY_PERIODS {
        return Err(OptimizeError::InsufficientHistory {
            ticker: tickers[0].clone(),
            required: MIN_HISTORY_PERIODS,
            available: t,
        });
    }

    // Centered observations, period-major: x[t][i].
    let means: Vec<f64> = returns.iter().map(|r| sample_mean(r)).collect();
    let x: Vec<Vec<f64>> = (0..t)
        .map(|k| (0..p).map(|i| returns[i][k] - means[i]).collect())
        .collect();

    let tf = t as f64;
    let mut sample = vec![vec![0.0; p]; p];
    for row in &x {
        for i in 0..p {
            for j in i..p {
                sample[i][j] += row[i] * row[j];
            }
        }
    }
    for i in 0..p {
        for j in i..p {
            sample[i][j] /= tf;
            sample[j][i] = sample[i][j];
        }
    }

    let mu = (0..p).map(|i| sample[i][i]).sum::<f64>() / p as f64;

    let intensity = match shrinkage {
        Shrinkage::Fixed(a) => {
            if !a.is_finite() {
                return Err(OptimizeError::InvalidConstraints(format!(
                    "shrinkage intensity must be finite, got {}",
                    a
                )));
            }
            a.clamp(0.0, 1.0)
        }
        Shrinkage::LedoitWolf => ledoit_wolf_intensity(&x, &sample, mu),
    };

    let mut values = vec![vec![0.0; p]; p];
    for i in 0..p {
        for j in 0..p {
            let target = if i == j { mu } else { 0.0 };
            values[i][j] = ((1.0 - intensity) * sample[i][j] + intensity * target) * TRADING_DAYS;
        }
    }

    debug!(
        "Estimated {}x{} covariance over {} periods (shrinkage {:.3})",
        p, p, t, intensity
    );

    Ok(CovarianceMatrix {
        values,
        shrinkage: intensity,
        periods: t,
    })
}

fn ledoit_wolf_intensity(x: &[Vec<f64>], sample: &[Vec<f64>], mu: f64) -> f64 {
    let p = sample.len();
    let t = x.len() as f64;

    let mut delta2 = 0.0;
    for i in 0..p {
        for j in 0..p {
            let target = if i == j { mu } else { 0.0 };
            delta2 += (sample[i][j] - target).powi(2);
        }
    }
    delta2 /= p as f64;

    if delta2 <= f64::EPSILON * mu.abs().max(f64::MIN_POSITIVE) {
        return 0.0;
    }

    let mut beta_bar2 = 0.0;
    for row in x {
        for i in 0..p {
            for j in 0..p {
                beta_bar2 += (row[i] * row[j] - sample[i][j]).powi(2);
            }
        }
    }
    beta_bar2 /= t * t * p as f64;

    (beta_bar2.min(delta2) / delta2).clamp(0.0, 1.0)
}

// ──────────────────────────────────────────────────────────────────────────────
// Portfolio risk metrics
// ──────────────────────────────────────────────────────────────────────────────

fn check_weights(weights: &[f64], expected: usize) -> Result<()> {
    if weights.len() != expected {
        return Err(OptimizeError::DimensionMismatch(format!(
            "{} weights for a {}x{} covariance",
            weights.len(),
            expected,
            expected
        )));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(OptimizeError::DimensionMismatch(
            "weights must be finite and non-negative".to_string(),
        ));
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(OptimizeError::DimensionMismatch(format!(
            "weights sum to {:.6}, expected 1",
            sum
        )));
    }
    Ok(())
}

/// wᵀΣw for weights ordered like the covariance.
pub fn portfolio_variance(weights: &[f64], cov: &CovarianceMatrix) -> Result<f64> {
    check_weights(weights, cov.len())?;
    let mut var = 0.0;
    for (i, wi) in weights.iter().enumerate() {
        if *wi == 0.0 {
            continue;
        }
        for (j, wj) in weights.iter().enumerate() {
            var += wi * wj * cov.get(i, j);
        }
    }
    Ok(var.max(0.0))
}

/// Per-instrument share of portfolio volatility; entries sum to σ_p.
pub fn risk_contributions(weights: &[f64], cov: &CovarianceMatrix) -> Result<Vec<f64>> {
    let vol = portfolio_variance(weights, cov)?.sqrt();
    if vol <= 0.0 {
        return Ok(vec![0.0; weights.len()]);
    }
    Ok((0..weights.len())
        .map(|i| {
            let marginal: f64 = (0..weights.len()).map(|j| cov.get(i, j) * weights[j]).sum();
            weights[i] * marginal / vol
        })
        .collect())
}

/// Weighted average member volatility over portfolio volatility (≥ 1 when diversified).
pub fn diversification_ratio(weights: &[f64], cov: &CovarianceMatrix) -> Result<f64> {
    let vol = portfolio_variance(weights, cov)?.sqrt();
    let weighted: f64 = weights
        .iter()
        .enumerate()
        .map(|(i, w)| w * cov.volatility(i))
        .sum();
    Ok(if vol > 0.0 { weighted / vol } else { 1.0 })
}

/// Per-period returns of a constantly rebalanced weighted portfolio.
pub fn portfolio_returns(series: &[&[f64]], weights: &[f64]) -> Result<Vec<f64>> {
    if series.len() != weights.len() {
        return Err(OptimizeError::DimensionMismatch(format!(
            "{} return series for {} weights",
            series.len(),
            weights.len()
        )));
    }
    let t = series.iter().map(|s| s.len()).min().unwrap_or(0);
    Ok((0..t)
        .map(|k| {
            series
                .iter()
                .zip(weights)
                .map(|(s, w)| w * s[s.len() - t + k])
                .sum()
        })
        .collect())
}

/// Compounds periodic returns into a value path starting at 1.0.
pub fn price_path(returns: &[f64]) -> Vec<f64> {
    let mut path = Vec::with_capacity(returns.len() + 1);
    let mut value = 1.0;
    path.push(value);
    for r in returns {
        value *= 1.0 + r;
        path.push(value);
    }
    path
}

/// Largest peak-to-trough decline as a fraction of the peak.
pub fn max_drawdown(price_path: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;
    for &p in price_path {
        if p > peak {
            peak = p;
        } else if peak > 0.0 {
            worst = worst.max((peak - p) / peak);
        }
    }
    worst
}

/// Empirical (VaR, CVaR) at `confidence`, both reported as positive losses.
///
/// The quantile interpolates linearly between order statistics; CVaR is the
/// mean of all returns at or below it.
pub fn value_at_risk(returns: &[f64], confidence: f64) -> Result<(f64, f64)> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(OptimizeError::InvalidConfidence(confidence));
    }
    if returns.is_empty() {
        return Err(OptimizeError::InsufficientHistory {
            ticker: "portfolio".to_string(),
            required: 1,
            available: 0,
        });
    }

    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pos = (sorted.len() - 1) as f64 * (1.0 - confidence);
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let frac = pos - lo as f64;
    let quantile = sorted[lo] + frac * (sorted[hi] - sorted[lo]);

    let tail: Vec<f64> = sorted.iter().copied().take_while(|r| *r <= quantile).collect();
    let tail_mean = tail.iter().sum::<f64>() / tail.len() as f64;

    Ok((-quantile, -tail_mean))
}

// ──────────────────────────────────────────────────────────────────────────────
// Return statistics
// ──────────────────────────────────────────────────────────────────────────────

pub fn sample_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n − 1 denominator).
pub fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = sample_mean(values);
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    var.sqrt()
}

/// Pearson correlation over the common tail of two series; 0 when undefined.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];
    let (ma, mb) = (sample_mean(a), sample_mean(b));
    let mut sab = 0.0;
    let mut saa = 0.0;
    let mut sbb = 0.0;
    for k in 0..n {
        let da = a[k] - ma;
        let db = b[k] - mb;
        sab += da * db;
        saa += da * da;
        sbb += db * db;
    }
    let denom = (saa * sbb).sqrt();
    if denom > 0.0 && denom.is_finite() {
        (sab / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

pub fn correlation_matrix(series: &[&[f64]]) -> Vec<Vec<f64>> {
    let n = series.len();
    let mut corr = vec![vec![0.0; n]; n];
    for i in 0..n {
        corr[i][i] = 1.0;
        for j in (i + 1)..n {
            let c = pearson(series[i], series[j]);
            corr[i][j] = c;
            corr[j][i] = c;
        }
    }
    corr
}

/// Mean of the upper triangle of `corr` restricted to `members`.
pub fn average_pairwise_correlation(members: &[usize], corr: &[Vec<f64>]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (a, &i) in members.iter().enumerate() {
        for &j in &members[a + 1..] {
            sum += corr[i][j];
            count += 1;
        }
    }
    if count == 0 { 0.0 } else { sum / count as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::prelude::*;
    use rand::rngs::StdRng;
    use rand_distr::StandardNormal;

    fn tickers(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("T{:02}", i)).collect()
    }

    fn random_matrix(n: usize, t: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..t).map(|_| 0.01 * rng.sample::<f64, _>(StandardNormal)).collect())
            .collect()
    }

    /// Ten series that are one common path plus tiny noise.
    fn near_singular(n: usize, t: usize) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(99);
        let base: Vec<f64> = (0..t).map(|_| 0.01 * rng.sample::<f64, _>(StandardNormal)).collect();
        (0..n)
            .map(|_| {
                base.iter()
                    .map(|b| b + 1e-4 * rng.sample::<f64, _>(StandardNormal))
                    .collect()
            })
            .collect()
    }

    fn as_slices(m: &[Vec<f64>]) -> Vec<&[f64]> {
        m.iter().map(|r| r.as_slice()).collect()
    }

    #[test]
    fn test_covariance_is_symmetric_and_psd() {
        let m = random_matrix(6, 120, 1);
        let cov = estimate_covariance(&tickers(6), &as_slices(&m), Shrinkage::LedoitWolf).unwrap();
        assert_eq!(cov.len(), 6);
        for i in 0..6 {
            assert!(cov.get(i, i) > 0.0, "Variance should be positive");
            for j in 0..6 {
                assert_relative_eq!(cov.get(i, j), cov.get(j, i), epsilon = 1e-15);
            }
        }
        assert!(cov.is_positive_semidefinite());
        assert!((0.0..=1.0).contains(&cov.shrinkage()));
    }

    #[test]
    fn test_fixed_zero_matches_sample_covariance() {
        let m = random_matrix(2, 100, 5);
        let cov = estimate_covariance(&tickers(2), &as_slices(&m), Shrinkage::Fixed(0.0)).unwrap();
        let (ma, mb) = (sample_mean(&m[0]), sample_mean(&m[1]));
        let expected: f64 = m[0]
            .iter()
            .zip(&m[1])
            .map(|(a, b)| (a - ma) * (b - mb))
            .sum::<f64>()
            / 100.0
            * TRADING_DAYS;
        assert_relative_eq!(cov.get(0, 1), expected, max_relative = 1e-12);
    }

    #[test]
    fn test_insufficient_history() {
        let m = random_matrix(3, MIN_HISTORY_PERIODS - 1, 2);
        let err = estimate_covariance(&tickers(3), &as_slices(&m), Shrinkage::LedoitWolf).unwrap_err();
        assert!(matches!(
            err,
            OptimizeError::InsufficientHistory { required, available, .. }
                if required == MIN_HISTORY_PERIODS && available == MIN_HISTORY_PERIODS - 1
        ));
    }

    #[test]
    fn test_ragged_matrix_is_dimension_mismatch() {
        let mut m = random_matrix(3, 80, 3);
        m[2].pop();
        let err = estimate_covariance(&tickers(3), &as_slices(&m), Shrinkage::LedoitWolf).unwrap_err();
        assert!(matches!(err, OptimizeError::DimensionMismatch(_)));
    }

    #[test]
    fn test_condition_number_falls_as_shrinkage_rises() {
        let m = near_singular(10, 60);
        let ids = tickers(10);
        let slices = as_slices(&m);
        let mut previous = f64::INFINITY;
        for intensity in [0.0, 0.1, 0.3, 0.6, 0.9, 1.0] {
            let cov = estimate_covariance(&ids, &slices, Shrinkage::Fixed(intensity)).unwrap();
            let cond = cov.condition_number();
            assert!(
                cond < previous,
                "condition number {} at intensity {} should be below {}",
                cond,
                intensity,
                previous
            );
            previous = cond;
        }
        assert_relative_eq!(previous, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_ledoit_wolf_improves_conditioning_of_near_singular_input() {
        let m = near_singular(10, 60);
        let ids = tickers(10);
        let slices = as_slices(&m);
        let sample = estimate_covariance(&ids, &slices, Shrinkage::Fixed(0.0)).unwrap();
        let shrunk = estimate_covariance(&ids, &slices, Shrinkage::LedoitWolf).unwrap();
        assert!(shrunk.shrinkage() > 0.0);
        assert!(shrunk.condition_number() < sample.condition_number());
    }

    #[test]
    fn test_portfolio_variance_two_assets() {
        let m = random_matrix(2, 90, 8);
        let cov = estimate_covariance(&tickers(2), &as_slices(&m), Shrinkage::Fixed(0.0)).unwrap();
        let w = [0.25, 0.75];
        let expected = 0.0625 * cov.get(0, 0) + 0.5625 * cov.get(1, 1) + 2.0 * 0.1875 * cov.get(0, 1);
        assert_relative_eq!(portfolio_variance(&w, &cov).unwrap(), expected, max_relative = 1e-12);
    }

    #[test]
    fn test_portfolio_variance_rejects_bad_weights() {
        let m = random_matrix(3, 90, 9);
        let cov = estimate_covariance(&tickers(3), &as_slices(&m), Shrinkage::LedoitWolf).unwrap();
        assert!(matches!(
            portfolio_variance(&[0.5, 0.5], &cov),
            Err(OptimizeError::DimensionMismatch(_))
        ));
        assert!(matches!(
            portfolio_variance(&[0.5, 0.5, 0.5], &cov),
            Err(OptimizeError::DimensionMismatch(_))
        ));
        assert!(matches!(
            portfolio_variance(&[1.2, -0.1, -0.1], &cov),
            Err(OptimizeError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_risk_contributions_sum_to_volatility() {
        let m = random_matrix(4, 100, 10);
        let cov = estimate_covariance(&tickers(4), &as_slices(&m), Shrinkage::LedoitWolf).unwrap();
        let w = [0.25; 4];
        let contributions = risk_contributions(&w, &cov).unwrap();
        let vol = portfolio_variance(&w, &cov).unwrap().sqrt();
        assert_relative_eq!(contributions.iter().sum::<f64>(), vol, max_relative = 1e-10);
        assert!(diversification_ratio(&w, &cov).unwrap() >= 1.0);
    }

    #[test]
    fn test_max_drawdown() {
        assert_eq!(max_drawdown(&[1.0, 1.0, 1.1, 1.3]), 0.0);
        assert_eq!(max_drawdown(&[]), 0.0);
        assert_relative_eq!(max_drawdown(&[1.0, 1.2, 0.9, 1.1, 0.6, 0.8]), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_price_path_and_portfolio_returns() {
        let a = [0.10, -0.10];
        let b = [0.00, 0.20];
        let rets = portfolio_returns(&[&a, &b], &[0.5, 0.5]).unwrap();
        assert_relative_eq!(rets[0], 0.05, epsilon = 1e-12);
        assert_relative_eq!(rets[1], 0.05, epsilon = 1e-12);
        let path = price_path(&rets);
        assert_eq!(path.len(), 3);
        assert_relative_eq!(path[2], 1.05 * 1.05, epsilon = 1e-12);
    }

    #[test]
    fn test_value_at_risk() {
        // -0.10, -0.09, ..., 0.09
        let returns: Vec<f64> = (0..20).map(|i| (i as f64 - 10.0) / 100.0).collect();
        let (var, cvar) = value_at_risk(&returns, 0.95).unwrap();
        // position 19 * 0.05 = 0.95 -> between -0.10 and -0.09
        assert_relative_eq!(var, 0.0905, epsilon = 1e-12);
        assert_relative_eq!(cvar, 0.10, epsilon = 1e-12);
        assert!(cvar >= var);

        assert!(matches!(value_at_risk(&returns, 1.0), Err(OptimizeError::InvalidConfidence(_))));
        assert!(matches!(value_at_risk(&returns, 0.0), Err(OptimizeError::InvalidConfidence(_))));
        assert!(value_at_risk(&[], 0.95).is_err());
    }

    #[test]
    fn test_correlation_helpers() {
        let a: Vec<f64> = (0..50).map(|i| (i as f64).sin()).collect();
        let b: Vec<f64> = a.iter().map(|v| 2.0 * v + 1.0).collect();
        let c: Vec<f64> = a.iter().map(|v| -v).collect();
        let corr = correlation_matrix(&[&a, &b, &c]);
        assert_relative_eq!(corr[0][1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(corr[0][2], -1.0, epsilon = 1e-12);
        let avg = average_pairwise_correlation(&[0, 1, 2], &corr);
        assert_relative_eq!(avg, (1.0 - 1.0 - 1.0) / 3.0, epsilon = 1e-12);
        assert_eq!(average_pairwise_correlation(&[1], &corr), 0.0);
        assert_eq!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), 0.0);
    }
}
