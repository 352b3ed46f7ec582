use crate::config::{
    DEFAULT_JACCARD_THRESHOLD, DEFAULT_MAX_PER_CLUSTER, DEFAULT_SWAP_ROUNDS, HARD_CAP_FACTOR, Settings,
    months_to_periods,
};
use crate::error::{OptimizeError, Result};
use crate::optimizer::{SearchConfig, SectorRules, SwapPolicy};
use crate::risk::Shrinkage;
use crate::sector::SECTOR_COUNT;
use crate::selector::SelectionConfig;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;

const N_STOCKS: RangeInclusive<usize> = 2..=15;
const RISK_WINDOW_MONTHS: RangeInclusive<usize> = 6..=24;
const RETURN_WINDOW_MONTHS: RangeInclusive<usize> = 1..=12;
const TOP_K_PER_SECTOR: RangeInclusive<usize> = 1..=10;
const MAX_PER_CLUSTER: RangeInclusive<usize> = 1..=2;

/// One optimization request. Every field has a default, so partial JSON
/// documents deserialize.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    /// Instruments in every returned portfolio.
    pub n_stocks: usize,
    /// Minimum annualized expected return (fraction).
    pub min_return: f64,
    pub risk_window_months: usize,
    pub return_window_months: usize,
    pub top_k_per_sector: usize,
    /// Clustering cut on `1 − correlation`.
    pub distance_threshold: f64,
    pub max_per_sector: usize,
    /// Distinct sectors required; clamped to `n_stocks`.
    pub min_sectors: usize,
    pub max_per_cluster: usize,
    pub iterations: usize,
    /// Total trial cap; defaults to a multiple of `iterations`.
    pub max_trials: Option<usize>,
    pub time_budget_ms: u64,
    pub top_k: usize,
    pub swap_rounds: usize,
    pub swap_policy: SwapPolicy,
    pub temperature: f64,
    pub jaccard_threshold: f64,
    pub workers: usize,
    pub seed: u64,
    /// Instruments with a lower Sharpe ratio are dropped before ranking.
    pub min_sharpe: f64,
    pub shrinkage: Shrinkage,
    pub risk_free_rate: f64,
}

impl Default for Constraints {
    fn default() -> Self {
        Self::with_settings(&Settings::default())
    }
}

impl Constraints {
    /// Request defaults with engine-level values taken from `settings`.
    pub fn with_settings(settings: &Settings) -> Self {
        Self {
            n_stocks: 10,
            min_return: 0.10,
            risk_window_months: 12,
            return_window_months: 3,
            top_k_per_sector: 5,
            distance_threshold: 0.25,
            max_per_sector: 2,
            min_sectors: 6,
            max_per_cluster: DEFAULT_MAX_PER_CLUSTER,
            iterations: settings.iterations,
            max_trials: None,
            time_budget_ms: settings.time_budget_ms,
            top_k: settings.top_k,
            swap_rounds: DEFAULT_SWAP_ROUNDS,
            swap_policy: SwapPolicy::default(),
            temperature: settings.temperature,
            jaccard_threshold: DEFAULT_JACCARD_THRESHOLD,
            workers: settings.workers,
            seed: settings.seed,
            min_sharpe: -1.0,
            shrinkage: Shrinkage::default(),
            risk_free_rate: settings.risk_free_rate,
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_range("n_stocks", self.n_stocks, &N_STOCKS)?;
        check_range("risk_window_months", self.risk_window_months, &RISK_WINDOW_MONTHS)?;
        check_range("return_window_months", self.return_window_months, &RETURN_WINDOW_MONTHS)?;
        check_range("top_k_per_sector", self.top_k_per_sector, &TOP_K_PER_SECTOR)?;
        check_range("max_per_cluster", self.max_per_cluster, &MAX_PER_CLUSTER)?;

        if !(0.0..=1.0).contains(&self.min_return) {
            return invalid(format!("min_return must lie in [0, 1], got {}", self.min_return));
        }
        if !(0.01..=0.5).contains(&self.distance_threshold) {
            return invalid(format!(
                "distance_threshold must lie in [0.01, 0.5], got {}",
                self.distance_threshold
            ));
        }
        if self.max_per_sector == 0 || self.min_sectors == 0 {
            return invalid("max_per_sector and min_sectors must be at least 1".to_string());
        }
        if self.iterations == 0 || self.time_budget_ms == 0 || self.top_k == 0 || self.workers == 0 {
            return invalid("iterations, time_budget_ms, top_k and workers must be at least 1".to_string());
        }
        if self.max_trials == Some(0) {
            return invalid("max_trials must be at least 1".to_string());
        }
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return invalid(format!("temperature must be positive, got {}", self.temperature));
        }
        if !(self.jaccard_threshold > 0.0 && self.jaccard_threshold <= 1.0) {
            return invalid(format!(
                "jaccard_threshold must lie in (0, 1], got {}",
                self.jaccard_threshold
            ));
        }
        if !self.min_sharpe.is_finite() || !self.risk_free_rate.is_finite() {
            return invalid("min_sharpe and risk_free_rate must be finite".to_string());
        }
        if let Shrinkage::Fixed(a) = self.shrinkage {
            if !(0.0..=1.0).contains(&a) {
                return invalid(format!("fixed shrinkage must lie in [0, 1], got {}", a));
            }
        }
        Ok(())
    }

    /// Non-fatal advice about settings that tend to produce poor results.
    pub fn advisories(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.min_return > 0.25 {
            notes.push("Target return above 25% may be difficult to achieve".to_string());
        }
        if self.risk_window_months < 9 {
            notes.push("Short risk window may lead to unstable estimates".to_string());
        }
        if self.distance_threshold < 0.15 {
            notes.push("Tight distance threshold may not filter enough stocks".to_string());
        }
        if self.n_stocks > self.max_per_sector * SECTOR_COUNT {
            notes.push(format!(
                "{} stocks cannot fit {} per sector across {} sectors",
                self.n_stocks, self.max_per_sector, SECTOR_COUNT
            ));
        }
        notes
    }

    /// Rough pool size after filtering and de-duplication.
    pub fn estimated_candidates(&self) -> usize {
        (self.top_k_per_sector * SECTOR_COUNT * 7) / 10
    }

    pub fn effective_min_sectors(&self) -> usize {
        self.min_sectors.min(self.n_stocks)
    }

    pub fn sector_rules(&self) -> SectorRules {
        SectorRules {
            max_per_sector: self.max_per_sector,
            min_sectors: self.effective_min_sectors(),
        }
    }

    pub fn max_trials(&self) -> usize {
        self.max_trials
            .unwrap_or(self.iterations.saturating_mul(HARD_CAP_FACTOR))
            .max(1)
    }

    pub fn selection_config(&self) -> SelectionConfig {
        SelectionConfig {
            return_periods: months_to_periods(self.return_window_months),
            risk_periods: months_to_periods(self.risk_window_months),
            top_k_per_sector: self.top_k_per_sector,
            distance_threshold: self.distance_threshold,
            max_per_cluster: self.max_per_cluster,
            min_sharpe: self.min_sharpe,
            risk_free_rate: self.risk_free_rate,
        }
    }

    pub fn search_config(&self, rules: SectorRules) -> SearchConfig {
        SearchConfig {
            n: self.n_stocks,
            min_return: self.min_return,
            rules,
            iterations: self.iterations,
            max_trials: self.max_trials(),
            time_budget: Duration::from_millis(self.time_budget_ms),
            top_k: self.top_k,
            swap_rounds: self.swap_rounds,
            swap_policy: self.swap_policy,
            temperature: self.temperature,
            jaccard_threshold: self.jaccard_threshold,
            workers: self.workers,
            seed: self.seed,
        }
    }
}

fn check_range(name: &str, value: usize, range: &RangeInclusive<usize>) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        invalid(format!(
            "{} must lie in {}..={}, got {}",
            name,
            range.start(),
            range.end(),
            value
        ))
    }
}

fn invalid(message: String) -> Result<()> {
    Err(OptimizeError::InvalidConstraints(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let c = Constraints::default();
        assert!(c.validate().is_ok());
        assert!(c.advisories().is_empty());
        assert_eq!(c.max_trials(), c.iterations * HARD_CAP_FACTOR);
        assert_eq!(c.selection_config().return_periods, 63);
        assert_eq!(c.selection_config().risk_periods, 252);
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let mut c = Constraints {
            n_stocks: 16,
            ..Constraints::default()
        };
        assert!(matches!(c.validate(), Err(OptimizeError::InvalidConstraints(_))));
        c.n_stocks = 10;
        c.distance_threshold = 0.9;
        assert!(c.validate().is_err());
        c.distance_threshold = 0.25;
        c.shrinkage = Shrinkage::Fixed(1.5);
        assert!(c.validate().is_err());
        c.shrinkage = Shrinkage::Fixed(0.3);
        c.max_per_cluster = 3;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_advisories() {
        let c = Constraints {
            min_return: 0.30,
            risk_window_months: 6,
            distance_threshold: 0.10,
            ..Constraints::default()
        };
        assert_eq!(c.advisories().len(), 3);
    }

    #[test]
    fn test_min_sectors_clamps_to_stock_count() {
        let c = Constraints {
            n_stocks: 4,
            min_sectors: 6,
            ..Constraints::default()
        };
        assert_eq!(c.sector_rules().min_sectors, 4);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let c: Constraints = serde_json::from_str(
            r#"{"n_stocks": 8, "swap_policy": "first_improving", "shrinkage": {"fixed": 0.2}}"#,
        )
        .unwrap();
        assert_eq!(c.n_stocks, 8);
        assert_eq!(c.swap_policy, SwapPolicy::FirstImproving);
        assert_eq!(c.shrinkage, Shrinkage::Fixed(0.2));
        assert_eq!(c.top_k_per_sector, 5);
        assert!(c.validate().is_ok());
    }
}
