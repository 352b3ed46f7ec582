use rayon::ThreadPoolBuilder;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

// ──────────────────────────────────────────────────────────────────────────────
// Policy constants
// ──────────────────────────────────────────────────────────────────────────────

/// Annual trading days for annualization.
pub const TRADING_DAYS: f64 = 252.0;

/// Approximate trading periods per calendar month.
pub const PERIODS_PER_MONTH: usize = 21;

/// Risk-free annual rate used in Sharpe calculations.
pub const RISK_FREE_RATE: f64 = 0.02;

/// Fewest return periods a covariance estimate is allowed to use.
pub const MIN_HISTORY_PERIODS: usize = 60;

/// Annualized volatility below which a series is treated as degenerate.
pub const MIN_VOLATILITY: f64 = 1e-8;

/// Useful (return-gate passing) samples per optimization call.
pub const DEFAULT_ITERATIONS: usize = 1000;

/// Hard cap on total trials, as a multiple of the useful iteration budget.
pub const HARD_CAP_FACTOR: usize = 20;

/// Wall-clock budget for one optimization call.
pub const DEFAULT_TIME_BUDGET_MS: u64 = 2000;

/// Portfolios returned (best + alternatives).
pub const DEFAULT_TOP_K: usize = 3;

/// Single-instrument swap rounds per surviving sample.
pub const DEFAULT_SWAP_ROUNDS: usize = 5;

/// Softmax temperature for Sharpe-weighted sampling (higher = closer to uniform).
pub const DEFAULT_TEMPERATURE: f64 = 2.0;

/// Members kept per correlation cluster.
pub const DEFAULT_MAX_PER_CLUSTER: usize = 2;

/// Jaccard similarity at or above which two portfolios count as near-duplicates.
pub const DEFAULT_JACCARD_THRESHOLD: f64 = 0.8;

/// Sharpe values are clipped to ±this before computing sampling weights.
pub const SHARPE_CLIP: f64 = 5.0;

/// Trials evaluated in parallel between two budget checks.
pub const TRIAL_BLOCK_SIZE: usize = 64;

/// Sector-rejected samples kept to estimate what the sector rules cost.
pub const SHADOW_SAMPLES: usize = 16;

/// Average pairwise correlation above which a result is flagged.
pub const HIGH_CORRELATION_WARNING: f64 = 0.6;

/// Historical max drawdown above which a result is flagged.
pub const HIGH_DRAWDOWN_WARNING: f64 = 0.30;

/// Confidence level for reported VaR / CVaR.
pub const VAR_CONFIDENCE: f64 = 0.95;

// ──────────────────────────────────────────────────────────────────────────────
// Runtime settings
// ──────────────────────────────────────────────────────────────────────────────

/// Engine-level defaults that can be overridden from the environment
/// (`SECTORFOLIO_*`, optionally via a `.env` file).
#[derive(Clone, Debug)]
pub struct Settings {
    pub risk_free_rate: f64,
    pub iterations: usize,
    pub time_budget_ms: u64,
    pub workers: usize,
    pub seed: u64,
    pub temperature: f64,
    pub top_k: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            risk_free_rate: RISK_FREE_RATE,
            iterations: DEFAULT_ITERATIONS,
            time_budget_ms: DEFAULT_TIME_BUDGET_MS,
            workers: num_cpus::get().max(1),
            seed: 42,
            temperature: DEFAULT_TEMPERATURE,
            top_k: DEFAULT_TOP_K,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            risk_free_rate: env_or("SECTORFOLIO_RISK_FREE_RATE", defaults.risk_free_rate),
            iterations: env_or("SECTORFOLIO_ITERATIONS", defaults.iterations),
            time_budget_ms: env_or("SECTORFOLIO_TIME_BUDGET_MS", defaults.time_budget_ms),
            workers: env_or("SECTORFOLIO_WORKERS", defaults.workers).max(1),
            seed: env_or("SECTORFOLIO_SEED", defaults.seed),
            temperature: env_or("SECTORFOLIO_TEMPERATURE", defaults.temperature),
            top_k: env_or("SECTORFOLIO_TOP_K", defaults.top_k).max(1),
        }
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return default;
            }
            match trimmed.parse::<T>() {
                Ok(v) => v,
                Err(_) => {
                    warn!("Invalid {}={} ; using default {}", key, trimmed, default);
                    default
                }
            }
        }
        Err(_) => default,
    }
}

/// Converts a lookback in months into return periods.
pub fn months_to_periods(months: usize) -> usize {
    months * PERIODS_PER_MONTH
}

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}
