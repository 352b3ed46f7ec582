use crate::config::{HIGH_CORRELATION_WARNING, HIGH_DRAWDOWN_WARNING, VAR_CONFIDENCE};
use crate::constraints::Constraints;
use crate::data::DataProvider;
use crate::error::{OptimizeError, Result};
use crate::optimizer::{Portfolio, SearchInputs, SearchOutcome, relax_rules, run_search, sector_infeasibility};
use crate::risk::{
    CovarianceMatrix, average_pairwise_correlation, correlation_matrix, diversification_ratio, estimate_covariance,
    max_drawdown, portfolio_returns, portfolio_variance, price_path, risk_contributions, value_at_risk,
};
use crate::sector::{Sector, SectorHistogram, histogram};
use crate::selector::{CandidatePool, SelectionSummary, select_candidates};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// One member of a reported portfolio.
#[derive(Clone, Debug, Serialize)]
pub struct StockDetail {
    pub ticker: String,
    pub sector: Sector,
    pub weight: f64,
    /// Annualized short-window mean return.
    pub expected_return: f64,
    /// Annualized long-window volatility.
    pub volatility: f64,
    pub sharpe: f64,
    /// Share of portfolio volatility attributable to this member.
    pub risk_contribution: f64,
}

/// Fully scored equal-weighted portfolio.
#[derive(Clone, Debug, Serialize)]
pub struct PortfolioReport {
    pub tickers: Vec<String>,
    pub expected_return: f64,
    /// Annualized volatility.
    pub risk: f64,
    pub variance: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    /// Per-period loss quantile at `VAR_CONFIDENCE`.
    pub var_95: f64,
    pub cvar_95: f64,
    pub sector_breakdown: SectorHistogram,
    pub average_correlation: f64,
    pub diversification_ratio: f64,
    pub stocks: Vec<StockDetail>,
}

/// Soft conditions attached to a result.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// No sample met the floor; the best-return sample is shown instead.
    ReturnFloorUnreachable { target: f64, achievable: f64 },
    HighCorrelation { average: f64 },
    HighDrawdown { max_drawdown: f64 },
    /// Sector rules rejected a lower-risk portfolio that met the floor.
    DiversificationCost {
        constrained_risk: f64,
        unconstrained_risk: f64,
    },
    SectorConstraintsRelaxed {
        max_per_sector: usize,
        min_sectors: usize,
    },
    TimeBudgetExhausted { trials: usize, useful: usize },
    InstrumentsExcluded { count: usize },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReturnFloorUnreachable { target, achievable } => write!(
                f,
                "Target return {:.1}% unreachable; best achievable {:.1}% shown",
                target * 100.0,
                achievable * 100.0
            ),
            Self::HighCorrelation { average } => write!(
                f,
                "Portfolio has relatively high average correlation ({:.0}%); limited diversification possible",
                average * 100.0
            ),
            Self::HighDrawdown { max_drawdown } => write!(
                f,
                "Historical maximum drawdown is {:.1}%; this portfolio has experienced significant declines",
                max_drawdown * 100.0
            ),
            Self::DiversificationCost {
                constrained_risk,
                unconstrained_risk,
            } => write!(
                f,
                "Sector limits cost risk: {:.2}% vs {:.2}% for a disallowed, more concentrated portfolio",
                constrained_risk * 100.0,
                unconstrained_risk * 100.0
            ),
            Self::SectorConstraintsRelaxed {
                max_per_sector,
                min_sectors,
            } => write!(
                f,
                "Sector constraints relaxed to at most {} per sector across at least {} sectors",
                max_per_sector, min_sectors
            ),
            Self::TimeBudgetExhausted { trials, useful } => write!(
                f,
                "Time budget exhausted after {} trials ({} useful samples)",
                trials, useful
            ),
            Self::InstrumentsExcluded { count } => {
                write!(f, "{} instruments excluded for data quality", count)
            }
        }
    }
}

/// Wall-clock facts about a run. Everything else in a result is a function
/// of the inputs and the seed.
#[derive(Clone, Debug, Serialize)]
pub struct RunTiming {
    pub optimization_time_ms: u64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct OptimizationMetadata {
    pub data_as_of: Option<DateTime<Utc>>,
    pub candidates: usize,
    pub trials: usize,
    pub useful_samples: usize,
    pub sector_rejected: usize,
    pub return_rejected: usize,
    pub improved_by_local_search: usize,
    pub workers: usize,
    pub seed: u64,
    pub history_periods: usize,
    pub shrinkage: f64,
    pub condition_number: f64,
    pub timed_out: bool,
    pub selection: SelectionSummary,
}

/// Best portfolio plus up to K−1 distinct alternatives, ascending risk.
#[derive(Clone, Debug, Serialize)]
pub struct OptimizationResult {
    pub best: PortfolioReport,
    pub alternatives: Vec<PortfolioReport>,
    /// The return floor could not be met; `best` is the best-return fallback.
    pub relaxed: bool,
    pub achievable_return: Option<f64>,
    pub warnings: Vec<Warning>,
    pub metadata: OptimizationMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<RunTiming>,
}

impl OptimizationResult {
    /// Drops the wall-clock fields so identical seeded runs serialize to
    /// identical bytes.
    pub fn without_timing(mut self) -> Self {
        self.timing = None;
        self
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Reporting
// ──────────────────────────────────────────────────────────────────────────────

fn build_report(
    portfolio: &Portfolio,
    pool: &CandidatePool,
    cov: &CovarianceMatrix,
    corr: &[Vec<f64>],
    risk_free_rate: f64,
) -> Result<PortfolioReport> {
    let candidates = pool.candidates();
    let n = portfolio.members.len();
    let weight = 1.0 / n as f64;

    let mut full = vec![0.0; candidates.len()];
    for &m in &portfolio.members {
        full[m] = weight;
    }
    let variance = portfolio_variance(&full, cov)?;
    let risk = variance.sqrt();
    let contributions = risk_contributions(&full, cov)?;

    let series: Vec<&[f64]> = portfolio
        .members
        .iter()
        .map(|&m| candidates[m].long_returns.as_slice())
        .collect();
    let daily = portfolio_returns(&series, &vec![weight; n])?;
    let (var_95, cvar_95) = value_at_risk(&daily, VAR_CONFIDENCE)?;

    let stocks: Vec<StockDetail> = portfolio
        .members
        .iter()
        .map(|&m| {
            let c = &candidates[m];
            StockDetail {
                ticker: c.ticker.clone(),
                sector: c.sector,
                weight,
                expected_return: c.mean_return,
                volatility: c.volatility,
                sharpe: c.sharpe,
                risk_contribution: contributions[m],
            }
        })
        .collect();

    Ok(PortfolioReport {
        tickers: stocks.iter().map(|s| s.ticker.clone()).collect(),
        expected_return: portfolio.expected_return,
        risk,
        variance,
        sharpe: if risk > 0.0 {
            (portfolio.expected_return - risk_free_rate) / risk
        } else {
            0.0
        },
        max_drawdown: max_drawdown(&price_path(&daily)),
        var_95,
        cvar_95,
        sector_breakdown: histogram(stocks.iter().map(|s| s.sector)),
        average_correlation: average_pairwise_correlation(&portfolio.members, corr),
        diversification_ratio: diversification_ratio(&full, cov)?,
        stocks,
    })
}

fn build_result(
    pool: &CandidatePool,
    cov: &CovarianceMatrix,
    outcome: SearchOutcome,
    constraints: &Constraints,
) -> Result<OptimizationResult> {
    let corr = correlation_matrix(&pool.long_returns());
    let mut reports = outcome
        .portfolios
        .iter()
        .map(|p| build_report(p, pool, cov, &corr, constraints.risk_free_rate))
        .collect::<Result<Vec<_>>>()?;
    if reports.is_empty() {
        return Err(OptimizeError::ConstraintUnsatisfiable {
            reason: "search produced no samples".to_string(),
            relaxed: None,
        });
    }
    let best = reports.remove(0);
    let stats = &outcome.stats;

    let mut warnings = Vec::new();
    if outcome.sector_rules_broken {
        warnings.push(Warning::SectorConstraintsRelaxed {
            max_per_sector: best.sector_breakdown.values().copied().max().unwrap_or(0),
            min_sectors: best.sector_breakdown.len(),
        });
    }
    if let Some(achievable) = outcome.achievable_return {
        if outcome.relaxed && achievable < constraints.min_return {
            warnings.push(Warning::ReturnFloorUnreachable {
                target: constraints.min_return,
                achievable,
            });
        }
    }
    if best.average_correlation > HIGH_CORRELATION_WARNING {
        warnings.push(Warning::HighCorrelation {
            average: best.average_correlation,
        });
    }
    if best.max_drawdown > HIGH_DRAWDOWN_WARNING {
        warnings.push(Warning::HighDrawdown {
            max_drawdown: best.max_drawdown,
        });
    }
    if let Some(shadow) = outcome.unconstrained_best.as_ref() {
        if !outcome.relaxed && shadow.variance < best.variance {
            warnings.push(Warning::DiversificationCost {
                constrained_risk: best.risk,
                unconstrained_risk: shadow.risk(),
            });
        }
    }
    if stats.timed_out {
        warnings.push(Warning::TimeBudgetExhausted {
            trials: stats.trials,
            useful: stats.useful,
        });
    }
    if !pool.summary.excluded.is_empty() {
        warnings.push(Warning::InstrumentsExcluded {
            count: pool.summary.excluded.len(),
        });
    }

    let metadata = OptimizationMetadata {
        data_as_of: None,
        candidates: pool.len(),
        trials: stats.trials,
        useful_samples: stats.useful,
        sector_rejected: stats.sector_rejected,
        return_rejected: stats.return_rejected,
        improved_by_local_search: stats.improved,
        workers: stats.workers,
        seed: constraints.seed,
        history_periods: cov.periods(),
        shrinkage: cov.shrinkage(),
        condition_number: cov.condition_number(),
        timed_out: stats.timed_out,
        selection: pool.summary.clone(),
    };

    Ok(OptimizationResult {
        best,
        alternatives: reports,
        relaxed: outcome.relaxed,
        achievable_return: outcome.achievable_return,
        warnings,
        metadata,
        timing: Some(RunTiming {
            optimization_time_ms: stats.elapsed_ms,
            computed_at: Utc::now(),
        }),
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Top-Level Command: Run Portfolio Optimization
// ──────────────────────────────────────────────────────────────────────────────

/// Covariance estimation and search over an already selected pool.
///
/// When the sector rules admit no portfolio of the requested size, the search
/// is rerun under the loosest workable rules and that result is returned
/// inside `ConstraintUnsatisfiable`.
pub fn optimize_pool(pool: &CandidatePool, constraints: &Constraints) -> Result<OptimizationResult> {
    let n = constraints.n_stocks;
    if pool.is_empty() {
        return Err(OptimizeError::ConstraintUnsatisfiable {
            reason: "no candidates survived selection".to_string(),
            relaxed: None,
        });
    }
    if pool.len() < n {
        return Err(OptimizeError::ConstraintUnsatisfiable {
            reason: format!(
                "only {} candidates survived selection, {} requested",
                pool.len(),
                n
            ),
            relaxed: None,
        });
    }

    let candidates = pool.candidates();
    let cov = estimate_covariance(&pool.tickers(), &pool.long_returns(), constraints.shrinkage)?;
    if !cov.is_positive_semidefinite() {
        warn!(
            "Covariance over {} candidates is not positive semi-definite (shrinkage {:.3})",
            cov.len(),
            cov.shrinkage()
        );
    }
    let sectors: Vec<Sector> = candidates.iter().map(|c| c.sector).collect();
    let inputs = SearchInputs::new(
        sectors.clone(),
        candidates.iter().map(|c| c.mean_return).collect(),
        candidates.iter().map(|c| c.sharpe).collect(),
        &cov,
    )?;

    let rules = constraints.sector_rules();
    if let Some(reason) = sector_infeasibility(&sectors, n, &rules) {
        let relaxed_rules = relax_rules(&sectors, n, &rules);
        warn!(
            "Sector constraints unsatisfiable ({}); retrying with max {} per sector, min {} sectors",
            reason, relaxed_rules.max_per_sector, relaxed_rules.min_sectors
        );
        let outcome = run_search(&inputs, &constraints.search_config(relaxed_rules))?;
        let mut result = build_result(pool, &cov, outcome, constraints)?;
        result.warnings.insert(
            0,
            Warning::SectorConstraintsRelaxed {
                max_per_sector: relaxed_rules.max_per_sector,
                min_sectors: relaxed_rules.min_sectors,
            },
        );
        return Err(OptimizeError::ConstraintUnsatisfiable {
            reason,
            relaxed: Some(Box::new(result)),
        });
    }

    let outcome = run_search(&inputs, &constraints.search_config(rules))?;
    build_result(pool, &cov, outcome, constraints)
}

/// Full pipeline: select candidates → estimate covariance → search.
pub fn optimize(provider: &dyn DataProvider, constraints: &Constraints) -> Result<OptimizationResult> {
    constraints.validate()?;
    let started = Instant::now();
    info!(
        "Optimizing {} stocks, min return {:.1}%, {} per sector, {} sectors, {} iterations / {} ms",
        constraints.n_stocks,
        constraints.min_return * 100.0,
        constraints.max_per_sector,
        constraints.effective_min_sectors(),
        constraints.iterations,
        constraints.time_budget_ms
    );

    let pool = select_candidates(provider, &constraints.selection_config())?;
    let finish = |mut result: OptimizationResult| {
        result.metadata.data_as_of = provider.as_of();
        if let Some(timing) = result.timing.as_mut() {
            timing.optimization_time_ms = started.elapsed().as_millis() as u64;
        }
        result
    };

    match optimize_pool(&pool, constraints) {
        Ok(result) => {
            let result = finish(result);
            info!(
                "Best portfolio: {:?} (return {:.2}%, risk {:.2}%) in {} ms",
                result.best.tickers,
                result.best.expected_return * 100.0,
                result.best.risk * 100.0,
                started.elapsed().as_millis()
            );
            Ok(result)
        }
        Err(OptimizeError::ConstraintUnsatisfiable { reason, relaxed }) => {
            Err(OptimizeError::ConstraintUnsatisfiable {
                reason,
                relaxed: relaxed.map(|r| Box::new(finish(*r))),
            })
        }
        Err(e) => Err(e),
    }
}

fn print_report(title: &str, report: &PortfolioReport) {
    println!("║  {:<58}║", title);
    println!(
        "║  Expected Annual Return : {:>+7.2}%                           ║",
        report.expected_return * 100.0
    );
    println!(
        "║  Annual Volatility      : {:>7.2}%                           ║",
        report.risk * 100.0
    );
    println!(
        "║  Sharpe Ratio           : {:>7.2}                            ║",
        report.sharpe
    );
    println!(
        "║  Max Drawdown           : {:>7.2}%                           ║",
        report.max_drawdown * 100.0
    );
    println!(
        "║  VaR / CVaR (95%, daily): {:>6.2}% / {:>6.2}%                 ║",
        report.var_95 * 100.0,
        report.cvar_95 * 100.0
    );
    println!(
        "║  Avg Correlation        : {:>7.2}   Div. Ratio: {:>5.2}       ║",
        report.average_correlation, report.diversification_ratio
    );
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Ticker  Sector                  Ret.    Vol.   Sharpe    ║");
    for s in &report.stocks {
        println!(
            "║  {:<6}  {:<22} {:>+6.1}%  {:>5.1}%  {:>5.2}     ║",
            s.ticker,
            s.sector.as_str(),
            s.expected_return * 100.0,
            s.volatility * 100.0,
            s.sharpe
        );
    }
}

/// Pretty-prints an optimization result to stdout.
pub fn print_allocation(result: &OptimizationResult) {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║           Sectorfolio Portfolio Selection                 ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    print_report("Best portfolio (equal weight)", &result.best);

    for (i, alt) in result.alternatives.iter().enumerate() {
        println!("╠════════════════════════════════════════════════════════════╣");
        print_report(&format!("Alternative {}", i + 1), alt);
    }

    println!("╠════════════════════════════════════════════════════════════╣");
    let meta = &result.metadata;
    let elapsed = result
        .timing
        .as_ref()
        .map_or_else(|| "-".to_string(), |t| t.optimization_time_ms.to_string());
    println!(
        "║  Candidates: {:<4} Trials: {:<6} Useful: {:<6} {:>6} ms  ║",
        meta.candidates, meta.trials, meta.useful_samples, elapsed
    );
    println!(
        "║  Shrinkage: {:<6.3} Condition number: {:<12.1}         ║",
        meta.shrinkage, meta.condition_number
    );

    if !result.warnings.is_empty() {
        println!("╠════════════════════════════════════════════════════════════╣");
        for w in &result.warnings {
            println!("║  ⚠ {}", w);
        }
    }

    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("⚠  Educational use only. Not financial advice.");
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
