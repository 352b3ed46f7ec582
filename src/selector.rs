use crate::config::{MIN_HISTORY_PERIODS, MIN_VOLATILITY, TRADING_DAYS};
use crate::data::DataProvider;
use crate::error::{OptimizeError, Result};
use crate::risk::{correlation_matrix, sample_mean, sample_std};
use crate::sector::{Sector, SectorHistogram, histogram};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// An instrument that passed the completeness check, with its summary stats.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub ticker: String,
    pub sector: Sector,
    /// Long-window (risk/correlation) returns, oldest first.
    pub long_returns: Vec<f64>,
    /// Annualized short-window mean return.
    pub mean_return: f64,
    /// Annualized long-window volatility.
    pub volatility: f64,
    pub sharpe: f64,
}

/// An instrument dropped before ranking, and why.
#[derive(Clone, Debug, Serialize)]
pub struct Exclusion {
    pub ticker: String,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct SelectionConfig {
    /// Periods in the short (ranking) window.
    pub return_periods: usize,
    /// Periods in the long (covariance / correlation) window.
    pub risk_periods: usize,
    pub top_k_per_sector: usize,
    pub distance_threshold: f64,
    pub max_per_cluster: usize,
    pub min_sharpe: f64,
    pub risk_free_rate: f64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SelectionSummary {
    pub universe_size: usize,
    pub excluded: Vec<Exclusion>,
    /// Per-sector counts after top-N filtering, before de-duplication.
    pub ranked_per_sector: SectorHistogram,
    pub ranked: usize,
    pub pooled: usize,
    pub clusters: usize,
    pub distance_threshold: f64,
}

/// De-duplicated candidates in ranked order (sector, then rank within sector).
#[derive(Clone, Debug, Default)]
pub struct CandidatePool {
    candidates: Vec<Candidate>,
    pub summary: SelectionSummary,
}

impl CandidatePool {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn tickers(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.ticker.clone()).collect()
    }

    pub fn long_returns(&self) -> Vec<&[f64]> {
        self.candidates.iter().map(|c| c.long_returns.as_slice()).collect()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Loading and completeness
// ──────────────────────────────────────────────────────────────────────────────

fn summarize(
    ticker: &str,
    sector: Sector,
    series: &[f64],
    config: &SelectionConfig,
) -> std::result::Result<Candidate, OptimizeError> {
    let long_window = config.risk_periods.max(MIN_HISTORY_PERIODS);
    let required = long_window.max(config.return_periods);
    if series.len() < required {
        return Err(OptimizeError::InsufficientHistory {
            ticker: ticker.to_string(),
            required,
            available: series.len(),
        });
    }
    if series.iter().any(|r| !r.is_finite()) {
        return Err(OptimizeError::DegenerateSeries {
            ticker: ticker.to_string(),
        });
    }

    let long = &series[series.len() - long_window..];
    let short = &series[series.len() - config.return_periods..];

    let volatility = sample_std(long) * TRADING_DAYS.sqrt();
    if !volatility.is_finite() || volatility < MIN_VOLATILITY {
        return Err(OptimizeError::DegenerateSeries {
            ticker: ticker.to_string(),
        });
    }

    let mean_return = sample_mean(short) * TRADING_DAYS;
    let sharpe = (sample_mean(long) * TRADING_DAYS - config.risk_free_rate) / volatility;

    Ok(Candidate {
        ticker: ticker.to_string(),
        sector,
        long_returns: long.to_vec(),
        mean_return,
        volatility,
        sharpe,
    })
}

/// Pulls every instrument from the provider and drops those that fail the
/// completeness check or the minimum-Sharpe filter.
pub fn load_candidates(
    provider: &dyn DataProvider,
    config: &SelectionConfig,
) -> (Vec<Candidate>, Vec<Exclusion>) {
    let fetch = config
        .risk_periods
        .max(MIN_HISTORY_PERIODS)
        .max(config.return_periods);

    let mut candidates = Vec::new();
    let mut excluded = Vec::new();
    for (ticker, sector) in provider.universe() {
        let Some(series) = provider.returns(&ticker, fetch) else {
            warn!("No return series for {}; excluding", ticker);
            excluded.push(Exclusion {
                ticker,
                reason: "no return series".to_string(),
            });
            continue;
        };
        match summarize(&ticker, sector, series, config) {
            Ok(c) if c.sharpe < config.min_sharpe => {
                debug!("{} below minimum Sharpe ({:.2})", c.ticker, c.sharpe);
                excluded.push(Exclusion {
                    reason: format!(
                        "Sharpe {:.2} below minimum {:.2}",
                        c.sharpe, config.min_sharpe
                    ),
                    ticker,
                });
            }
            Ok(c) => candidates.push(c),
            Err(e) => {
                warn!("Excluding {}: {}", ticker, e);
                excluded.push(Exclusion {
                    ticker,
                    reason: e.to_string(),
                });
            }
        }
    }
    (candidates, excluded)
}

// ──────────────────────────────────────────────────────────────────────────────
// Ranking
// ──────────────────────────────────────────────────────────────────────────────

/// Mean return desc, Sharpe desc, ticker asc.
fn rank_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.mean_return
        .total_cmp(&a.mean_return)
        .then_with(|| b.sharpe.total_cmp(&a.sharpe))
        .then_with(|| a.ticker.cmp(&b.ticker))
}

/// Sharpe desc, mean return desc, ticker asc.
fn cluster_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.sharpe
        .total_cmp(&a.sharpe)
        .then_with(|| b.mean_return.total_cmp(&a.mean_return))
        .then_with(|| a.ticker.cmp(&b.ticker))
}

/// Keeps the `top_k_per_sector` best-ranked instruments of each sector.
/// Output is grouped by sector (enumeration order), ranked within each group.
pub fn filter_by_sector(candidates: Vec<Candidate>, top_k_per_sector: usize) -> Vec<Candidate> {
    let mut by_sector: BTreeMap<Sector, Vec<Candidate>> = BTreeMap::new();
    for c in candidates {
        by_sector.entry(c.sector).or_default().push(c);
    }

    let mut ranked = Vec::new();
    for (sector, mut group) in by_sector {
        group.sort_by(rank_order);
        group.truncate(top_k_per_sector);
        debug!("{}: kept {} candidates", sector, group.len());
        ranked.extend(group);
    }
    ranked
}

// ──────────────────────────────────────────────────────────────────────────────
// Correlation clustering
// ──────────────────────────────────────────────────────────────────────────────

/// Agglomerative average-linkage clustering over a distance matrix, cut at
/// `threshold`. Returns a cluster label per point; labels are numbered in
/// order of each cluster's lowest point index.
pub fn cluster_average_linkage(distance: &[Vec<f64>], threshold: f64) -> Vec<usize> {
    let n = distance.len();
    let mut d: Vec<Vec<f64>> = distance.to_vec();
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut active = vec![true; n];

    loop {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..n {
            if !active[i] {
                continue;
            }
            for j in (i + 1)..n {
                if !active[j] {
                    continue;
                }
                if best.is_none_or(|(_, _, v)| d[i][j] < v) {
                    best = Some((i, j, d[i][j]));
                }
            }
        }
        let Some((i, j, dist)) = best else { break };
        if dist > threshold {
            break;
        }

        // Lance-Williams update for average linkage.
        let (ni, nj) = (members[i].len() as f64, members[j].len() as f64);
        for k in 0..n {
            if !active[k] || k == i || k == j {
                continue;
            }
            let merged = (ni * d[i][k] + nj * d[j][k]) / (ni + nj);
            d[i][k] = merged;
            d[k][i] = merged;
        }
        let absorbed = std::mem::take(&mut members[j]);
        members[i].extend(absorbed);
        active[j] = false;
    }

    let mut labels = vec![0; n];
    for (label, slot) in (0..n).filter(|&s| active[s]).enumerate() {
        for &m in &members[slot] {
            labels[m] = label;
        }
    }
    labels
}

/// Suppresses near-duplicate instruments: clusters the candidates on
/// `1 − correlation` over the last `correlation_window` periods and keeps at
/// most `max_per_cluster` per cluster. Survivors keep their input order.
///
/// Returns the survivors and the number of clusters found.
pub fn deduplicate(
    ranked: Vec<Candidate>,
    correlation_window: usize,
    distance_threshold: f64,
    max_per_cluster: usize,
) -> (Vec<Candidate>, usize) {
    if ranked.len() < 2 {
        let n = ranked.len();
        return (ranked, n);
    }

    let tails: Vec<&[f64]> = ranked
        .iter()
        .map(|c| {
            let start = c.long_returns.len().saturating_sub(correlation_window);
            &c.long_returns[start..]
        })
        .collect();
    let corr = correlation_matrix(&tails);
    let distance: Vec<Vec<f64>> = corr
        .iter()
        .enumerate()
        .map(|(i, row)| {
            row.iter()
                .enumerate()
                .map(|(j, c)| if i == j { 0.0 } else { (1.0 - c).clamp(0.0, 2.0) })
                .collect()
        })
        .collect();

    let labels = cluster_average_linkage(&distance, distance_threshold);
    let cluster_count = labels.iter().max().map(|m| m + 1).unwrap_or(0);

    let mut clusters: Vec<Vec<usize>> = vec![Vec::new(); cluster_count];
    for (idx, &label) in labels.iter().enumerate() {
        clusters[label].push(idx);
    }

    let mut keep = vec![false; ranked.len()];
    for cluster in &mut clusters {
        if cluster.len() > max_per_cluster {
            let dropped: Vec<&str> = cluster.iter().map(|&i| ranked[i].ticker.as_str()).collect();
            debug!("Cluster {:?} exceeds cap {}", dropped, max_per_cluster);
        }
        cluster.sort_by(|&a, &b| cluster_order(&ranked[a], &ranked[b]));
        for &idx in cluster.iter().take(max_per_cluster) {
            keep[idx] = true;
        }
    }

    let pooled = ranked
        .into_iter()
        .zip(keep)
        .filter_map(|(c, k)| k.then_some(c))
        .collect();
    (pooled, cluster_count)
}

/// Runs the full selection: completeness, quality filter, per-sector top-N,
/// then correlation de-duplication.
pub fn select_candidates(provider: &dyn DataProvider, config: &SelectionConfig) -> Result<CandidatePool> {
    if config.top_k_per_sector == 0 || config.max_per_cluster == 0 {
        return Err(OptimizeError::InvalidConstraints(
            "top_k_per_sector and max_per_cluster must be at least 1".to_string(),
        ));
    }
    if !config.distance_threshold.is_finite() || config.distance_threshold < 0.0 {
        return Err(OptimizeError::InvalidConstraints(format!(
            "distance threshold must be non-negative, got {}",
            config.distance_threshold
        )));
    }

    let universe_size = provider.universe().len();
    let (candidates, excluded) = load_candidates(provider, config);
    if !excluded.is_empty() {
        info!(
            "Excluded {} of {} instruments before ranking",
            excluded.len(),
            universe_size
        );
    }

    let ranked = filter_by_sector(candidates, config.top_k_per_sector);
    let ranked_per_sector = histogram(ranked.iter().map(|c| c.sector));
    let ranked_count = ranked.len();

    let (pooled, clusters) = deduplicate(
        ranked,
        config.risk_periods.max(MIN_HISTORY_PERIODS),
        config.distance_threshold,
        config.max_per_cluster,
    );

    info!(
        "Candidate pool: {} -> {} instruments across {} clusters (threshold {:.2})",
        ranked_count,
        pooled.len(),
        clusters,
        config.distance_threshold
    );

    let summary = SelectionSummary {
        universe_size,
        excluded,
        ranked_per_sector,
        ranked: ranked_count,
        pooled: pooled.len(),
        clusters,
        distance_threshold: config.distance_threshold,
    };
    Ok(CandidatePool {
        candidates: pooled,
        summary,
    })
}
