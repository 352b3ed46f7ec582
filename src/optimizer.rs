use crate::config::{SHADOW_SAMPLES, SHARPE_CLIP, TRIAL_BLOCK_SIZE};
use crate::error::{OptimizeError, Result};
use crate::risk::CovarianceMatrix;
use crate::sector::{SECTOR_COUNT, Sector};
use rand::prelude::*;
use rand::rngs::StdRng;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Relative margin a swap's estimated variance must beat before it is
/// re-evaluated exactly.
const SWAP_IMPROVEMENT_EPS: f64 = 1e-12;

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

/// How a local-search round picks its swap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapPolicy {
    /// Scan every (member, non-member) pair and apply the single best swap.
    #[default]
    BestOfRound,
    /// Apply the first improving swap in (member, candidate) index order.
    FirstImproving,
}

/// Hard sector rules checked before any risk computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SectorRules {
    pub max_per_sector: usize,
    pub min_sectors: usize,
}

#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Instruments per portfolio.
    pub n: usize,
    pub min_return: f64,
    pub rules: SectorRules,
    /// Useful (return-gate passing) samples to collect.
    pub iterations: usize,
    /// Total trials allowed, useful or not.
    pub max_trials: usize,
    pub time_budget: Duration,
    pub top_k: usize,
    pub swap_rounds: usize,
    pub swap_policy: SwapPolicy,
    pub temperature: f64,
    pub jaccard_threshold: f64,
    pub workers: usize,
    pub seed: u64,
}

/// Immutable per-call inputs, all indexed like the candidate pool.
pub struct SearchInputs<'a> {
    sectors: Vec<Sector>,
    returns: Vec<f64>,
    sharpes: Vec<f64>,
    cov: &'a CovarianceMatrix,
}

impl<'a> SearchInputs<'a> {
    pub fn new(
        sectors: Vec<Sector>,
        returns: Vec<f64>,
        sharpes: Vec<f64>,
        cov: &'a CovarianceMatrix,
    ) -> Result<Self> {
        let n = cov.len();
        if sectors.len() != n || returns.len() != n || sharpes.len() != n {
            return Err(OptimizeError::DimensionMismatch(format!(
                "search inputs disagree: {} sectors, {} returns, {} Sharpe ratios, {}x{} covariance",
                sectors.len(),
                returns.len(),
                sharpes.len(),
                n,
                n
            )));
        }
        Ok(Self {
            sectors,
            returns,
            sharpes,
            cov,
        })
    }

    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }

    pub fn expected_return(&self, members: &[usize]) -> f64 {
        if members.is_empty() {
            return 0.0;
        }
        members.iter().map(|&m| self.returns[m]).sum::<f64>() / members.len() as f64
    }

    /// Equal-weighted wᵀΣw.
    pub fn variance(&self, members: &[usize]) -> f64 {
        if members.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        for &i in members {
            for &j in members {
                total += self.cov.get(i, j);
            }
        }
        let n = members.len() as f64;
        (total / (n * n)).max(0.0)
    }

    /// Scores a member set; members are stored sorted.
    pub fn evaluate(&self, mut members: Vec<usize>) -> Portfolio {
        members.sort_unstable();
        Portfolio {
            expected_return: self.expected_return(&members),
            variance: self.variance(&members),
            members,
        }
    }
}

/// An equal-weighted subset of the candidate pool.
#[derive(Clone, Debug, PartialEq)]
pub struct Portfolio {
    /// Pool indices, ascending.
    pub members: Vec<usize>,
    pub expected_return: f64,
    pub variance: f64,
}

impl Portfolio {
    pub fn risk(&self) -> f64 {
        self.variance.sqrt()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Sampling
// ──────────────────────────────────────────────────────────────────────────────

pub fn softmax(values: &[f64], temperature: f64) -> Vec<f64> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = values.iter().map(|v| ((v - max) / temperature).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Softmax over clipped Sharpe ratios. Non-finite ratios count as zero.
pub fn sampling_weights(sharpes: &[f64], temperature: f64) -> Vec<f64> {
    let clipped: Vec<f64> = sharpes
        .iter()
        .map(|s| if s.is_nan() { 0.0 } else { s.clamp(-SHARPE_CLIP, SHARPE_CLIP) })
        .collect();
    softmax(&clipped, temperature)
}

/// Draws `n` distinct pool indices, weighted, returned in ascending order.
fn sample_members(rng: &mut StdRng, weights: &[f64], n: usize) -> Option<Vec<usize>> {
    let indices: Vec<usize> = (0..weights.len()).collect();
    let mut members: Vec<usize> = indices
        .choose_multiple_weighted(rng, n, |&i| weights[i])
        .ok()?
        .copied()
        .collect();
    if members.len() != n {
        return None;
    }
    members.sort_unstable();
    Some(members)
}

pub fn check_sector_constraints(members: &[usize], sectors: &[Sector], rules: &SectorRules) -> bool {
    let mut counts = [0usize; SECTOR_COUNT];
    let mut distinct = 0;
    for &m in members {
        let count = &mut counts[sectors[m].index()];
        if *count == 0 {
            distinct += 1;
        }
        *count += 1;
        if *count > rules.max_per_sector {
            return false;
        }
    }
    distinct >= rules.min_sectors
}

// ──────────────────────────────────────────────────────────────────────────────
// Local search
// ──────────────────────────────────────────────────────────────────────────────

/// Greedy single-swap descent. Each round applies at most one swap, which
/// must strictly lower variance while keeping the return floor and sector
/// rules; stops early once no such swap exists.
pub fn local_search(start: Portfolio, inputs: &SearchInputs, config: &SearchConfig) -> Portfolio {
    let pool = inputs.len();
    let n = start.members.len();
    if n == 0 || n >= pool {
        return start;
    }
    let nf = n as f64;
    let cov = inputs.cov;
    let mut current = start;

    for _ in 0..config.swap_rounds {
        let mut in_set = vec![false; pool];
        let mut counts = [0usize; SECTOR_COUNT];
        for &m in &current.members {
            in_set[m] = true;
            counts[inputs.sectors[m].index()] += 1;
        }
        let distinct = counts.iter().filter(|&&c| c > 0).count();

        // Σ_{j∈S} cov[c][j] for every pool index c.
        let row_sum: Vec<f64> = (0..pool)
            .map(|c| current.members.iter().map(|&j| cov.get(c, j)).sum())
            .collect();
        let total = current.variance * nf * nf;
        let return_sum = current.expected_return * nf;
        let limit = current.variance - SWAP_IMPROVEMENT_EPS * current.variance.abs().max(f64::MIN_POSITIVE);

        let mut best: Option<(usize, usize, f64)> = None;
        'scan: for (pos, &out) in current.members.iter().enumerate() {
            let out_sector = inputs.sectors[out].index();
            for cand in 0..pool {
                if in_set[cand] {
                    continue;
                }
                if (return_sum - inputs.returns[out] + inputs.returns[cand]) / nf < config.min_return {
                    continue;
                }
                let cand_sector = inputs.sectors[cand].index();
                if cand_sector != out_sector {
                    let new_distinct = distinct - usize::from(counts[out_sector] == 1)
                        + usize::from(counts[cand_sector] == 0);
                    if counts[cand_sector] + 1 > config.rules.max_per_sector
                        || new_distinct < config.rules.min_sectors
                    {
                        continue;
                    }
                }

                let c_oo = cov.get(out, out);
                let new_total = total - 2.0 * (row_sum[out] - c_oo) - c_oo
                    + 2.0 * (row_sum[cand] - cov.get(cand, out))
                    + cov.get(cand, cand);
                let new_var = new_total / (nf * nf);
                if new_var >= limit {
                    continue;
                }
                if best.is_none_or(|(_, _, v)| new_var < v) {
                    best = Some((pos, cand, new_var));
                    if config.swap_policy == SwapPolicy::FirstImproving {
                        break 'scan;
                    }
                }
            }
        }

        let Some((pos, cand, _)) = best else { break };
        let mut members = current.members.clone();
        members[pos] = cand;
        let swapped = inputs.evaluate(members);
        if swapped.variance < current.variance && swapped.expected_return >= config.min_return {
            current = swapped;
        } else {
            break;
        }
    }
    current
}

// ──────────────────────────────────────────────────────────────────────────────
// Best-K retention
// ──────────────────────────────────────────────────────────────────────────────

/// |A ∩ B| / |A ∪ B| over ascending member lists.
pub fn jaccard(a: &[usize], b: &[usize]) -> f64 {
    let (mut i, mut j, mut common) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                common += 1;
                i += 1;
                j += 1;
            }
        }
    }
    let union = a.len() + b.len() - common;
    if union == 0 { 1.0 } else { common as f64 / union as f64 }
}

fn risk_order(a: &Portfolio, b: &Portfolio) -> Ordering {
    a.variance
        .total_cmp(&b.variance)
        .then_with(|| a.members.cmp(&b.members))
}

/// Up to `capacity` lowest-variance portfolios, no two of them near-duplicates.
#[derive(Clone, Debug)]
pub struct BestK {
    capacity: usize,
    threshold: f64,
    items: Vec<Portfolio>,
}

impl BestK {
    pub fn new(capacity: usize, threshold: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            threshold,
            items: Vec::with_capacity(capacity + 1),
        }
    }

    fn near_duplicate(&self, a: &Portfolio, b: &Portfolio) -> bool {
        a.members == b.members || jaccard(&a.members, &b.members) >= self.threshold
    }

    /// Inserts `candidate` unless a retained near-duplicate is at least as
    /// good; evicts near-duplicates it beats. Returns whether it was kept.
    pub fn offer(&mut self, candidate: Portfolio) -> bool {
        if self
            .items
            .iter()
            .any(|q| self.near_duplicate(q, &candidate) && risk_order(q, &candidate) != Ordering::Greater)
        {
            return false;
        }
        let threshold = self.threshold;
        self.items.retain(|q| {
            !(q.members == candidate.members || jaccard(&q.members, &candidate.members) >= threshold)
        });
        let members = candidate.members.clone();
        self.items.push(candidate);
        self.items.sort_by(risk_order);
        self.items.truncate(self.capacity);
        self.items.iter().any(|q| q.members == members)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_sorted(self) -> Vec<Portfolio> {
        self.items
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Feasibility
// ──────────────────────────────────────────────────────────────────────────────

/// Explains why no `n`-subset of `sectors` can satisfy `rules`, if none can.
pub fn sector_infeasibility(sectors: &[Sector], n: usize, rules: &SectorRules) -> Option<String> {
    if sectors.len() < n {
        return Some(format!(
            "candidate pool has {} instruments, {} requested",
            sectors.len(),
            n
        ));
    }
    if rules.min_sectors > n {
        return Some(format!(
            "{} sectors required but only {} instruments requested",
            rules.min_sectors, n
        ));
    }
    let mut counts = [0usize; SECTOR_COUNT];
    for s in sectors {
        counts[s.index()] += 1;
    }
    let distinct = counts.iter().filter(|&&c| c > 0).count();
    if distinct < rules.min_sectors {
        return Some(format!(
            "{} sectors required but candidates span only {}",
            rules.min_sectors, distinct
        ));
    }
    let capacity: usize = counts.iter().map(|&c| c.min(rules.max_per_sector)).sum();
    if capacity < n {
        return Some(format!(
            "at most {} per sector allows only {} instruments, {} requested",
            rules.max_per_sector, capacity, n
        ));
    }
    None
}

/// Loosest adjustment of `rules` that admits an `n`-subset of `sectors`:
/// fewer required sectors first, then a higher per-sector cap.
pub fn relax_rules(sectors: &[Sector], n: usize, rules: &SectorRules) -> SectorRules {
    let mut counts = [0usize; SECTOR_COUNT];
    for s in sectors {
        counts[s.index()] += 1;
    }
    let distinct = counts.iter().filter(|&&c| c > 0).count();
    let mut relaxed = SectorRules {
        max_per_sector: rules.max_per_sector.max(1),
        min_sectors: rules.min_sectors.min(distinct).min(n),
    };
    while counts.iter().map(|&c| c.min(relaxed.max_per_sector)).sum::<usize>() < n
        && relaxed.max_per_sector < n
    {
        relaxed.max_per_sector += 1;
    }
    relaxed
}

/// High-return `n`-subset built directly under `rules`: the top member of the
/// `min_sectors` strongest sectors, then the best remaining members up to the
/// per-sector cap. `None` when the rules admit no `n`-subset.
pub fn greedy_return_subset(sectors: &[Sector], returns: &[f64], n: usize, rules: &SectorRules) -> Option<Vec<usize>> {
    if sectors.len() != returns.len() || sector_infeasibility(sectors, n, rules).is_some() {
        return None;
    }
    let mut order: Vec<usize> = (0..returns.len()).collect();
    order.sort_by(|&a, &b| returns[b].total_cmp(&returns[a]).then(a.cmp(&b)));

    let mut counts = [0usize; SECTOR_COUNT];
    let mut taken = vec![false; returns.len()];
    let mut members = Vec::with_capacity(n);
    for &i in &order {
        if members.len() == rules.min_sectors {
            break;
        }
        let s = sectors[i].index();
        if counts[s] == 0 {
            counts[s] = 1;
            taken[i] = true;
            members.push(i);
        }
    }
    for &i in &order {
        if members.len() == n {
            break;
        }
        let s = sectors[i].index();
        if taken[i] || counts[s] >= rules.max_per_sector {
            continue;
        }
        counts[s] += 1;
        taken[i] = true;
        members.push(i);
    }

    members.sort_unstable();
    (members.len() == n && check_sector_constraints(&members, sectors, rules)).then_some(members)
}

// ──────────────────────────────────────────────────────────────────────────────
// Search
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize)]
pub struct SearchStats {
    pub trials: usize,
    pub useful: usize,
    pub sector_rejected: usize,
    pub return_rejected: usize,
    /// Accepted samples that local search improved.
    pub improved: usize,
    pub timed_out: bool,
    pub elapsed_ms: u64,
    pub workers: usize,
}

#[derive(Clone, Debug)]
pub struct SearchOutcome {
    /// Ascending variance; empty only if no trial produced a sample at all.
    pub portfolios: Vec<Portfolio>,
    /// True when no sample met the floor and `portfolios` holds the fallback.
    pub relaxed: bool,
    /// Best return observed when the floor was unreachable.
    pub achievable_return: Option<f64>,
    /// The sector rules admitted no portfolio and `portfolios` holds a
    /// rule-breaking sample.
    pub sector_rules_broken: bool,
    /// Lowest-variance floor-meeting sample that the sector rules rejected.
    pub unconstrained_best: Option<Portfolio>,
    pub stats: SearchStats,
}

enum TrialOutcome {
    Failed,
    SectorRejected { members: Vec<usize>, expected_return: f64 },
    ReturnRejected { members: Vec<usize>, expected_return: f64 },
    Accepted { portfolio: Portfolio, improved: bool },
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn trial_seed(seed: u64, trial: usize) -> u64 {
    splitmix64(seed ^ splitmix64(trial as u64))
}

fn run_trial(trial: usize, inputs: &SearchInputs, weights: &[f64], config: &SearchConfig) -> TrialOutcome {
    let mut rng = StdRng::seed_from_u64(trial_seed(config.seed, trial));
    let Some(members) = sample_members(&mut rng, weights, config.n) else {
        return TrialOutcome::Failed;
    };
    let expected_return = inputs.expected_return(&members);

    if !check_sector_constraints(&members, &inputs.sectors, &config.rules) {
        return TrialOutcome::SectorRejected {
            members,
            expected_return,
        };
    }
    if expected_return < config.min_return {
        return TrialOutcome::ReturnRejected {
            members,
            expected_return,
        };
    }

    let sampled = inputs.evaluate(members);
    let sampled_variance = sampled.variance;
    let portfolio = local_search(sampled, inputs, config);
    TrialOutcome::Accepted {
        improved: portfolio.variance < sampled_variance,
        portfolio,
    }
}

/// Highest return, then lowest member list.
fn better_return(candidate: (f64, &[usize]), incumbent: &Option<(f64, Vec<usize>)>) -> bool {
    match incumbent {
        None => true,
        Some((ret, members)) => match candidate.0.total_cmp(ret) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => candidate.1 < members.as_slice(),
        },
    }
}

struct SearchState {
    best: BestK,
    stats: SearchStats,
    best_valid_return: Option<(f64, Vec<usize>)>,
    best_any_return: Option<(f64, Vec<usize>)>,
    shadows: Vec<Vec<usize>>,
}

impl SearchState {
    fn absorb(&mut self, outcome: TrialOutcome, min_return: f64) {
        self.stats.trials += 1;
        match outcome {
            TrialOutcome::Failed => {}
            TrialOutcome::SectorRejected {
                members,
                expected_return,
            } => {
                self.stats.sector_rejected += 1;
                if expected_return >= min_return && self.shadows.len() < SHADOW_SAMPLES {
                    self.shadows.push(members.clone());
                }
                if better_return((expected_return, members.as_slice()), &self.best_any_return) {
                    self.best_any_return = Some((expected_return, members));
                }
            }
            TrialOutcome::ReturnRejected {
                members,
                expected_return,
            } => {
                self.stats.return_rejected += 1;
                if better_return((expected_return, members.as_slice()), &self.best_valid_return) {
                    self.best_valid_return = Some((expected_return, members));
                }
            }
            TrialOutcome::Accepted { portfolio, improved } => {
                self.stats.useful += 1;
                if improved {
                    self.stats.improved += 1;
                }
                self.best.offer(portfolio);
            }
        }
    }
}

fn validate(inputs: &SearchInputs, config: &SearchConfig) -> Result<()> {
    if inputs.is_empty() || config.n == 0 || config.n > inputs.len() {
        return Err(OptimizeError::InvalidConstraints(format!(
            "cannot pick {} instruments from a pool of {}",
            config.n,
            inputs.len()
        )));
    }
    if !(config.temperature > 0.0 && config.temperature.is_finite()) {
        return Err(OptimizeError::InvalidConstraints(format!(
            "temperature must be positive, got {}",
            config.temperature
        )));
    }
    if config.iterations == 0 || config.max_trials == 0 || config.top_k == 0 {
        return Err(OptimizeError::InvalidConstraints(
            "iterations, max_trials and top_k must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn search_blocks(inputs: &SearchInputs, weights: &[f64], config: &SearchConfig) -> SearchState {
    let started = Instant::now();
    let mut state = SearchState {
        best: BestK::new(config.top_k, config.jaccard_threshold),
        stats: SearchStats::default(),
        best_valid_return: None,
        best_any_return: None,
        shadows: Vec::new(),
    };

    let mut next = 0usize;
    while state.stats.useful < config.iterations && next < config.max_trials {
        if next > 0 && started.elapsed() >= config.time_budget {
            state.stats.timed_out = true;
            break;
        }
        let end = (next + TRIAL_BLOCK_SIZE).min(config.max_trials);
        let outcomes: Vec<TrialOutcome> = (next..end)
            .into_par_iter()
            .map(|t| run_trial(t, inputs, weights, config))
            .collect();
        // Fold in trial order so the stopping point never depends on scheduling.
        for outcome in outcomes {
            if state.stats.useful >= config.iterations {
                break;
            }
            state.absorb(outcome, config.min_return);
        }
        next = end;
    }

    state.stats.elapsed_ms = started.elapsed().as_millis() as u64;
    state
}

/// Sharpe-weighted sampling plus greedy local search over equal-weighted
/// `n`-subsets of the pool.
///
/// Trial `t` draws from its own RNG seeded by `(seed, t)`, and trial outcomes
/// are folded in index order, so the result does not depend on `workers`
/// unless the time budget cuts the run short.
pub fn run_search(inputs: &SearchInputs, config: &SearchConfig) -> Result<SearchOutcome> {
    validate(inputs, config)?;
    let weights = sampling_weights(&inputs.sharpes, config.temperature);
    let workers = config.workers.max(1);

    let state = match ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => pool.install(|| search_blocks(inputs, &weights, config)),
        Err(e) => {
            warn!("Could not build a {}-thread search pool ({}); using the global pool", workers, e);
            search_blocks(inputs, &weights, config)
        }
    };

    let SearchState {
        best,
        mut stats,
        best_valid_return,
        best_any_return,
        shadows,
    } = state;
    stats.workers = workers;

    let mut relaxed = false;
    let mut achievable_return = None;
    let mut sector_rules_broken = false;
    debug!("Retained {} portfolios", best.len());
    let fallback_needed = best.is_empty();
    let mut portfolios = best.into_sorted();
    if fallback_needed {
        let constructed = greedy_return_subset(&inputs.sectors, &inputs.returns, config.n, &config.rules)
            .map(|members| inputs.evaluate(members));
        match constructed {
            Some(built) if built.expected_return >= config.min_return => {
                warn!(
                    "No sampled portfolio passed the sector rules and return floor; refining a constructed one ({:.2}%)",
                    built.expected_return * 100.0
                );
                portfolios.push(local_search(built, inputs, config));
            }
            constructed => {
                let sampled = best_valid_return.map(|(_, members)| inputs.evaluate(members));
                let fallback = constructed.into_iter().chain(sampled).max_by(|a, b| {
                    a.expected_return
                        .total_cmp(&b.expected_return)
                        .then_with(|| b.members.cmp(&a.members))
                });
                if let Some(portfolio) = fallback {
                    warn!(
                        "No portfolio meets the {:.2}% return floor; best achievable {:.2}%",
                        config.min_return * 100.0,
                        portfolio.expected_return * 100.0
                    );
                    relaxed = true;
                    achievable_return = Some(portfolio.expected_return);
                    portfolios.push(portfolio);
                } else if let Some((_, members)) = best_any_return {
                    let portfolio = inputs.evaluate(members);
                    warn!(
                        "Sector rules admit no {}-instrument portfolio; returning a rule-breaking sample",
                        config.n
                    );
                    sector_rules_broken = true;
                    if portfolio.expected_return < config.min_return {
                        relaxed = true;
                        achievable_return = Some(portfolio.expected_return);
                    }
                    portfolios.push(portfolio);
                }
            }
        }
    }

    let unconstrained_best = shadows
        .into_iter()
        .map(|m| inputs.evaluate(m))
        .min_by(risk_order);

    info!(
        "Search finished: {} trials, {} useful, {} sector-rejected, {} below floor, {} improved by local search ({} ms{})",
        stats.trials,
        stats.useful,
        stats.sector_rejected,
        stats.return_rejected,
        stats.improved,
        stats.elapsed_ms,
        if stats.timed_out { ", time budget hit" } else { "" }
    );
    Ok(SearchOutcome {
        portfolios,
        relaxed,
        achievable_return,
        sector_rules_broken,
        unconstrained_best,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::{Shrinkage, estimate_covariance};
    use proptest::prelude::*;
    use rand_distr::StandardNormal;

    struct Fixture {
        sectors: Vec<Sector>,
        returns: Vec<f64>,
        sharpes: Vec<f64>,
        cov: CovarianceMatrix,
    }

    impl Fixture {
        fn inputs(&self) -> SearchInputs<'_> {
            SearchInputs::new(
                self.sectors.clone(),
                self.returns.clone(),
                self.sharpes.clone(),
                &self.cov,
            )
            .unwrap()
        }
    }

    /// `per_sector` instruments in each of `sector_count` sectors with random
    /// volatilities and a shared market factor.
    fn fixture(sector_count: usize, per_sector: usize, seed: u64) -> Fixture {
        let mut rng = StdRng::seed_from_u64(seed);
        let t = 120;
        let market: Vec<f64> = (0..t).map(|_| 0.01 * rng.sample::<f64, _>(StandardNormal)).collect();
        let mut sectors = Vec::new();
        let mut series = Vec::new();
        let mut returns = Vec::new();
        let mut sharpes = Vec::new();
        for s in 0..sector_count {
            for _ in 0..per_sector {
                let beta = rng.gen_range(0.2..1.5);
                let idio = rng.gen_range(0.005..0.02);
                let r: Vec<f64> = market
                    .iter()
                    .map(|m| beta * m + idio * rng.sample::<f64, _>(StandardNormal))
                    .collect();
                sectors.push(Sector::ALL[s]);
                series.push(r);
                returns.push(rng.gen_range(-0.05..0.30));
                sharpes.push(rng.gen_range(-1.0..3.0));
            }
        }
        let tickers: Vec<String> = (0..series.len()).map(|i| format!("S{:02}", i)).collect();
        let slices: Vec<&[f64]> = series.iter().map(|r| r.as_slice()).collect();
        let cov = estimate_covariance(&tickers, &slices, Shrinkage::LedoitWolf).unwrap();
        Fixture {
            sectors,
            returns,
            sharpes,
            cov,
        }
    }

    /// Forty high-Sharpe Energy names plus one low-Sharpe name in each other
    /// sector, all with independent noise.
    fn energy_heavy_fixture() -> Fixture {
        let mut rng = StdRng::seed_from_u64(77);
        let mut sectors = vec![Sector::Energy; 40];
        sectors.extend(Sector::ALL.iter().copied().filter(|&s| s != Sector::Energy));
        let returns: Vec<f64> = sectors
            .iter()
            .map(|&s| if s == Sector::Energy { 0.20 } else { 0.10 })
            .collect();
        let sharpes: Vec<f64> = sectors
            .iter()
            .map(|&s| if s == Sector::Energy { 3.0 } else { -1.0 })
            .collect();
        let series: Vec<Vec<f64>> = sectors
            .iter()
            .map(|_| (0..120).map(|_| 0.01 * rng.sample::<f64, _>(StandardNormal)).collect())
            .collect();
        let tickers: Vec<String> = (0..series.len()).map(|i| format!("E{:02}", i)).collect();
        let slices: Vec<&[f64]> = series.iter().map(|r| r.as_slice()).collect();
        let cov = estimate_covariance(&tickers, &slices, Shrinkage::LedoitWolf).unwrap();
        Fixture {
            sectors,
            returns,
            sharpes,
            cov,
        }
    }

    fn one_per_sector() -> SectorRules {
        SectorRules {
            max_per_sector: 1,
            min_sectors: 11,
        }
    }

    fn config(n: usize) -> SearchConfig {
        SearchConfig {
            n,
            min_return: 0.0,
            rules: SectorRules {
                max_per_sector: 2,
                min_sectors: 2,
            },
            iterations: 200,
            max_trials: 4000,
            time_budget: Duration::from_secs(60),
            top_k: 3,
            swap_rounds: 5,
            swap_policy: SwapPolicy::BestOfRound,
            temperature: 2.0,
            jaccard_threshold: 0.8,
            workers: 2,
            seed: 42,
        }
    }

    #[test]
    fn test_softmax_temperature_flattens() {
        let s = [3.0, 0.0, -1.0];
        let cold = sampling_weights(&s, 0.5);
        let hot = sampling_weights(&s, 50.0);
        assert!((cold.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(cold[0] > hot[0]);
        assert!(hot.iter().all(|w| (w - 1.0 / 3.0).abs() < 0.05));
    }

    #[test]
    fn test_sampling_weights_clip_and_handle_nan() {
        let w = sampling_weights(&[f64::NAN, 100.0, 5.0], 1.0);
        assert!(w.iter().all(|v| v.is_finite() && *v > 0.0));
        assert!((w[1] - w[2]).abs() < 1e-12);
    }

    #[test]
    fn test_check_sector_constraints() {
        let sectors = [Sector::Energy, Sector::Energy, Sector::Energy, Sector::Utilities];
        let rules = SectorRules {
            max_per_sector: 2,
            min_sectors: 2,
        };
        assert!(check_sector_constraints(&[0, 1, 3], &sectors, &rules));
        assert!(!check_sector_constraints(&[0, 1, 2], &sectors, &rules));
        assert!(!check_sector_constraints(&[0, 1], &sectors, &rules));
    }

    #[test]
    fn test_jaccard() {
        assert_eq!(jaccard(&[1, 2, 3], &[1, 2, 3]), 1.0);
        assert_eq!(jaccard(&[1, 2, 3], &[4, 5, 6]), 0.0);
        assert!((jaccard(&[1, 2, 3, 4], &[2, 3, 4, 5]) - 0.6).abs() < 1e-12);
    }

    fn p(members: &[usize], variance: f64) -> Portfolio {
        Portfolio {
            members: members.to_vec(),
            expected_return: 0.1,
            variance,
        }
    }

    #[test]
    fn test_best_k_rejects_near_duplicates() {
        let mut best = BestK::new(3, 0.6);
        assert!(best.offer(p(&[0, 1, 2, 3], 0.05)));
        // Jaccard 0.6 with a lower-risk incumbent.
        assert!(!best.offer(p(&[1, 2, 3, 4], 0.06)));
        // Same overlap but better risk evicts the incumbent.
        assert!(best.offer(p(&[1, 2, 3, 4], 0.04)));
        assert_eq!(best.items.len(), 1);
        assert!(best.offer(p(&[5, 6, 7, 8], 0.07)));
        assert!(best.offer(p(&[9, 10, 11, 12], 0.03)));
        assert!(!best.offer(p(&[13, 14, 15, 16], 0.09)));
        let kept: Vec<f64> = best.into_sorted().iter().map(|q| q.variance).collect();
        assert_eq!(kept, vec![0.03, 0.04, 0.07]);
    }

    #[test]
    fn test_feasibility_and_relaxation() {
        let sectors = vec![Sector::Energy, Sector::Energy, Sector::Energy, Sector::Utilities];
        let strict = SectorRules {
            max_per_sector: 1,
            min_sectors: 3,
        };
        assert!(sector_infeasibility(&sectors, 3, &strict).is_some());
        let relaxed = relax_rules(&sectors, 3, &strict);
        assert_eq!(relaxed.min_sectors, 2);
        assert_eq!(relaxed.max_per_sector, 2);
        assert!(sector_infeasibility(&sectors, 3, &relaxed).is_none());
        assert!(sector_infeasibility(&sectors, 5, &relaxed).is_some());
    }

    #[test]
    fn test_local_search_best_of_round_finds_lower_risk() {
        let fx = fixture(4, 4, 9);
        let inputs = fx.inputs();
        let mut cfg = config(4);
        cfg.min_return = -1.0;
        let start = inputs.evaluate(vec![0, 4, 8, 12]);
        let improved = local_search(start.clone(), &inputs, &cfg);
        assert!(improved.variance <= start.variance);
        assert!(check_sector_constraints(&improved.members, &inputs.sectors, &cfg.rules));
        assert_eq!(improved.members.len(), 4);
    }

    #[test]
    fn test_run_search_respects_constraints() {
        let fx = fixture(4, 5, 3);
        let inputs = fx.inputs();
        let cfg = config(5);
        let outcome = run_search(&inputs, &cfg).unwrap();
        assert!(!outcome.relaxed);
        assert!(!outcome.portfolios.is_empty() && outcome.portfolios.len() <= 3);
        for w in outcome.portfolios.windows(2) {
            assert!(w[0].variance <= w[1].variance);
            assert!(jaccard(&w[0].members, &w[1].members) < cfg.jaccard_threshold);
        }
        for portfolio in &outcome.portfolios {
            assert_eq!(portfolio.members.len(), 5);
            assert!(portfolio.expected_return >= cfg.min_return);
            assert!(check_sector_constraints(&portfolio.members, &inputs.sectors, &cfg.rules));
        }
        assert_eq!(outcome.stats.useful, cfg.iterations);
    }

    #[test]
    fn test_run_search_is_worker_count_independent() {
        let fx = fixture(5, 4, 21);
        let inputs = fx.inputs();
        let mut one = config(5);
        one.workers = 1;
        let mut many = config(5);
        many.workers = 4;
        let a = run_search(&inputs, &one).unwrap();
        let b = run_search(&inputs, &many).unwrap();
        assert_eq!(a.portfolios, b.portfolios);
        assert_eq!(a.stats.trials, b.stats.trials);
    }

    #[test]
    fn test_unreachable_floor_falls_back_to_best_return() {
        let fx = fixture(3, 4, 5);
        let inputs = fx.inputs();
        let mut cfg = config(3);
        cfg.min_return = 10.0;
        cfg.max_trials = 500;
        let outcome = run_search(&inputs, &cfg).unwrap();
        assert!(outcome.relaxed);
        assert_eq!(outcome.portfolios.len(), 1);
        let achievable = outcome.achievable_return.unwrap();
        assert!(achievable < 10.0);
        assert_eq!(outcome.portfolios[0].expected_return, achievable);
        assert_eq!(outcome.stats.trials, 500);
    }

    #[test]
    fn test_greedy_return_subset() {
        let sectors = [
            Sector::Energy,
            Sector::Energy,
            Sector::Energy,
            Sector::Utilities,
            Sector::Materials,
        ];
        let returns = [0.30, 0.25, 0.20, 0.05, 0.01];
        let two_sectors = SectorRules {
            max_per_sector: 2,
            min_sectors: 2,
        };
        assert_eq!(greedy_return_subset(&sectors, &returns, 3, &two_sectors), Some(vec![0, 1, 3]));
        let three_sectors = SectorRules {
            max_per_sector: 2,
            min_sectors: 3,
        };
        assert_eq!(greedy_return_subset(&sectors, &returns, 3, &three_sectors), Some(vec![0, 3, 4]));
        let single = SectorRules {
            max_per_sector: 1,
            min_sectors: 1,
        };
        assert_eq!(greedy_return_subset(&sectors, &returns, 4, &single), None);
    }

    #[test]
    fn test_sector_valid_fallback_when_sampler_never_meets_rules() {
        let fx = energy_heavy_fixture();
        let inputs = fx.inputs();
        let mut cfg = config(11);
        cfg.rules = one_per_sector();
        cfg.max_trials = 2000;
        assert!(sector_infeasibility(&inputs.sectors, 11, &cfg.rules).is_none());

        let outcome = run_search(&inputs, &cfg).unwrap();
        assert_eq!(outcome.stats.trials, 2000);
        assert_eq!(outcome.stats.sector_rejected, outcome.stats.trials);
        assert!(!outcome.relaxed);
        assert!(outcome.achievable_return.is_none());
        assert!(!outcome.sector_rules_broken);
        assert_eq!(outcome.portfolios.len(), 1);
        let best = &outcome.portfolios[0];
        assert_eq!(best.members.len(), 11);
        assert!(check_sector_constraints(&best.members, &inputs.sectors, &cfg.rules));
        assert!(best.expected_return >= cfg.min_return);
    }

    #[test]
    fn test_floor_fallback_keeps_sector_rules() {
        let fx = energy_heavy_fixture();
        let inputs = fx.inputs();
        let mut cfg = config(11);
        cfg.rules = one_per_sector();
        cfg.min_return = 0.5;
        cfg.max_trials = 500;

        let outcome = run_search(&inputs, &cfg).unwrap();
        assert!(outcome.relaxed);
        assert!(!outcome.sector_rules_broken);
        let best = &outcome.portfolios[0];
        assert!(check_sector_constraints(&best.members, &inputs.sectors, &cfg.rules));
        let achievable = outcome.achievable_return.unwrap();
        assert!((achievable - (0.20 + 10.0 * 0.10) / 11.0).abs() < 1e-12);
        assert_eq!(best.expected_return, achievable);
    }

    #[test]
    fn test_unsatisfiable_rules_flag_rule_breaking_fallback() {
        let fx = fixture(2, 3, 8);
        let inputs = fx.inputs();
        let mut cfg = config(3);
        cfg.rules = SectorRules {
            max_per_sector: 2,
            min_sectors: 3,
        };
        cfg.max_trials = 300;

        let outcome = run_search(&inputs, &cfg).unwrap();
        assert!(outcome.sector_rules_broken);
        assert_eq!(outcome.portfolios.len(), 1);
        let portfolio = &outcome.portfolios[0];
        assert!(!check_sector_constraints(&portfolio.members, &inputs.sectors, &cfg.rules));
        assert_eq!(outcome.relaxed, portfolio.expected_return < cfg.min_return);
        assert_eq!(outcome.relaxed, outcome.achievable_return.is_some());
    }

    #[test]
    fn test_time_budget_stops_unbounded_search() {
        let fx = fixture(4, 5, 3);
        let inputs = fx.inputs();
        let mut cfg = config(5);
        cfg.iterations = usize::MAX;
        cfg.max_trials = usize::MAX;
        cfg.time_budget = Duration::from_millis(50);

        let started = Instant::now();
        let outcome = run_search(&inputs, &cfg).unwrap();
        assert!(outcome.stats.timed_out);
        assert!(outcome.stats.trials >= TRIAL_BLOCK_SIZE);
        assert_eq!(outcome.stats.trials % TRIAL_BLOCK_SIZE, 0);
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(!outcome.portfolios.is_empty());
    }

    #[test]
    fn test_search_inputs_dimension_mismatch() {
        let fx = fixture(2, 3, 1);
        let err = SearchInputs::new(fx.sectors.clone(), vec![0.1], fx.sharpes.clone(), &fx.cov);
        assert!(matches!(err, Err(OptimizeError::DimensionMismatch(_))));
    }

    proptest! {
        /// A local-search pass never raises variance and never breaks the floor.
        #[test]
        fn local_search_never_regresses(
            seed in any::<u64>(),
            n in 2usize..6,
            first_improving in any::<bool>(),
            floor_slack in 0.0f64..0.05,
        ) {
            let fx = fixture(4, 3, seed);
            let inputs = fx.inputs();
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
            let members: Vec<usize> = (0..inputs.len()).choose_multiple(&mut rng, n);
            let start = inputs.evaluate(members);

            let mut cfg = config(n);
            cfg.rules = SectorRules { max_per_sector: n, min_sectors: 1 };
            cfg.min_return = start.expected_return - floor_slack;
            cfg.swap_policy = if first_improving { SwapPolicy::FirstImproving } else { SwapPolicy::BestOfRound };

            let after = local_search(start.clone(), &inputs, &cfg);
            prop_assert!(after.variance <= start.variance);
            prop_assert!(after.expected_return >= cfg.min_return);
            prop_assert_eq!(after.members.len(), n);
            prop_assert!(check_sector_constraints(&after.members, &inputs.sectors, &cfg.rules));
        }
    }
}
