mod config;
mod constraints;
mod data;
mod error;
mod optimizer;
mod portfolio;
mod risk;
mod sector;
mod selector;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use config::Settings;
use constraints::Constraints;
use data::{SyntheticSpec, Universe};
use error::OptimizeError;
use optimizer::SwapPolicy;
use risk::Shrinkage;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, ValueEnum)]
enum SwapPolicyChoice {
    BestOfRound,
    FirstImproving,
}

impl From<SwapPolicyChoice> for SwapPolicy {
    fn from(choice: SwapPolicyChoice) -> Self {
        match choice {
            SwapPolicyChoice::BestOfRound => SwapPolicy::BestOfRound,
            SwapPolicyChoice::FirstImproving => SwapPolicy::FirstImproving,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Sectorfolio: sector-diversified, minimum-risk equal-weight portfolio selection",
    after_help = "EXAMPLES:
    # Optimize over a generated universe
    cargo run --release -- --synthetic-seed 7

    # Optimize over a JSON universe with a 15% return floor
    cargo run --release -- --universe data/universe.json --min-return 0.15 --n-stocks 8

    # Check a constraint file without running the search
    cargo run --release -- --constraints request.json --check"
)]
struct Args {
    /// JSON universe file ({\"as_of\", \"instruments\": [{\"ticker\", \"sector\", \"returns\"}]})
    #[arg(long)]
    universe: Option<PathBuf>,

    /// Seed for the generated universe used when --universe is not given
    #[arg(long, default_value_t = 7)]
    synthetic_seed: u64,

    /// Instruments per sector in the generated universe
    #[arg(long, default_value_t = 12)]
    synthetic_per_sector: usize,

    /// Return periods per instrument in the generated universe
    #[arg(long, default_value_t = 504)]
    synthetic_periods: usize,

    /// Write the loaded or generated universe to this path
    #[arg(long)]
    export_universe: Option<PathBuf>,

    /// JSON constraint file; flags below override its fields
    #[arg(long)]
    constraints: Option<PathBuf>,

    /// Validate constraints and print advisories without optimizing
    #[arg(long)]
    check: bool,

    /// Print the result as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Leave wall-clock timing out of the output so seeded runs print identical bytes
    #[arg(long)]
    no_timing: bool,

    /// Instruments per portfolio (2-15)
    #[arg(long)]
    n_stocks: Option<usize>,

    /// Minimum annual expected return as a fraction (e.g. 0.15)
    #[arg(long)]
    min_return: Option<f64>,

    /// Risk / correlation lookback in months (6-24)
    #[arg(long)]
    risk_window: Option<usize>,

    /// Return ranking lookback in months (1-12)
    #[arg(long)]
    return_window: Option<usize>,

    /// Candidates kept per sector (1-10)
    #[arg(long)]
    top_k_per_sector: Option<usize>,

    /// Clustering cut on 1 - correlation (0.01-0.5)
    #[arg(long)]
    distance_threshold: Option<f64>,

    #[arg(long)]
    max_per_sector: Option<usize>,

    #[arg(long)]
    min_sectors: Option<usize>,

    /// Instruments kept per correlation cluster (1-2)
    #[arg(long)]
    max_per_cluster: Option<usize>,

    /// Useful samples to collect
    #[arg(long)]
    iterations: Option<usize>,

    /// Hard cap on total trials
    #[arg(long)]
    max_trials: Option<usize>,

    #[arg(long)]
    time_budget_ms: Option<u64>,

    /// Portfolios returned (best + alternatives)
    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    swap_rounds: Option<usize>,

    #[arg(long, value_enum)]
    swap_policy: Option<SwapPolicyChoice>,

    /// Softmax temperature for Sharpe-weighted sampling
    #[arg(long)]
    temperature: Option<f64>,

    /// Jaccard similarity at which two portfolios count as duplicates
    #[arg(long)]
    jaccard: Option<f64>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Drop instruments with a lower Sharpe ratio before ranking
    #[arg(long)]
    min_sharpe: Option<f64>,

    /// Fixed shrinkage intensity in [0, 1] (default: Ledoit-Wolf)
    #[arg(long)]
    shrinkage: Option<f64>,
}

impl Args {
    fn apply(&self, c: &mut Constraints) {
        if let Some(v) = self.n_stocks {
            c.n_stocks = v;
        }
        if let Some(v) = self.min_return {
            c.min_return = v;
        }
        if let Some(v) = self.risk_window {
            c.risk_window_months = v;
        }
        if let Some(v) = self.return_window {
            c.return_window_months = v;
        }
        if let Some(v) = self.top_k_per_sector {
            c.top_k_per_sector = v;
        }
        if let Some(v) = self.distance_threshold {
            c.distance_threshold = v;
        }
        if let Some(v) = self.max_per_sector {
            c.max_per_sector = v;
        }
        if let Some(v) = self.min_sectors {
            c.min_sectors = v;
        }
        if let Some(v) = self.max_per_cluster {
            c.max_per_cluster = v;
        }
        if let Some(v) = self.iterations {
            c.iterations = v;
        }
        if let Some(v) = self.time_budget_ms {
            c.time_budget_ms = v;
        }
        if let Some(v) = self.top_k {
            c.top_k = v;
        }
        if let Some(v) = self.swap_rounds {
            c.swap_rounds = v;
        }
        if let Some(v) = self.temperature {
            c.temperature = v;
        }
        if let Some(v) = self.jaccard {
            c.jaccard_threshold = v;
        }
        if let Some(v) = self.workers {
            c.workers = v;
        }
        if let Some(v) = self.seed {
            c.seed = v;
        }
        if let Some(v) = self.min_sharpe {
            c.min_sharpe = v;
        }
        if self.max_trials.is_some() {
            c.max_trials = self.max_trials;
        }
        if let Some(policy) = self.swap_policy.clone() {
            c.swap_policy = policy.into();
        }
        if let Some(intensity) = self.shrinkage {
            c.shrinkage = Shrinkage::Fixed(intensity);
        }
    }
}

fn load_constraints(args: &Args, settings: &Settings) -> anyhow::Result<Constraints> {
    let mut constraints = match &args.constraints {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading constraints from {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => Constraints::with_settings(settings),
    };
    args.apply(&mut constraints);
    Ok(constraints)
}

fn load_universe(args: &Args) -> anyhow::Result<Universe> {
    match &args.universe {
        Some(path) => Universe::load(path).with_context(|| format!("loading universe {}", path.display())),
        None => {
            let spec = SyntheticSpec {
                instruments_per_sector: args.synthetic_per_sector,
                periods: args.synthetic_periods,
                seed: args.synthetic_seed,
            };
            info!(
                "Generating synthetic universe: {} per sector, {} periods, seed {}",
                spec.instruments_per_sector, spec.periods, spec.seed
            );
            Ok(Universe::synthetic(&spec))
        }
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    config::init_cpu_parallelism();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sectorfolio=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    let args = Args::parse();

    let settings = Settings::from_env();
    let constraints = load_constraints(&args, &settings)?;

    if args.check {
        constraints.validate()?;
        let advisories = constraints.advisories();
        println!("Constraints valid. Estimated candidates: ~{}", constraints.estimated_candidates());
        for note in &advisories {
            println!("  ⚠ {}", note);
        }
        if args.json {
            println!("{}", serde_json::to_string_pretty(&constraints)?);
        }
        return Ok(());
    }
    for note in constraints.advisories() {
        warn!("{}", note);
    }

    let universe = load_universe(&args)?;
    if universe.is_empty() {
        anyhow::bail!("universe contains no instruments");
    }
    if let Some(path) = &args.export_universe {
        universe
            .save(path)
            .with_context(|| format!("writing universe to {}", path.display()))?;
        info!("Universe written to {}", path.display());
    }

    let emit = |result: portfolio::OptimizationResult| -> anyhow::Result<()> {
        let result = if args.no_timing { result.without_timing() } else { result };
        if args.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            portfolio::print_allocation(&result);
        }
        Ok(())
    };

    match portfolio::optimize(&universe, &constraints) {
        Ok(result) => emit(result),
        Err(OptimizeError::ConstraintUnsatisfiable { reason, relaxed }) => {
            error!("Constraints unsatisfiable: {}", reason);
            match relaxed {
                Some(result) => {
                    warn!("Showing the best portfolio under relaxed sector constraints");
                    emit(*result)
                }
                None => Err(anyhow::anyhow!("constraints unsatisfiable: {}", reason)),
            }
        }
        Err(e) => Err(e.into()),
    }
}
