use crate::error::Result;
use crate::sector::Sector;
use chrono::{DateTime, Utc};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// One security with its periodic return history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instrument {
    pub ticker: String,
    pub sector: Sector,
    /// Periodic simple returns, oldest first, date-aligned across the universe.
    pub returns: Vec<f64>,
}

/// Read-only access to already-windowed return series.
///
/// Implementations own their data for the lifetime of an optimization call;
/// the core never mutates or caches through this interface.
pub trait DataProvider: Sync {
    /// Every `(ticker, sector)` pair, sorted by ticker.
    fn universe(&self) -> Vec<(String, Sector)>;

    /// The most recent `periods` returns for `ticker`, or the whole series
    /// when fewer are available. `None` for unknown tickers.
    fn returns(&self, ticker: &str, periods: usize) -> Option<&[f64]>;

    /// Timestamp of the underlying data snapshot, if known.
    fn as_of(&self) -> Option<DateTime<Utc>> {
        None
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UniverseFile {
    #[serde(default)]
    as_of: Option<DateTime<Utc>>,
    instruments: Vec<Instrument>,
}

/// In-memory universe snapshot, keyed by ticker.
#[derive(Clone, Debug, Default)]
pub struct Universe {
    as_of: Option<DateTime<Utc>>,
    instruments: BTreeMap<String, Instrument>,
}

impl Universe {
    pub fn from_instruments(instruments: Vec<Instrument>, as_of: Option<DateTime<Utc>>) -> Self {
        let mut map = BTreeMap::new();
        for mut inst in instruments {
            inst.ticker = inst.ticker.trim().to_uppercase();
            if inst.ticker.is_empty() {
                warn!("Skipping instrument with empty ticker");
                continue;
            }
            if map.contains_key(&inst.ticker) {
                warn!("Duplicate ticker {} in universe; keeping the last entry", inst.ticker);
            }
            map.insert(inst.ticker.clone(), inst);
        }
        Self {
            as_of,
            instruments: map,
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file: UniverseFile = serde_json::from_str(raw)?;
        Ok(Self::from_instruments(file.instruments, file.as_of))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let universe = Self::from_json_str(&raw)?;
        info!(
            "Loaded universe from {} ({} instruments)",
            path.display(),
            universe.len()
        );
        Ok(universe)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = UniverseFile {
            as_of: self.as_of,
            instruments: self.instruments.values().cloned().collect(),
        };
        let json = serde_json::to_string(&file)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

impl DataProvider for Universe {
    fn universe(&self) -> Vec<(String, Sector)> {
        self.instruments
            .values()
            .map(|i| (i.ticker.clone(), i.sector))
            .collect()
    }

    fn returns(&self, ticker: &str, periods: usize) -> Option<&[f64]> {
        let inst = self.instruments.get(ticker)?;
        let start = inst.returns.len().saturating_sub(periods);
        Some(&inst.returns[start..])
    }

    fn as_of(&self) -> Option<DateTime<Utc>> {
        self.as_of
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Synthetic universe
// ──────────────────────────────────────────────────────────────────────────────

/// Shape of a generated universe: market + sector factor + idiosyncratic noise.
#[derive(Clone, Debug)]
pub struct SyntheticSpec {
    pub instruments_per_sector: usize,
    pub periods: usize,
    pub seed: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            instruments_per_sector: 12,
            periods: 504,
            seed: 7,
        }
    }
}

/// As-of stamp of generated universes (2024-12-31 00:00 UTC), fixed so a
/// seed always reproduces the same universe.
const SYNTHETIC_AS_OF_SECS: i64 = 1_735_603_200;

impl Universe {
    /// Builds a seeded factor-model universe over all 11 sectors.
    ///
    /// The last instrument of every sector is a share-class twin of the first
    /// (same factor exposures, tiny tracking noise), so de-duplication has
    /// something to find.
    pub fn synthetic(spec: &SyntheticSpec) -> Self {
        let mut rng = StdRng::seed_from_u64(spec.seed);
        let periods = spec.periods;

        let market: Vec<f64> = (0..periods)
            .map(|_| 0.0003 + 0.009 * rng.sample::<f64, _>(StandardNormal))
            .collect();

        let mut instruments = Vec::with_capacity(Sector::ALL.len() * spec.instruments_per_sector);
        for sector in Sector::ALL {
            let drift = rng.gen_range(-0.0002..0.0009);
            let sector_vol = rng.gen_range(0.006..0.012);
            let factor: Vec<f64> = (0..periods)
                .map(|_| drift + sector_vol * rng.sample::<f64, _>(StandardNormal))
                .collect();

            let mut first: Option<Vec<f64>> = None;
            for i in 0..spec.instruments_per_sector {
                let is_twin = spec.instruments_per_sector > 2 && i + 1 == spec.instruments_per_sector;
                let returns: Vec<f64> = match (&first, is_twin) {
                    (Some(base), true) => base
                        .iter()
                        .map(|r| r + 0.0005 * rng.sample::<f64, _>(StandardNormal))
                        .collect(),
                    _ => {
                        let alpha = rng.gen_range(-0.0003..0.0006);
                        let beta_m = rng.gen_range(0.6..1.3);
                        let beta_s = rng.gen_range(0.5..1.2);
                        let idio = rng.gen_range(0.008..0.02);
                        (0..periods)
                            .map(|t| {
                                alpha
                                    + beta_m * market[t]
                                    + beta_s * factor[t]
                                    + idio * rng.sample::<f64, _>(StandardNormal)
                            })
                            .collect()
                    }
                };
                if i == 0 {
                    first = Some(returns.clone());
                }
                instruments.push(Instrument {
                    ticker: format!("{}{:02}", sector.code(), i + 1),
                    sector,
                    returns,
                });
            }
        }

        Self::from_instruments(instruments, DateTime::from_timestamp(SYNTHETIC_AS_OF_SECS, 0))
    }
}
