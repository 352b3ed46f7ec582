use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// GICS-style sector partition of the instrument universe.
///
/// Serializes as the display name; deserializes through `FromStr`, so data
/// files may use any of the accepted spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Sector {
    #[serde(rename = "Communication Services")]
    CommunicationServices,
    #[serde(rename = "Consumer Discretionary")]
    ConsumerDiscretionary,
    #[serde(rename = "Consumer Staples")]
    ConsumerStaples,
    Energy,
    Financials,
    #[serde(rename = "Health Care")]
    HealthCare,
    Industrials,
    #[serde(rename = "Information Technology")]
    InformationTechnology,
    Materials,
    #[serde(rename = "Real Estate")]
    RealEstate,
    Utilities,
}

pub const SECTOR_COUNT: usize = 11;

/// Per-sector member counts, ordered by sector for stable output.
pub type SectorHistogram = BTreeMap<Sector, usize>;

impl Sector {
    pub const ALL: [Sector; SECTOR_COUNT] = [
        Sector::CommunicationServices,
        Sector::ConsumerDiscretionary,
        Sector::ConsumerStaples,
        Sector::Energy,
        Sector::Financials,
        Sector::HealthCare,
        Sector::Industrials,
        Sector::InformationTechnology,
        Sector::Materials,
        Sector::RealEstate,
        Sector::Utilities,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CommunicationServices => "Communication Services",
            Self::ConsumerDiscretionary => "Consumer Discretionary",
            Self::ConsumerStaples => "Consumer Staples",
            Self::Energy => "Energy",
            Self::Financials => "Financials",
            Self::HealthCare => "Health Care",
            Self::Industrials => "Industrials",
            Self::InformationTechnology => "Information Technology",
            Self::Materials => "Materials",
            Self::RealEstate => "Real Estate",
            Self::Utilities => "Utilities",
        }
    }

    /// Short ticker-style code, used for synthetic instrument names.
    pub fn code(self) -> &'static str {
        match self {
            Self::CommunicationServices => "COM",
            Self::ConsumerDiscretionary => "CDI",
            Self::ConsumerStaples => "CST",
            Self::Energy => "ENE",
            Self::Financials => "FIN",
            Self::HealthCare => "HLT",
            Self::Industrials => "IND",
            Self::InformationTechnology => "TEC",
            Self::Materials => "MAT",
            Self::RealEstate => "REA",
            Self::Utilities => "UTL",
        }
    }

    /// Dense index into `[_; SECTOR_COUNT]` count arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        let sector = match normalized.as_str() {
            "communicationservices" | "communications" | "telecom" | "com" => {
                Sector::CommunicationServices
            }
            "consumerdiscretionary" | "discretionary" | "cdi" => Sector::ConsumerDiscretionary,
            "consumerstaples" | "staples" | "cst" => Sector::ConsumerStaples,
            "energy" | "ene" => Sector::Energy,
            "financials" | "financial" | "fin" => Sector::Financials,
            "healthcare" | "health" | "hlt" => Sector::HealthCare,
            "industrials" | "industrial" | "ind" => Sector::Industrials,
            "informationtechnology" | "technology" | "tech" | "tec" => {
                Sector::InformationTechnology
            }
            "materials" | "mat" => Sector::Materials,
            "realestate" | "rea" => Sector::RealEstate,
            "utilities" | "utl" => Sector::Utilities,
            _ => return Err(format!("unknown sector '{}'", s.trim())),
        };
        Ok(sector)
    }
}

impl TryFrom<String> for Sector {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

pub fn histogram<I: IntoIterator<Item = Sector>>(sectors: I) -> SectorHistogram {
    let mut hist = SectorHistogram::new();
    for sector in sectors {
        *hist.entry(sector).or_insert(0) += 1;
    }
    hist
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("Technology".parse::<Sector>(), Ok(Sector::InformationTechnology));
        assert_eq!("health care".parse::<Sector>(), Ok(Sector::HealthCare));
        assert_eq!("Real-Estate".parse::<Sector>(), Ok(Sector::RealEstate));
        assert!("Crypto".parse::<Sector>().is_err());
    }

    #[test]
    fn test_index_is_dense() {
        for (i, s) in Sector::ALL.iter().enumerate() {
            assert_eq!(s.index(), i);
        }
    }

    #[test]
    fn test_serde_names_round_trip_through_display() {
        for s in Sector::ALL {
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json, format!("\"{}\"", s));
            let back: Sector = serde_json::from_str(&json).unwrap();
            assert_eq!(back, s);
        }
        let legacy: Sector = serde_json::from_str("\"Healthcare\"").unwrap();
        assert_eq!(legacy, Sector::HealthCare);
        let loose: Sector = serde_json::from_str("\"tech\"").unwrap();
        assert_eq!(loose, Sector::InformationTechnology);
        assert!(serde_json::from_str::<Sector>("\"Crypto\"").is_err());
    }

    #[test]
    fn test_histogram_counts() {
        let hist = histogram([Sector::Energy, Sector::Utilities, Sector::Energy]);
        assert_eq!(hist.get(&Sector::Energy), Some(&2));
        assert_eq!(hist.get(&Sector::Utilities), Some(&1));
        assert_eq!(hist.len(), 2);
    }
}
