// Registry of the Dutch water authorities whose models are combined into the
// national model.
//
// Each authority carries its fixed two-digit water-management code, which is
// used as the id prefix when models are concatenated.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Water authorities (waterschappen) plus Rijkswaterstaat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Authority {
    WetterskipFryslan,
    Noorderzijlvest,
    RijnenIJssel,
    Rivierenland,
    AmstelGooienVecht,
    HollandsNoorderkwartier,
    Rijnland,
    StichtseRijnlanden,
    Delfland,
    SchielandendeKrimpenerwaard,
    HollandseDelta,
    BrabantseDelta,
    DeDommel,
    HunzeenAas,
    Zuiderzeeland,
    AaenMaas,
    Scheldestromen,
    ValleienVeluwe,
    Vechtstromen,
    DrentsOverijsselseDelta,
    Limburg,
    Rijkswaterstaat,
}

impl Authority {
    /// All authorities, in ascending prefix order
    pub const ALL: &'static [Authority] = &[
        Authority::WetterskipFryslan,
        Authority::Noorderzijlvest,
        Authority::RijnenIJssel,
        Authority::Rivierenland,
        Authority::AmstelGooienVecht,
        Authority::HollandsNoorderkwartier,
        Authority::Rijnland,
        Authority::StichtseRijnlanden,
        Authority::Delfland,
        Authority::SchielandendeKrimpenerwaard,
        Authority::HollandseDelta,
        Authority::BrabantseDelta,
        Authority::DeDommel,
        Authority::HunzeenAas,
        Authority::Zuiderzeeland,
        Authority::AaenMaas,
        Authority::Scheldestromen,
        Authority::ValleienVeluwe,
        Authority::Vechtstromen,
        Authority::DrentsOverijsselseDelta,
        Authority::Limburg,
        Authority::Rijkswaterstaat,
    ];

    /// Get the configuration for this authority
    pub fn config(&self) -> AuthorityConfig {
        let (name, display_name, prefix) = match self {
            Authority::WetterskipFryslan => ("WetterskipFryslan", "Wetterskip Fryslân", 2),
            Authority::Noorderzijlvest => ("Noorderzijlvest", "Noorderzijlvest", 7),
            Authority::RijnenIJssel => ("RijnenIJssel", "Rijn en IJssel", 8),
            Authority::Rivierenland => ("Rivierenland", "Rivierenland", 9),
            Authority::AmstelGooienVecht => ("AmstelGooienVecht", "Amstel, Gooi en Vecht", 11),
            Authority::HollandsNoorderkwartier => {
                ("HollandsNoorderkwartier", "Hollands Noorderkwartier", 12)
            }
            Authority::Rijnland => ("Rijnland", "Rijnland", 13),
            Authority::StichtseRijnlanden => ("StichtseRijnlanden", "Stichtse Rijnlanden", 14),
            Authority::Delfland => ("Delfland", "Delfland", 15),
            Authority::SchielandendeKrimpenerwaard => (
                "SchielandendeKrimpenerwaard",
                "Schieland en de Krimpenerwaard",
                16,
            ),
            Authority::HollandseDelta => ("HollandseDelta", "Hollandse Delta", 18),
            Authority::BrabantseDelta => ("BrabantseDelta", "Brabantse Delta", 25),
            Authority::DeDommel => ("DeDommel", "De Dommel", 27),
            Authority::HunzeenAas => ("HunzeenAas", "Hunze en Aa's", 34),
            Authority::Zuiderzeeland => ("Zuiderzeeland", "Zuiderzeeland", 37),
            Authority::AaenMaas => ("AaenMaas", "Aa en Maas", 38),
            Authority::Scheldestromen => ("Scheldestromen", "Scheldestromen", 42),
            Authority::ValleienVeluwe => ("ValleienVeluwe", "Vallei en Veluwe", 43),
            Authority::Vechtstromen => ("Vechtstromen", "Vechtstromen", 44),
            Authority::DrentsOverijsselseDelta => {
                ("DrentsOverijsselseDelta", "Drents Overijsselse Delta", 59)
            }
            Authority::Limburg => ("Limburg", "Limburg", 60),
            Authority::Rijkswaterstaat => ("Rijkswaterstaat", "Rijkswaterstaat", 80),
        };
        AuthorityConfig {
            name,
            display_name,
            prefix,
        }
    }

    pub fn name(&self) -> &'static str {
        self.config().name
    }

    /// Two-digit water-management code, used as id prefix
    pub fn prefix(&self) -> i64 {
        self.config().prefix
    }

    /// Directory name of this authority's bundle inside the work dir
    pub fn bundle_dir_name(&self) -> String {
        format!("{}_parameterized", self.config().name)
    }
}

/// Couple targets that mark the edge of the national model.
pub const NEVER_COUPLED: &[&str] = &["Noordzee", "Buitenland"];

impl FromStr for Authority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        Authority::ALL
            .iter()
            .copied()
            .find(|a| a.config().name.to_lowercase() == wanted)
            .ok_or_else(|| {
                format!(
                    "Unknown authority: '{}'. Valid options: {}",
                    s,
                    Authority::ALL.iter().map(|a| a.name()).collect::<Vec<_>>().join(", ")
                )
            })
    }
}

impl std::fmt::Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.config().name)
    }
}

/// Configuration for a water authority
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Short name (used in directory names and `meta_waterbeheerder`)
    pub name: &'static str,
    /// Human-readable display name
    pub display_name: &'static str,
    /// Water-management code
    pub prefix: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashSet;

    #[test]
    fn test_authority_from_str() {
        assert_eq!(Authority::from_str("Limburg").unwrap(), Authority::Limburg);
        assert_eq!(Authority::from_str("aa en maas").unwrap(), Authority::AaenMaas);
        assert_eq!(
            Authority::from_str("HunzeenAas").unwrap(),
            Authority::HunzeenAas
        );
        assert!(Authority::from_str("Atlantis").is_err());
    }

    #[test]
    fn test_prefixes_are_unique() {
        let prefixes: AHashSet<i64> = Authority::ALL.iter().map(|a| a.prefix()).collect();
        assert_eq!(prefixes.len(), Authority::ALL.len());
        assert!(prefixes.iter().all(|p| (1..100).contains(p)));
    }

    #[test]
    fn test_display_matches_name() {
        assert_eq!(Authority::Rijkswaterstaat.to_string(), "Rijkswaterstaat");
        assert_eq!(
            Authority::Delfland.bundle_dir_name(),
            "Delfland_parameterized"
        );
    }
}
