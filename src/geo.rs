//! Geographic reference tables
//!
//! The continent map is the one piece of reference data the aggregator needs:
//! `{country code: continent code}`, loaded once at startup and never mutated.
//! Countries missing from the map cannot be placed in the tree and their
//! entries are skipped at ingest.

use anyhow::{Context, Result};
use indexmap::{IndexMap, IndexSet};
use std::path::Path;
use tracing::info;

/// Immutable `{country -> continent}` lookup.
#[derive(Debug, Clone)]
pub struct ContinentMap {
    countries: IndexMap<String, String>,
}

impl ContinentMap {
    /// Load the map from a `continents.json` file of shape
    /// `{"US": "NA", "FR": "EU", ...}`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading continent map {}", path.display()))?;
        let countries: IndexMap<String, String> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing continent map {}", path.display()))?;
        if countries.is_empty() {
            anyhow::bail!("continent map {} is empty", path.display());
        }
        info!(
            "Continent map loaded: {} countries ({})",
            countries.len(),
            path.display()
        );
        Ok(Self { countries })
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let countries = pairs
            .iter()
            .map(|(country, continent)| (country.to_string(), continent.to_string()))
            .collect();
        Self { countries }
    }

    /// Continent code for a country, if the country is known.
    pub fn continent_of(&self, country: &str) -> Option<&str> {
        self.countries.get(country).map(String::as_str)
    }

    /// The distinct continent codes, in first-seen order.
    pub fn continents(&self) -> IndexSet<&str> {
        self.countries.values().map(String::as_str).collect()
    }

    /// All `(country, continent)` assignments, in file order.
    pub fn assignments(&self) -> impl Iterator<Item = (&str, &str)> {
        self.countries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_looks_up() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"US":"NA","CA":"NA","FR":"EU"}}"#).unwrap();

        let map = ContinentMap::load(file.path()).unwrap();
        assert_eq!(map.continent_of("US"), Some("NA"));
        assert_eq!(map.continent_of("FR"), Some("EU"));
        assert_eq!(map.continent_of("ZZ"), None);
        assert_eq!(map.continents().into_iter().collect::<Vec<_>>(), vec!["NA", "EU"]);
    }

    #[test]
    fn empty_map_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{}}").unwrap();
        assert!(ContinentMap::load(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(ContinentMap::load(Path::new("/nonexistent/continents.json")).is_err());
    }
}
