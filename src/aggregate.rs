//! Hierarchical download aggregator
//!
//! Holds the running totals that survive restarts: the all-time download
//! count, the 60-minute history window, and the continent/country/region/city
//! tree. `ingest` is the only place any of them mutate during normal
//! operation; the checkpoint manager only borrows the state to serialize it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::geo::ContinentMap;
use crate::minute::Minute;
use crate::store::RawRow;

/// Current checkpoint schema version. Bump when the state layout or its
/// accumulated numbers change meaning, and add a migration in `checkpoint`.
pub const SCHEMA_VERSION: u32 = 8;

/// History entries kept for the rate chart.
pub const HISTORY_CAP: usize = 60;

/// Countries we are not allowed to show downloads for (export policy).
/// Entries for these never reach any total, tree bucket, or point list.
pub const REDACTED: [&str; 6] = ["CU", "IR", "SY", "KP", "MM", "SD"];

pub type CityCounts = IndexMap<String, u64>;
pub type RegionMap = IndexMap<String, CityCounts>;
pub type CountryMap = IndexMap<String, RegionMap>;

/// `{continent: {country: {region: {city: count}}}}`. Insertion order is
/// preserved at every level; the snapshot sort relies on it for stable ties.
pub type GeoTree = IndexMap<String, CountryMap>;

/// Everything the checkpoint persists, plus the schema version it rides under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorState {
    pub total: u64,
    /// `(minute, cumulative total)` pairs, oldest first, at most `HISTORY_CAP`.
    pub history: Vec<(Minute, u64)>,
    pub tree: GeoTree,
    pub schema_version: u32,
}

impl AggregatorState {
    /// Fresh state with the tree shape seeded from reference data: every
    /// continent and its country assignments exist up front, regions and
    /// cities appear as data arrives.
    pub fn seeded(continents: &ContinentMap) -> Self {
        let mut tree = GeoTree::new();
        for continent in continents.continents() {
            tree.insert(continent.to_string(), CountryMap::new());
        }
        for (country, continent) in continents.assignments() {
            if let Some(countries) = tree.get_mut(continent) {
                countries.insert(country.to_string(), RegionMap::new());
            }
        }
        Self {
            total: 0,
            history: Vec::new(),
            tree,
            schema_version: SCHEMA_VERSION,
        }
    }
}

/// One located download counter, used for the dashboard's point map.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub continent: String,
    pub country: String,
    pub region: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
    pub count: u64,
}

/// A composite column key decoded into its location fields.
struct Located {
    continent: String,
    country: String,
    region: String,
    city: String,
    lat: f64,
    lon: f64,
}

pub struct Aggregator {
    continents: ContinentMap,
    state: AggregatorState,
}

impl Aggregator {
    pub fn new(continents: ContinentMap) -> Self {
        let state = AggregatorState::seeded(&continents);
        Self { continents, state }
    }

    pub fn state(&self) -> &AggregatorState {
        &self.state
    }

    /// Replace the state wholesale (checkpoint restore).
    pub fn restore(&mut self, state: AggregatorState) {
        self.state = state;
    }

    /// Fold one minute of raw counters into the running state.
    ///
    /// Returns the minute's total (redacted and undecodable entries excluded)
    /// and the located points for the map. Satellite/proxy entries at (0, 0)
    /// count toward the total and the tree but produce no point.
    pub fn ingest(&mut self, minute: Minute, rows: &[RawRow]) -> (u64, Vec<Point>) {
        let mut minute_total = 0u64;
        let mut points = Vec::new();

        for row in rows {
            for (key, count) in &row.columns {
                let Some(loc) = self.decode(key) else { continue };

                minute_total += count;
                *self
                    .state
                    .tree
                    .entry(loc.continent.clone())
                    .or_default()
                    .entry(loc.country.clone())
                    .or_default()
                    .entry(loc.region.clone())
                    .or_default()
                    .entry(loc.city.clone())
                    .or_default() += count;

                // (0, 0) means satellite or proxy, not a real place.
                if loc.lat == 0.0 && loc.lon == 0.0 {
                    continue;
                }
                points.push(Point {
                    continent: loc.continent,
                    country: loc.country,
                    region: loc.region,
                    city: loc.city,
                    lat: loc.lat,
                    lon: loc.lon,
                    count: *count,
                });
            }
        }

        let before = self.state.total;
        self.state.total += minute_total;
        if self.state.history.is_empty() {
            // Baseline entry so the first rate segment has a starting point.
            self.state.history.push((minute.pred(), before));
        }
        self.state.history.push((minute, self.state.total));
        let overflow = self.state.history.len().saturating_sub(HISTORY_CAP);
        if overflow > 0 {
            self.state.history.drain(..overflow);
        }

        (minute_total, points)
    }

    /// Decode a composite column key. The location is the last five
    /// colon-separated segments (`country:region:city:lat:lon`); the tag
    /// prefix may itself contain colons. Returns `None` for redacted
    /// countries (silently) and for undecodable keys (logged).
    fn decode(&self, key: &str) -> Option<Located> {
        let segments: Vec<&str> = key.split(':').collect();
        if segments.len() < 5 {
            warn!("Skipping malformed key: {}", key);
            return None;
        }
        let &[country, region, city, lat, lon] = &segments[segments.len() - 5..] else {
            return None;
        };

        let country = country.trim();
        if REDACTED.contains(&country) {
            return None;
        }

        // The upstream geocoder emits '  ' or '00' for unknown regions; the
        // frontend expects those as ''.
        let region = region.trim();
        let region = if region.is_empty() || region == "00" { "" } else { region };

        let Some(continent) = self.continents.continent_of(country) else {
            warn!("Skipping key with unknown country: {}", key);
            return None;
        };

        let (Ok(lat), Ok(lon)) = (lat.trim().parse::<f64>(), lon.trim().parse::<f64>()) else {
            warn!("Skipping key with bad coordinates: {}", key);
            return None;
        };

        Some(Located {
            continent: continent.to_string(),
            country: country.to_string(),
            region: region.to_string(),
            city: city.trim().to_string(),
            lat,
            lon,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn minute(mi: u32) -> Minute {
        Minute::truncate(Utc.with_ymd_and_hms(2011, 3, 22, 14, mi, 0).unwrap())
    }

    fn continents() -> ContinentMap {
        ContinentMap::from_pairs(&[("US", "NA"), ("CA", "NA"), ("FR", "EU"), ("CU", "NA")])
    }

    fn row(columns: &[(&str, u64)]) -> RawRow {
        RawRow {
            key: "firefox::4.0:2011-03-22T14:05:00.000".to_string(),
            columns: columns.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    fn city_count(state: &AggregatorState, path: [&str; 4]) -> u64 {
        state.tree[path[0]][path[1]][path[2]][path[3]]
    }

    #[test]
    fn end_to_end_minute() {
        let mut agg = Aggregator::new(continents());
        let rows = [row(&[
            ("v:US:CA:SF:37.7:-122.4", 5),
            ("v:CU:..:..:0:0", 100),
            ("v:FR:  :Paris:48.8:2.3", 3),
        ])];

        let (total, points) = agg.ingest(minute(5), &rows);

        assert_eq!(total, 8);
        assert_eq!(agg.state().total, 8);
        assert_eq!(city_count(agg.state(), ["NA", "US", "CA", "SF"]), 5);
        assert_eq!(city_count(agg.state(), ["EU", "FR", "", "Paris"]), 3);
        assert_eq!(points.len(), 2);
    }

    #[test]
    fn redacted_countries_touch_nothing() {
        let mut agg = Aggregator::new(continents());
        let (total, points) = agg.ingest(minute(5), &[row(&[("v:CU:HA:Havana:23.1:-82.4", 999)])]);

        assert_eq!(total, 0);
        assert_eq!(agg.state().total, 0);
        assert!(points.is_empty());
        assert!(agg.state().tree["NA"]["CU"].is_empty());
        // History records the minute, with nothing added.
        assert_eq!(agg.state().history.last().unwrap().1, 0);
    }

    #[test]
    fn unknown_regions_share_one_bucket() {
        let mut agg = Aggregator::new(continents());
        agg.ingest(
            minute(5),
            &[row(&[("v:US::Portland:45.5:-122.6", 2), ("v:US:00:Portland:45.5:-122.6", 3)])],
        );

        let regions = &agg.state().tree["NA"]["US"];
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[""]["Portland"], 5);
    }

    #[test]
    fn satellite_counts_but_renders_no_point() {
        let mut agg = Aggregator::new(continents());
        let (total, points) = agg.ingest(minute(5), &[row(&[("v:US:WA:Unknown:0:0", 7)])]);

        assert_eq!(total, 7);
        assert_eq!(city_count(agg.state(), ["NA", "US", "WA", "Unknown"]), 7);
        assert!(points.is_empty());
    }

    #[test]
    fn malformed_entries_skip_without_aborting_the_minute() {
        let mut agg = Aggregator::new(continents());
        let rows = [row(&[
            ("garbage", 50),
            ("v:US:CA:SF:not-a-lat:-122.4", 50),
            ("v:ZZ:??:Nowhere:1:1", 50),
            ("v:US:CA:SF:37.7:-122.4", 5),
        ])];

        let (total, points) = agg.ingest(minute(5), &rows);
        assert_eq!(total, 5);
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn rollup_totals_agree_at_every_level() {
        let mut agg = Aggregator::new(continents());
        agg.ingest(
            minute(5),
            &[row(&[
                ("v:US:CA:SF:37.7:-122.4", 5),
                ("v:US:CA:LA:34.0:-118.2", 2),
                ("v:US:NY:NYC:40.7:-74.0", 4),
                ("v:FR::Paris:48.8:2.3", 1),
            ])],
        );

        let state = agg.state();
        let city_sum: u64 = state.tree["NA"]["US"]["CA"].values().sum();
        assert_eq!(city_sum, 7);
        let us_sum: u64 = state.tree["NA"]["US"].values().flat_map(|r| r.values()).sum();
        assert_eq!(us_sum, 11);
        let world_sum: u64 = state
            .tree
            .values()
            .flat_map(|c| c.values())
            .flat_map(|r| r.values())
            .flat_map(|city| city.values())
            .sum();
        assert_eq!(world_sum, state.total);
    }

    #[test]
    fn history_gets_a_baseline_and_stays_capped() {
        let mut agg = Aggregator::new(continents());
        agg.ingest(minute(5), &[row(&[("v:US:CA:SF:37.7:-122.4", 2)])]);

        // First minute: baseline at minute-1 with a zero count.
        assert_eq!(agg.state().history, vec![(minute(4), 0), (minute(5), 2)]);

        let mut m = minute(5);
        for _ in 0..80 {
            m = m.succ();
            agg.ingest(m, &[]);
        }
        let history = &agg.state().history;
        assert_eq!(history.len(), HISTORY_CAP);
        assert_eq!(history.last().unwrap(), &(m, 2));
        // Timestamps strictly increase, totals never decrease.
        for pair in history.windows(2) {
            assert!(pair[0].0 < pair[1].0);
            assert!(pair[0].1 <= pair[1].1);
        }
    }
}
