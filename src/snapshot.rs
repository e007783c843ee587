//! Snapshot serializer
//!
//! Projects aggregator state into the JSON documents the dashboard polls.
//! Every document is `{"next": <path of the following snapshot>, "interval":
//! <seconds>, "data": ...}` written compact under `Y/m/d/H/M/<kind>.json`.
//! Kinds with nothing to show this minute are simply not written.

use anyhow::{Context, Result};
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::aggregate::{AggregatorState, GeoTree, Point};
use crate::minute::{Minute, MinuteParts};

/// A rendered geo-tree node. Branches serialize as `[label, total,
/// [children...]]` (root label is null); city leaves as `[label, count]`.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoNode {
    Branch {
        label: Option<String>,
        total: u64,
        children: Vec<GeoNode>,
    },
    Leaf {
        label: String,
        count: u64,
    },
}

impl GeoNode {
    pub fn total(&self) -> u64 {
        match self {
            GeoNode::Branch { total, .. } => *total,
            GeoNode::Leaf { count, .. } => *count,
        }
    }
}

impl Serialize for GeoNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GeoNode::Branch { label, total, children } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(label)?;
                seq.serialize_element(total)?;
                seq.serialize_element(children)?;
                seq.end()
            }
            GeoNode::Leaf { label, count } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(label)?;
                seq.serialize_element(count)?;
                seq.end()
            }
        }
    }
}

/// Sort siblings by descending total. `sort_by` is stable, so equal totals
/// keep their discovery order.
fn sort_desc(nodes: &mut [GeoNode]) {
    nodes.sort_by(|a, b| b.total().cmp(&a.total()));
}

/// Roll the geo tree up into the rendered form: parent totals derived from
/// children, zero-total nodes dropped at every level, siblings descending.
pub fn render_geo_tree(tree: &GeoTree) -> GeoNode {
    let mut continents = Vec::new();
    let mut world_sum = 0u64;
    for (continent, country_map) in tree {
        let mut countries = Vec::new();
        let mut continent_sum = 0u64;
        for (country, region_map) in country_map {
            let mut regions = Vec::new();
            let mut country_sum = 0u64;
            for (region, cities) in region_map {
                let total: u64 = cities.values().sum();
                if total == 0 {
                    continue;
                }
                let mut leaves: Vec<GeoNode> = cities
                    .iter()
                    .filter(|(_, &count)| count > 0)
                    .map(|(city, &count)| GeoNode::Leaf { label: city.clone(), count })
                    .collect();
                sort_desc(&mut leaves);
                regions.push(GeoNode::Branch {
                    label: Some(region.clone()),
                    total,
                    children: leaves,
                });
                country_sum += total;
            }
            if country_sum == 0 {
                continue;
            }
            sort_desc(&mut regions);
            countries.push(GeoNode::Branch {
                label: Some(country.clone()),
                total: country_sum,
                children: regions,
            });
            continent_sum += country_sum;
        }
        if continent_sum == 0 {
            continue;
        }
        sort_desc(&mut countries);
        continents.push(GeoNode::Branch {
            label: Some(continent.clone()),
            total: continent_sum,
            children: countries,
        });
        world_sum += continent_sum;
    }
    sort_desc(&mut continents);
    GeoNode::Branch { label: None, total: world_sum, children: continents }
}

/// History window as `[[y, m, d, H, M], cumulative]` pairs.
pub fn render_history(history: &[(Minute, u64)]) -> Vec<(MinuteParts, u64)> {
    history.iter().map(|(m, total)| (m.parts(), *total)).collect()
}

/// Point map payload: `[[y, m, d, H, M], point_count, [[lat, lon, count]...]]`.
pub fn render_points(minute: Minute, points: &[Point]) -> (MinuteParts, usize, Vec<(f64, f64, u64)>) {
    let hits: Vec<(f64, f64, u64)> = points.iter().map(|p| (p.lat, p.lon, p.count)).collect();
    (minute.parts(), hits.len(), hits)
}

#[derive(Serialize)]
struct Document<'a, T: Serialize> {
    next: String,
    interval: u64,
    data: &'a T,
}

pub struct SnapshotWriter {
    root: PathBuf,
    interval_secs: u64,
}

impl SnapshotWriter {
    pub fn new(root: PathBuf, interval_secs: u64) -> Self {
        Self { root, interval_secs }
    }

    /// Write this minute's `count`, `map`, and `geo` documents, skipping any
    /// kind that has no data yet.
    pub fn write_minute(
        &self,
        minute: Minute,
        state: &AggregatorState,
        points: &[Point],
    ) -> Result<()> {
        let history = render_history(&state.history);
        if !history.is_empty() {
            self.write(minute, "count", &history)?;
        }

        let map = render_points(minute, points);
        if !map.2.is_empty() {
            self.write(minute, "map", &map)?;
        }

        let geo = render_geo_tree(&state.tree);
        if geo.total() > 0 {
            self.write(minute, "geo", &geo)?;
        }
        Ok(())
    }

    fn write<T: Serialize>(&self, minute: Minute, kind: &str, data: &T) -> Result<()> {
        let rel = minute.snapshot_path(kind);
        let path = self.root.join(&rel);
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                debug!("Making dir {}", dir.display());
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating snapshot dir {}", dir.display()))?;
            }
        }

        let doc = Document {
            next: minute.succ().snapshot_path(kind),
            interval: self.interval_secs,
            data,
        };
        let bytes = serde_json::to_vec(&doc)?;
        fs::write(&path, bytes)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        info!("Wrote {}", rel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{CityCounts, CountryMap, RegionMap};
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    fn minute(mi: u32) -> Minute {
        Minute::truncate(Utc.with_ymd_and_hms(2011, 3, 22, 14, mi, 0).unwrap())
    }

    fn cities(pairs: &[(&str, u64)]) -> CityCounts {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn small_tree() -> GeoTree {
        let mut regions = RegionMap::new();
        regions.insert("CA".into(), cities(&[("SF", 2), ("LA", 6)]));
        regions.insert("NY".into(), cities(&[("NYC", 8)]));
        regions.insert("WA".into(), cities(&[("Seattle", 0)]));

        let mut countries = CountryMap::new();
        countries.insert("US".into(), regions);
        countries.insert("CA".into(), RegionMap::new());

        let mut tree = GeoTree::new();
        tree.insert("NA".into(), countries);
        tree.insert("EU".into(), CountryMap::new());
        tree
    }

    #[test]
    fn tree_renders_sorted_with_derived_totals() {
        let rendered = render_geo_tree(&small_tree());
        let value = serde_json::to_value(&rendered).unwrap();
        assert_eq!(
            value,
            json!([
                null,
                16,
                [["NA", 16, [["US", 16, [
                    ["CA", 8, [["LA", 6], ["SF", 2]]],
                    ["NY", 8, [["NYC", 8]]],
                ]]]]]
            ])
        );
    }

    #[test]
    fn equal_totals_keep_discovery_order() {
        let mut regions = RegionMap::new();
        regions.insert("B".into(), cities(&[("x", 3)]));
        regions.insert("A".into(), cities(&[("y", 3)]));
        let mut countries = CountryMap::new();
        countries.insert("US".into(), regions);
        let mut tree = GeoTree::new();
        tree.insert("NA".into(), countries);

        let value = serde_json::to_value(render_geo_tree(&tree)).unwrap();
        // "B" was discovered first; the tie must not reorder it.
        assert_eq!(value[2][0][2][0][2][0][0], json!("B"));
        assert_eq!(value[2][0][2][0][2][1][0], json!("A"));
    }

    #[test]
    fn zero_branches_are_dropped_everywhere() {
        let rendered = render_geo_tree(&small_tree());
        let GeoNode::Branch { children, .. } = &rendered else { panic!() };
        // EU has no data, WA's only city is zero.
        assert_eq!(children.len(), 1);
        let value = serde_json::to_value(&rendered).unwrap();
        assert!(!value.to_string().contains("WA"));
    }

    #[test]
    fn history_and_points_wire_shapes() {
        let history = render_history(&[(minute(4), 0), (minute(5), 8)]);
        assert_eq!(
            serde_json::to_value(&history).unwrap(),
            json!([[[2011, 3, 22, 14, 4], 0], [[2011, 3, 22, 14, 5], 8]])
        );

        let points = vec![Point {
            continent: "NA".into(),
            country: "US".into(),
            region: "CA".into(),
            city: "SF".into(),
            lat: 37.7,
            lon: -122.4,
            count: 5,
        }];
        let map = render_points(minute(5), &points);
        assert_eq!(
            serde_json::to_value(&map).unwrap(),
            json!([[2011, 3, 22, 14, 5], 1, [[37.7, -122.4, 5]]])
        );
    }

    #[test]
    fn documents_land_in_minute_directories() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().to_path_buf(), 60);

        let state = AggregatorState {
            total: 16,
            history: vec![(minute(4), 0), (minute(5), 8)],
            tree: small_tree(),
            schema_version: crate::aggregate::SCHEMA_VERSION,
        };
        writer.write_minute(minute(5), &state, &[]).unwrap();

        let count = dir.path().join("2011/03/22/14/05/count.json");
        let raw = std::fs::read_to_string(&count).unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["next"], json!("2011/03/22/14/06/count.json"));
        assert_eq!(doc["interval"], json!(60));
        assert_eq!(doc["data"][1][1], json!(8));
        // Compact output, no pretty spaces.
        assert!(!raw.contains(": "));

        // No points this minute, so no map document.
        assert!(!dir.path().join("2011/03/22/14/05/map.json").exists());
        assert!(dir.path().join("2011/03/22/14/05/geo.json").exists());
    }

    #[test]
    fn empty_state_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().to_path_buf(), 60);
        let state = AggregatorState {
            total: 0,
            history: vec![],
            tree: GeoTree::new(),
            schema_version: crate::aggregate::SCHEMA_VERSION,
        };
        writer.write_minute(minute(5), &state, &[]).unwrap();
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
