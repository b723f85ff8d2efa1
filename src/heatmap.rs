//! # Heatmap Generation
//!
//! Groups samples into rounded-coordinate cells and maps each cell's visit
//! count to an intensity, a color band and a render radius.
//!
//! ## Algorithm
//! 1. Round each sample to `precision` decimal places (4 ≈ 11m cells, 3 ≈ 111m).
//! 2. `visit_count` = number of samples in the cell.
//! 3. `intensity = min(visit_count / saturation_count, 1.0)`.
//! 4. Band from fixed intensity thresholds; radius grows linearly with visits and is clipped.
//! 5. One cell per group, keyed by the rounding-key string.
//!
//! Generation is a full O(n) pass with no incremental path. Cells come out in
//! grid order, so running it twice on the same log yields identical output.
//!
//! The cell centroid is the rounded key itself, not the mean of its members.

use std::collections::BTreeMap;

use geo::{BoundingRect, MultiPoint, Point};
use rstar::primitives::GeomWithData;
use rstar::RTree;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};
use crate::geo_utils::{cell_size_meters, haversine_distance, meters_to_degrees};
use crate::{GpsPoint, LocationSample};

/// Configuration for heatmap generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    /// Decimal places used for the grouping key.
    /// Default: 4 (~11m cells)
    pub precision: u32,

    /// Visit count at which intensity saturates at 1.0.
    /// Default: 20
    pub saturation_count: f64,

    /// Render radius of a single-visit cell.
    /// Default: 15.0 meters
    pub base_radius_meters: f64,

    /// Extra radius per additional visit.
    /// Default: 5.0 meters
    pub radius_per_visit_meters: f64,

    /// Radius cap.
    /// Default: 60.0 meters
    pub max_radius_meters: f64,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            precision: 4,
            saturation_count: 20.0,
            base_radius_meters: 15.0,
            radius_per_visit_meters: 5.0,
            max_radius_meters: 60.0,
        }
    }
}

impl HeatmapConfig {
    pub fn validate(&self) -> Result<()> {
        if self.precision > 6 {
            return Err(TrackerError::config("heatmap.precision must be between 0 and 6"));
        }
        if !(self.saturation_count.is_finite() && self.saturation_count > 0.0) {
            return Err(TrackerError::config(
                "heatmap.saturation_count must be a positive number",
            ));
        }
        if self.base_radius_meters < 0.0
            || self.radius_per_visit_meters < 0.0
            || self.max_radius_meters < self.base_radius_meters
        {
            return Err(TrackerError::config(
                "heatmap radii must be non-negative with max_radius_meters >= base_radius_meters",
            ));
        }
        Ok(())
    }

    /// Map an intensity in `[0, 1]` to its color band.
    pub fn band_for(&self, intensity: f64) -> HeatBand {
        HeatBand::from_intensity(intensity)
    }

    /// Render radius for a visit count (monotonic, clipped at the max).
    pub fn radius_for(&self, visit_count: u32) -> f64 {
        let extra = visit_count.saturating_sub(1) as f64 * self.radius_per_visit_meters;
        (self.base_radius_meters + extra).min(self.max_radius_meters)
    }

    /// Linear intensity ramp clipped at 1.0.
    pub fn intensity_for(&self, visit_count: u32) -> f64 {
        (visit_count as f64 / self.saturation_count).min(1.0)
    }
}

/// Discrete color band, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatBand {
    Low,
    Medium,
    High,
    VeryHigh,
    Extreme,
}

impl HeatBand {
    /// Step function over intensity with thresholds at 0.2, 0.4, 0.6 and 0.8.
    pub fn from_intensity(intensity: f64) -> Self {
        if intensity >= 0.8 {
            HeatBand::Extreme
        } else if intensity >= 0.6 {
            HeatBand::VeryHigh
        } else if intensity >= 0.4 {
            HeatBand::High
        } else if intensity >= 0.2 {
            HeatBand::Medium
        } else {
            HeatBand::Low
        }
    }

    /// Fill color (RGBA).
    pub fn color(&self) -> [u8; 4] {
        match self {
            HeatBand::Low => [33, 150, 243, 150],
            HeatBand::Medium => [76, 175, 80, 165],
            HeatBand::High => [255, 235, 59, 180],
            HeatBand::VeryHigh => [255, 152, 0, 195],
            HeatBand::Extreme => [244, 67, 54, 210],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HeatBand::Low => "low",
            HeatBand::Medium => "medium",
            HeatBand::High => "high",
            HeatBand::VeryHigh => "very high",
            HeatBand::Extreme => "extreme",
        }
    }
}

/// A single heatmap cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatCell {
    /// Rounding key, e.g. `"37.0000,-122.0000"`; stable across recomputation
    pub key: String,
    /// Rounded latitude (cell centroid)
    pub latitude: f64,
    /// Rounded longitude (cell centroid)
    pub longitude: f64,
    pub visit_count: u32,
    pub intensity: f64,
    pub band: HeatBand,
    pub radius_meters: f64,
    pub first_visit: i64,
    pub last_visit: i64,
    /// Samples in this cell, oldest first
    pub members: Vec<LocationSample>,
}

/// Bounding box covering all cell centroids.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatmapBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

/// Complete heatmap derived from one history snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapResult {
    pub cells: Vec<HeatCell>,
    pub total_samples: usize,
    pub max_visit_count: u32,
    /// Precision the keys were generated with
    pub precision: u32,
    pub bounds: Option<HeatmapBounds>,
}

impl HeatmapResult {
    pub fn empty(precision: u32) -> Self {
        Self {
            cells: Vec::new(),
            total_samples: 0,
            max_visit_count: 0,
            precision,
            bounds: None,
        }
    }
}

fn scale_for(precision: u32) -> f64 {
    10f64.powi(precision as i32)
}

fn grid_index(value: f64, scale: f64) -> i64 {
    (value * scale).round() as i64
}

// Formatting from the integer grid index keeps keys free of "-0.0000"
fn format_key(lat_index: i64, lng_index: i64, precision: u32) -> String {
    let scale = scale_for(precision);
    let p = precision as usize;
    format!(
        "{:.*},{:.*}",
        p,
        lat_index as f64 / scale,
        p,
        lng_index as f64 / scale
    )
}

/// Rounding key for a coordinate at the given precision.
pub fn cell_key(latitude: f64, longitude: f64, precision: u32) -> String {
    let scale = scale_for(precision);
    format_key(
        grid_index(latitude, scale),
        grid_index(longitude, scale),
        precision,
    )
}

/// Generate a heatmap from a history snapshot.
pub fn generate_heatmap(samples: &[LocationSample], config: &HeatmapConfig) -> HeatmapResult {
    let scale = scale_for(config.precision);

    let mut groups: BTreeMap<(i64, i64), Vec<LocationSample>> = BTreeMap::new();
    for sample in samples {
        let key = (
            grid_index(sample.latitude, scale),
            grid_index(sample.longitude, scale),
        );
        groups.entry(key).or_default().push(*sample);
    }

    let cells: Vec<HeatCell> = groups
        .into_iter()
        .map(|((lat_index, lng_index), members)| {
            let visit_count = u32::try_from(members.len()).unwrap_or(u32::MAX);
            let intensity = config.intensity_for(visit_count);
            let first_visit = members
                .iter()
                .map(|s| s.timestamp_millis)
                .min()
                .unwrap_or_default();
            let last_visit = members
                .iter()
                .map(|s| s.timestamp_millis)
                .max()
                .unwrap_or_default();

            HeatCell {
                key: format_key(lat_index, lng_index, config.precision),
                latitude: lat_index as f64 / scale,
                longitude: lng_index as f64 / scale,
                visit_count,
                intensity,
                band: config.band_for(intensity),
                radius_meters: config.radius_for(visit_count),
                first_visit,
                last_visit,
                members,
            }
        })
        .collect();

    let max_visit_count = cells.iter().map(|c| c.visit_count).max().unwrap_or(0);

    let centroids: MultiPoint<f64> = cells
        .iter()
        .map(|c| Point::new(c.longitude, c.latitude))
        .collect();
    let bounds = centroids.bounding_rect().map(|rect| HeatmapBounds {
        min_lat: rect.min().y,
        max_lat: rect.max().y,
        min_lng: rect.min().x,
        max_lng: rect.max().x,
    });

    log::debug!(
        "[Heatmap] {} samples -> {} cells (~{:.0}m grid)",
        samples.len(),
        cells.len(),
        cell_size_meters(config.precision)
    );

    HeatmapResult {
        cells,
        total_samples: samples.len(),
        max_visit_count,
        precision: config.precision,
        bounds,
    }
}

/// Detail lookup by cell key.
pub fn query_heatmap_cell<'a>(heatmap: &'a HeatmapResult, key: &str) -> Option<&'a HeatCell> {
    heatmap.cells.iter().find(|cell| cell.key == key)
}

/// Find the cell a coordinate rounds into, if it has any visits.
pub fn cell_for_location(heatmap: &HeatmapResult, latitude: f64, longitude: f64) -> Option<&HeatCell> {
    let key = cell_key(latitude, longitude, heatmap.precision);
    query_heatmap_cell(heatmap, &key)
}

type CellPoint = GeomWithData<[f64; 2], usize>;

/// R-tree over cell centroids for resolving a map tap to a cell.
///
/// An index is only meaningful for the [`HeatmapResult`] it was built from.
pub struct CellIndex {
    tree: RTree<CellPoint>,
    max_radius_meters: f64,
}

impl CellIndex {
    pub fn build(heatmap: &HeatmapResult) -> Self {
        let points: Vec<CellPoint> = heatmap
            .cells
            .iter()
            .enumerate()
            .map(|(i, cell)| GeomWithData::new([cell.longitude, cell.latitude], i))
            .collect();
        let max_radius_meters = heatmap
            .cells
            .iter()
            .map(|c| c.radius_meters)
            .fold(0.0, f64::max);

        Self {
            tree: RTree::bulk_load(points),
            max_radius_meters,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Nearest cell whose render circle contains the coordinate.
    pub fn nearest<'a>(
        &self,
        heatmap: &'a HeatmapResult,
        latitude: f64,
        longitude: f64,
    ) -> Option<&'a HeatCell> {
        let query = GpsPoint::new(latitude, longitude);
        if !query.is_valid() || self.is_empty() {
            return None;
        }

        let search_deg = meters_to_degrees(self.max_radius_meters, latitude);
        self.tree
            .locate_within_distance([longitude, latitude], search_deg * search_deg)
            .filter_map(|entry| {
                let cell = heatmap.cells.get(entry.data)?;
                let distance = haversine_distance(&query, &GpsPoint::new(cell.latitude, cell.longitude));
                (distance <= cell.radius_meters).then_some((entry.data, distance, cell))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
            .map(|(_, _, cell)| cell)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SampleSource;

    const T0: i64 = 1_700_000_000_000;

    fn sample_at(lat: f64, lng: f64, i: i64) -> LocationSample {
        LocationSample {
            latitude: lat,
            longitude: lng,
            timestamp_millis: T0 + i * 60_000,
            accuracy_meters: Some(8.0),
            source: SampleSource::Continuous,
        }
    }

    fn mixed_log() -> Vec<LocationSample> {
        let mut log = Vec::new();
        for i in 0..7 {
            log.push(sample_at(37.00001 + i as f64 * 0.000001, -122.00002, i));
        }
        for i in 0..3 {
            log.push(sample_at(37.0101, -122.0203, 10 + i));
        }
        log.push(sample_at(-33.8688, 151.2093, 20));
        log
    }

    #[test]
    fn test_empty_log() {
        let result = generate_heatmap(&[], &HeatmapConfig::default());
        assert!(result.cells.is_empty());
        assert_eq!(result.total_samples, 0);
        assert_eq!(result.max_visit_count, 0);
        assert!(result.bounds.is_none());
    }

    #[test]
    fn test_single_fix_single_cell() {
        let log = vec![sample_at(37.0, -122.0, 0)];
        let result = generate_heatmap(&log, &HeatmapConfig::default());
        assert_eq!(result.cells.len(), 1);

        let cell = &result.cells[0];
        assert_eq!(cell.key, "37.0000,-122.0000");
        assert_eq!(cell.visit_count, 1);
        assert_eq!(cell.latitude, 37.0);
        assert_eq!(cell.longitude, -122.0);
        assert!((cell.intensity - 0.05).abs() < 1e-12);
        assert_eq!(cell.band, HeatBand::Low);
        assert_eq!(cell.radius_meters, 15.0);
        assert_eq!(cell.members, log);
    }

    #[test]
    fn test_grouping_counts() {
        let result = generate_heatmap(&mixed_log(), &HeatmapConfig::default());
        assert_eq!(result.cells.len(), 3);
        assert_eq!(result.total_samples, 11);
        assert_eq!(result.max_visit_count, 7);

        let home = query_heatmap_cell(&result, "37.0000,-122.0000").unwrap();
        assert_eq!(home.visit_count, 7);
        assert_eq!(home.first_visit, T0);
        assert_eq!(home.last_visit, T0 + 6 * 60_000);

        let other = query_heatmap_cell(&result, "37.0101,-122.0203").unwrap();
        assert_eq!(other.visit_count, 3);
        assert_eq!(other.members.len(), 3);
    }

    #[test]
    fn test_saturation_top_band() {
        let log: Vec<LocationSample> = (0..25).map(|i| sample_at(40.7128, -74.006, i)).collect();
        let config = HeatmapConfig {
            saturation_count: 20.0,
            ..HeatmapConfig::default()
        };
        let result = generate_heatmap(&log, &config);
        assert_eq!(result.cells.len(), 1);
        let cell = &result.cells[0];
        assert_eq!(cell.visit_count, 25);
        assert_eq!(cell.intensity, 1.0);
        assert_eq!(cell.band, HeatBand::Extreme);
        assert_eq!(cell.radius_meters, config.max_radius_meters);
    }

    #[test]
    fn test_idempotent() {
        let log = mixed_log();
        let config = HeatmapConfig::default();
        let a = generate_heatmap(&log, &config);
        let b = generate_heatmap(&log, &config);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_order_independent_keys_and_counts() {
        let log = mixed_log();
        let mut reversed = log.clone();
        reversed.reverse();
        let config = HeatmapConfig::default();
        let a = generate_heatmap(&log, &config);
        let b = generate_heatmap(&reversed, &config);

        let summary = |r: &HeatmapResult| -> Vec<(String, u32)> {
            r.cells.iter().map(|c| (c.key.clone(), c.visit_count)).collect()
        };
        assert_eq!(summary(&a), summary(&b));
    }

    #[test]
    fn test_precision_three_merges_cells() {
        let log = vec![sample_at(37.0001, -122.0001, 0), sample_at(37.0004, -122.0003, 1)];
        let fine = generate_heatmap(&log, &HeatmapConfig::default());
        assert_eq!(fine.cells.len(), 2);

        let coarse = generate_heatmap(
            &log,
            &HeatmapConfig {
                precision: 3,
                ..HeatmapConfig::default()
            },
        );
        assert_eq!(coarse.cells.len(), 1);
        assert_eq!(coarse.cells[0].key, "37.000,-122.000");
    }

    #[test]
    fn test_key_has_no_negative_zero() {
        assert_eq!(cell_key(-0.00001, 0.00002, 4), "0.0000,0.0000");
        assert_eq!(cell_key(-0.00006, 0.0, 4), "-0.0001,0.0000");
    }

    #[test]
    fn test_bands_monotonic() {
        let mut previous = HeatBand::Low;
        for step in 0..=100 {
            let band = HeatBand::from_intensity(step as f64 / 100.0);
            assert!(band >= previous);
            previous = band;
        }
        assert_eq!(HeatBand::from_intensity(0.0), HeatBand::Low);
        assert_eq!(HeatBand::from_intensity(0.2), HeatBand::Medium);
        assert_eq!(HeatBand::from_intensity(0.4), HeatBand::High);
        assert_eq!(HeatBand::from_intensity(0.6), HeatBand::VeryHigh);
        assert_eq!(HeatBand::from_intensity(0.8), HeatBand::Extreme);
        assert_eq!(HeatBand::from_intensity(1.0), HeatBand::Extreme);
    }

    #[test]
    fn test_radius_monotonic_and_clipped() {
        let config = HeatmapConfig::default();
        let mut previous = 0.0;
        for visits in 1..50 {
            let radius = config.radius_for(visits);
            assert!(radius >= previous);
            assert!(radius <= config.max_radius_meters);
            previous = radius;
        }
        assert_eq!(config.radius_for(1), 15.0);
        assert_eq!(config.radius_for(4), 30.0);
        assert_eq!(config.radius_for(100), 60.0);
    }

    #[test]
    fn test_bounds() {
        let result = generate_heatmap(&mixed_log(), &HeatmapConfig::default());
        let bounds = result.bounds.unwrap();
        assert_eq!(bounds.min_lat, -33.8688);
        assert_eq!(bounds.max_lat, 37.0101);
        assert_eq!(bounds.min_lng, -122.0203);
        assert_eq!(bounds.max_lng, 151.2093);
    }

    #[test]
    fn test_cell_for_location() {
        let result = generate_heatmap(&mixed_log(), &HeatmapConfig::default());
        let cell = cell_for_location(&result, 37.000004, -121.99998).unwrap();
        assert_eq!(cell.key, "37.0000,-122.0000");
        assert!(cell_for_location(&result, 10.0, 10.0).is_none());
    }

    #[test]
    fn test_cell_index_nearest() {
        let result = generate_heatmap(&mixed_log(), &HeatmapConfig::default());
        let index = CellIndex::build(&result);
        assert_eq!(index.len(), 3);

        // ~20m from the busy cell, inside its radius (15 + 6*5 = 45m)
        let cell = index.nearest(&result, 37.00018, -122.0).unwrap();
        assert_eq!(cell.key, "37.0000,-122.0000");

        // Far from every cell
        assert!(index.nearest(&result, 0.0, 0.0).is_none());
        assert!(index.nearest(&result, f64::NAN, 0.0).is_none());
    }

    #[test]
    fn test_config_validation() {
        assert!(HeatmapConfig::default().validate().is_ok());
        let bad = HeatmapConfig {
            precision: 9,
            ..HeatmapConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = HeatmapConfig {
            max_radius_meters: 1.0,
            ..HeatmapConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
