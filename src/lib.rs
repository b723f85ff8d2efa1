//! # Location Heatmap
//!
//! Location sampling, filtering and visit heatmaps for mobile trackers.
//!
//! This library provides:
//! - A stationary-point suppressing sample filter (accuracy gate + distance/time rule)
//! - A bounded, persisted history log with corrupt-entry tolerant loading
//! - A tracking scheduler reconciling a foreground loop with an OS background job
//! - Deterministic heatmap aggregation over rounded-coordinate cells
//!
//! ## Features
//!
//! - **`persistence`** (default) - SQLite-backed [`PersistenceGateway`]
//!
//! ## Quick Start
//!
//! ```rust
//! use location_heatmap::{
//!     generate_heatmap, HeatmapConfig, RawFix, SampleFilter, SampleSource, FilterDecision,
//! };
//!
//! let filter = SampleFilter::default();
//! let fix = RawFix::new(37.0, -122.0, 1_700_000_000_000).with_accuracy(10.0);
//!
//! let mut log = Vec::new();
//! if let FilterDecision::Accept(sample) = filter.filter(&fix, SampleSource::Continuous, None) {
//!     log.push(sample);
//! }
//!
//! let heatmap = generate_heatmap(&log, &HeatmapConfig::default());
//! assert_eq!(heatmap.cells.len(), 1);
//! assert_eq!(heatmap.cells[0].visit_count, 1);
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// Unified error handling
pub mod error;
pub use error::{Result, TrackerError};

// Geographic utilities (haversine distance, degree conversions)
pub mod geo_utils;

// Configuration (aggregate of per-component configs)
pub mod config;
pub use config::TrackerConfig;

// Accuracy gate + stationary-point suppression
pub mod filter;
pub use filter::{FilterConfig, FilterDecision, RejectReason, SampleFilter};

// Durable key/value storage seam
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteGateway;
pub use persistence::{keys, MemoryGateway, PersistenceGateway};

// Bounded persisted sample log
pub mod history;
pub use history::{HistoryConfig, HistoryLog, HistoryStats, HistoryStore};

// Heatmap generation module
pub mod heatmap;
pub use heatmap::{
    cell_for_location, cell_key, generate_heatmap, query_heatmap_cell, CellIndex, HeatBand,
    HeatCell, HeatmapBounds, HeatmapConfig, HeatmapResult,
};

// Location provider capability
pub mod provider;
pub use provider::{acquire_fix, ensure_ready, GeoFixProvider, PermissionStatus};

// Host background-task facility and the self-contained background run
pub mod background;
pub use background::{
    run_background_unit, BackgroundCallback, BackgroundContext, BackgroundHealth,
    BackgroundRunReport, BackgroundTaskHost, PeriodicTaskRequest, TaskConstraints,
    TokioBackgroundHost,
};

// Foreground single-writer pipeline (filter -> append -> heatmap)
pub mod pipeline;
pub use pipeline::{IngestOutcome, SamplePipeline, SharedPipeline};

// Tracking state machine and foreground loop
pub mod scheduler;
pub use scheduler::{
    derive_tracking_state, transition, ControlEvent, ControlState, SamplingPath,
    SchedulerAction, SchedulerConfig, TrackingScheduler, TrackingState,
};

// Facade for the presentation layer
pub mod engine;
pub use engine::{EngineStats, TrackerEngine};

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("LocationHeatmap"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms; hosts install their own `log` backend
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use location_heatmap::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Which sampling path produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum SampleSource {
    /// Push subscription to continuous location updates
    #[default]
    Continuous,
    /// Fixed-interval foreground poll covering gaps in the push stream
    TimerBackup,
    /// OS-scheduled background job
    Background,
}

impl SampleSource {
    /// Wire tag used in the persisted JSON format.
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleSource::Continuous => "continuous",
            SampleSource::TimerBackup => "timer_backup",
            SampleSource::Background => "background",
        }
    }

    /// Parse a wire tag. Unknown tags fall back to [`SampleSource::Continuous`]
    /// so a single odd entry never fails a history load.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "continuous" => SampleSource::Continuous,
            "timer_backup" => SampleSource::TimerBackup,
            "background" => SampleSource::Background,
            other => {
                log::debug!("[LocationSample] Unknown source tag '{}', using continuous", other);
                SampleSource::Continuous
            }
        }
    }
}

impl Serialize for SampleSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SampleSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // Accept any JSON value: strings are parsed, anything else (null, numbers) defaults
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(raw.as_str().map(SampleSource::from_tag).unwrap_or_default())
    }
}

/// A raw reading as returned by a [`GeoFixProvider`], before filtering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported error radius in meters, if the provider knows it
    pub accuracy_meters: Option<f64>,
    /// Capture time in milliseconds since the Unix epoch
    pub timestamp_millis: i64,
}

impl RawFix {
    /// Create a fix without accuracy information.
    pub fn new(latitude: f64, longitude: f64, timestamp_millis: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters: None,
            timestamp_millis,
        }
    }

    /// Attach a reported accuracy radius.
    pub fn with_accuracy(mut self, accuracy_meters: f64) -> Self {
        self.accuracy_meters = Some(accuracy_meters);
        self
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// An accepted location sample.
///
/// The serialized form is the persisted wire format, one JSON object per
/// history entry:
/// `{"latitude": f64, "longitude": f64, "timestamp": i64, "accuracy": f64|null, "source": string}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Capture time in milliseconds since the Unix epoch
    #[serde(rename = "timestamp")]
    pub timestamp_millis: i64,
    /// Reported error radius in meters (`null` when unknown)
    #[serde(rename = "accuracy", default)]
    pub accuracy_meters: Option<f64>,
    #[serde(default)]
    pub source: SampleSource,
}

impl LocationSample {
    /// Build a sample from an accepted fix.
    pub fn from_fix(fix: &RawFix, source: SampleSource) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            timestamp_millis: fix.timestamp_millis,
            accuracy_meters: fix.accuracy_meters,
            source,
        }
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    /// Serialize to the persisted wire format.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| TrackerError::persistence(format!("failed to encode sample: {}", e)))
    }

    /// Parse one persisted entry, rejecting out-of-range coordinates.
    pub fn from_json(raw: &str) -> Result<Self> {
        let sample: LocationSample =
            serde_json::from_str(raw).map_err(|e| TrackerError::MalformedRecord {
                message: e.to_string(),
            })?;
        if !sample.point().is_valid() {
            return Err(TrackerError::MalformedRecord {
                message: format!(
                    "coordinates out of range ({}, {})",
                    sample.latitude, sample.longitude
                ),
            });
        }
        Ok(sample)
    }
}

// ============================================================================
// Tests
// ============================================================================
