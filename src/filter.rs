//! Sample filter: accuracy gate plus stationary-point suppression.
//!
//! Rules are applied in order:
//! 1. Reject non-finite or out-of-range coordinates.
//! 2. Reject fixes whose reported accuracy is worse than the gate (strict `>`).
//! 3. Accept the first fix unconditionally.
//! 4. Reject fixes that are both close to (`< min_distance_meters`) and recent
//!    relative to (`< min_interval_millis`) the last accepted sample.
//!
//! Anything that moved far enough, or is old enough, goes through. This bounds
//! storage growth while the device is stationary but still captures slow drift.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};
use crate::geo_utils::haversine_distance;
use crate::{LocationSample, RawFix, SampleSource};

/// Thresholds for the sample filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Fixes with a reported accuracy above this are dropped.
    /// Default: 50.0 meters
    pub max_accuracy_meters: f64,

    /// Minimum movement for a fix to count as new.
    /// Default: 10.0 meters
    pub min_distance_meters: f64,

    /// Minimum age relative to the last accepted sample for a stationary fix to count.
    /// Default: 120_000 ms (2 minutes)
    pub min_interval_millis: i64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_accuracy_meters: 50.0,
            min_distance_meters: 10.0,
            min_interval_millis: 120_000,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_accuracy_meters.is_finite() && self.max_accuracy_meters > 0.0) {
            return Err(TrackerError::config(
                "filter.max_accuracy_meters must be a positive number",
            ));
        }
        if !(self.min_distance_meters.is_finite() && self.min_distance_meters >= 0.0) {
            return Err(TrackerError::config(
                "filter.min_distance_meters must be non-negative",
            ));
        }
        if self.min_interval_millis < 0 {
            return Err(TrackerError::config(
                "filter.min_interval_millis must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Why a fix was not accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// Coordinates were NaN/infinite or outside the WGS84 range
    InvalidCoordinates,
    /// Reported accuracy worse than the gate
    LowAccuracy { accuracy_meters: f64, max_meters: f64 },
    /// Too close to, and too soon after, the last accepted sample
    Stationary { distance_meters: f64, elapsed_millis: i64 },
}

/// Outcome of filtering one fix.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Accept(LocationSample),
    Reject(RejectReason),
}

impl FilterDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FilterDecision::Accept(_))
    }
}

/// Pure, deterministic sample filter.
#[derive(Debug, Clone, Default)]
pub struct SampleFilter {
    config: FilterConfig,
}

impl SampleFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Decide whether `candidate` should be appended after `last_accepted`.
    ///
    /// Has no side effects; the caller appends the accepted sample.
    pub fn filter(
        &self,
        candidate: &RawFix,
        source: SampleSource,
        last_accepted: Option<&LocationSample>,
    ) -> FilterDecision {
        if !candidate.point().is_valid() {
            return FilterDecision::Reject(RejectReason::InvalidCoordinates);
        }

        if let Some(accuracy) = candidate.accuracy_meters {
            // NaN accuracy is treated as unknown rather than as a failure
            if accuracy > self.config.max_accuracy_meters {
                return FilterDecision::Reject(RejectReason::LowAccuracy {
                    accuracy_meters: accuracy,
                    max_meters: self.config.max_accuracy_meters,
                });
            }
        }

        let Some(last) = last_accepted else {
            return FilterDecision::Accept(LocationSample::from_fix(candidate, source));
        };

        let distance = haversine_distance(&last.point(), &candidate.point());
        let elapsed = candidate.timestamp_millis - last.timestamp_millis;

        if distance < self.config.min_distance_meters && elapsed < self.config.min_interval_millis
        {
            return FilterDecision::Reject(RejectReason::Stationary {
                distance_meters: distance,
                elapsed_millis: elapsed,
            });
        }

        FilterDecision::Accept(LocationSample::from_fix(candidate, source))
    }
}
