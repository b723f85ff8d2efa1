//! # History Store
//!
//! Bounded, append-only log of accepted samples, persisted through a
//! [`PersistenceGateway`].
//!
//! - `append` keeps the trailing `capacity` samples and writes the full list with
//!   replace-all semantics. The in-memory log only changes once the write has
//!   succeeded, so memory never runs ahead of storage.
//! - `load` skips entries that fail to decode instead of failing the load.
//! - `clear` drops the log and every key tied to it.
//!
//! There is no lock shared with the background context: a background run opens
//! its own store from the gateway. Two writers racing on the same gateway
//! resolve as last-write-wins at list granularity.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};
use crate::filter::{FilterDecision, SampleFilter};
use crate::persistence::{keys, PersistenceGateway};
use crate::{LocationSample, RawFix, SampleSource};

/// Ordered snapshot of the log, oldest first.
pub type HistoryLog = Vec<LocationSample>;

/// Configuration for the history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum number of samples kept (oldest dropped first).
    /// Default: 1000
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

impl HistoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(TrackerError::config("history.capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Summary of the current log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub sample_count: usize,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    /// Sample count per source tag
    pub by_source: BTreeMap<String, usize>,
}

/// Bounded persisted sample log.
pub struct HistoryStore {
    gateway: Arc<dyn PersistenceGateway>,
    samples: VecDeque<LocationSample>,
    capacity: usize,
    /// Entries skipped by the most recent load
    skipped_on_load: usize,
}

impl HistoryStore {
    /// Create an empty store without touching persisted state.
    pub fn new(gateway: Arc<dyn PersistenceGateway>, config: &HistoryConfig) -> Self {
        Self {
            gateway,
            samples: VecDeque::with_capacity(config.capacity.min(4096)),
            capacity: config.capacity.max(1),
            skipped_on_load: 0,
        }
    }

    /// Create a store and load the persisted log into it.
    pub fn open(gateway: Arc<dyn PersistenceGateway>, config: &HistoryConfig) -> Result<Self> {
        let mut store = Self::new(gateway, config);
        store.load()?;
        Ok(store)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Most recently accepted sample, used as the filter reference.
    pub fn last_accepted(&self) -> Option<&LocationSample> {
        self.samples.back()
    }

    /// Number of corrupt entries dropped by the last `load`.
    pub fn skipped_on_load(&self) -> usize {
        self.skipped_on_load
    }

    /// Copy of the log, oldest first.
    pub fn snapshot(&self) -> HistoryLog {
        self.samples.iter().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocationSample> {
        self.samples.iter()
    }

    /// Replace the in-memory log with the persisted one.
    ///
    /// Entries that fail to decode are skipped individually. A persisted list
    /// longer than the capacity is trimmed to its most recent entries.
    pub fn load(&mut self) -> Result<HistoryLog> {
        let raw = self
            .gateway
            .get_string_list(keys::LOCATION_HISTORY)?
            .unwrap_or_default();

        let mut skipped = 0;
        let mut samples: VecDeque<LocationSample> = raw
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match LocationSample::from_json(entry) {
                Ok(sample) => Some(sample),
                Err(err) => {
                    skipped += 1;
                    warn!("[HistoryStore] Skipping entry {}: {}", index, err);
                    None
                }
            })
            .collect();

        while samples.len() > self.capacity {
            samples.pop_front();
        }

        info!(
            "[HistoryStore] Loaded {} samples ({} skipped)",
            samples.len(),
            skipped
        );

        self.samples = samples;
        self.skipped_on_load = skipped;
        Ok(self.snapshot())
    }

    /// Append a sample, truncate to capacity and persist the full log.
    ///
    /// On a persistence error the in-memory log is left as it was.
    pub fn append(&mut self, sample: LocationSample) -> Result<()> {
        let mut next = self.samples.clone();
        next.push_back(sample);
        let mut dropped = 0;
        while next.len() > self.capacity {
            next.pop_front();
            dropped += 1;
        }

        let encoded = next
            .iter()
            .map(LocationSample::to_json)
            .collect::<Result<Vec<String>>>()?;
        self.gateway
            .set_string_list(keys::LOCATION_HISTORY, &encoded)?;

        if dropped > 0 {
            debug!("[HistoryStore] Dropped {} oldest samples", dropped);
        }
        self.samples = next;
        Ok(())
    }

    /// Run `fix` through the filter against the last accepted sample and append
    /// it if accepted. Also records the capture time as the last tracking time.
    ///
    /// This is the one path every sampling source goes through.
    pub fn record(
        &mut self,
        filter: &SampleFilter,
        fix: &RawFix,
        source: SampleSource,
    ) -> Result<FilterDecision> {
        let decision = filter.filter(fix, source, self.last_accepted());
        match &decision {
            FilterDecision::Accept(sample) => {
                self.append(*sample)?;
                // The sample is already stored; a stale timestamp only affects the state view
                if let Err(e) = self
                    .gateway
                    .set_int(keys::LAST_TRACKING_TIME, sample.timestamp_millis)
                {
                    warn!("[HistoryStore] Failed to update last tracking time: {}", e);
                }
                debug!(
                    "[HistoryStore] Accepted {} sample ({:.5}, {:.5}), {} stored",
                    source.as_str(),
                    sample.latitude,
                    sample.longitude,
                    self.samples.len()
                );
            }
            FilterDecision::Reject(reason) => {
                debug!("[HistoryStore] Rejected {} fix: {:?}", source.as_str(), reason);
            }
        }
        Ok(decision)
    }

    /// Empty the log and remove the history, last-tracking-time and run counter keys.
    pub fn clear(&mut self) -> Result<()> {
        self.gateway.remove(keys::LOCATION_HISTORY)?;
        self.gateway.remove(keys::LAST_TRACKING_TIME)?;
        self.gateway.remove(keys::CONSECUTIVE_BG_UPDATES)?;
        self.samples.clear();
        self.skipped_on_load = 0;
        info!("[HistoryStore] Cleared history");
        Ok(())
    }

    pub fn stats(&self) -> HistoryStats {
        let mut by_source = BTreeMap::new();
        for sample in &self.samples {
            *by_source.entry(sample.source.as_str().to_string()).or_insert(0) += 1;
        }
        HistoryStats {
            sample_count: self.samples.len(),
            first_timestamp: self.samples.front().map(|s| s.timestamp_millis),
            last_timestamp: self.samples.back().map(|s| s.timestamp_millis),
            by_source,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
