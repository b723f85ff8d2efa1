//! Foreground sample pipeline: filter → append → heatmap recompute.
//!
//! Both foreground sampling tasks feed the same [`SamplePipeline`] through a
//! [`SharedPipeline`] handle, which makes it the only in-process writer of the
//! history log.

use std::sync::Arc;

use log::debug;

use crate::config::TrackerConfig;
use crate::error::Result;
use crate::filter::{FilterDecision, RejectReason, SampleFilter};
use crate::heatmap::{generate_heatmap, query_heatmap_cell, CellIndex, HeatCell, HeatmapConfig, HeatmapResult};
use crate::history::{HistoryStats, HistoryStore};
use crate::persistence::PersistenceGateway;
use crate::{LocationSample, RawFix, SampleSource};

/// Pipeline handle shared by the foreground tasks.
pub type SharedPipeline = Arc<tokio::sync::Mutex<SamplePipeline>>;

/// Result of ingesting one fix.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted(LocationSample),
    Rejected(RejectReason),
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted(_))
    }
}

pub struct SamplePipeline {
    filter: SampleFilter,
    history: HistoryStore,
    heatmap_config: HeatmapConfig,
    heatmap: HeatmapResult,
    index: CellIndex,
}

impl SamplePipeline {
    /// Empty pipeline; call [`reload`](Self::reload) to pick up persisted history.
    pub fn new(gateway: Arc<dyn PersistenceGateway>, config: &TrackerConfig) -> Self {
        let heatmap = HeatmapResult::empty(config.heatmap.precision);
        let index = CellIndex::build(&heatmap);
        Self {
            filter: SampleFilter::new(config.filter.clone()),
            history: HistoryStore::new(gateway, &config.history),
            heatmap_config: config.heatmap.clone(),
            heatmap,
            index,
        }
    }

    /// Pipeline with the persisted history loaded and the heatmap computed.
    pub fn open(gateway: Arc<dyn PersistenceGateway>, config: &TrackerConfig) -> Result<Self> {
        let mut pipeline = Self::new(gateway, config);
        pipeline.reload()?;
        Ok(pipeline)
    }

    pub fn into_shared(self) -> SharedPipeline {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Filter a fix, append it if accepted and recompute the heatmap.
    pub fn ingest(&mut self, fix: &RawFix, source: SampleSource) -> Result<IngestOutcome> {
        match self.history.record(&self.filter, fix, source)? {
            FilterDecision::Accept(sample) => {
                self.recompute();
                Ok(IngestOutcome::Accepted(sample))
            }
            FilterDecision::Reject(reason) => Ok(IngestOutcome::Rejected(reason)),
        }
    }

    /// Reload history from the gateway (picks up background writes).
    pub fn reload(&mut self) -> Result<usize> {
        self.history.load()?;
        self.recompute();
        Ok(self.history.len())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.history.clear()?;
        self.recompute();
        Ok(())
    }

    fn recompute(&mut self) {
        let snapshot = self.history.snapshot();
        self.heatmap = generate_heatmap(&snapshot, &self.heatmap_config);
        self.index = CellIndex::build(&self.heatmap);
        debug!(
            "[SamplePipeline] Heatmap: {} cells from {} samples",
            self.heatmap.cells.len(),
            self.heatmap.total_samples
        );
    }

    pub fn heatmap(&self) -> &HeatmapResult {
        &self.heatmap
    }

    pub fn heat_cells(&self) -> &[HeatCell] {
        &self.heatmap.cells
    }

    /// Samples in the cell with the given key.
    pub fn cell_members(&self, key: &str) -> Option<&[LocationSample]> {
        query_heatmap_cell(&self.heatmap, key).map(|cell| cell.members.as_slice())
    }

    /// Nearest cell whose render circle contains the coordinate.
    pub fn cell_near(&self, latitude: f64, longitude: f64) -> Option<&HeatCell> {
        self.index.nearest(&self.heatmap, latitude, longitude)
    }

    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    pub fn stats(&self) -> HistoryStats {
        self.history.stats()
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }
}
