//! # Tracker Engine
//!
//! Stateful facade the presentation layer talks to. It owns the foreground
//! pipeline and the scheduler and exposes everything a map screen needs:
//! heat cells, tracking state, sample count, cell detail and the tracking switch.
//!
//! The engine keeps the heatmap in memory and recomputes it after every
//! accepted sample, so reads are cheap and never touch storage except for the
//! tracking state, which is always derived from persisted data.

use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::background::{BackgroundContext, BackgroundHealth, BackgroundTaskHost};
use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::heatmap::{HeatCell, HeatmapResult};
use crate::history::HistoryStats;
use crate::persistence::PersistenceGateway;
use crate::pipeline::{SamplePipeline, SharedPipeline};
use crate::provider::GeoFixProvider;
use crate::scheduler::{ControlEvent, ControlState, TrackingScheduler, TrackingState};
use crate::LocationSample;

/// The main tracker engine.
pub struct TrackerEngine {
    config: TrackerConfig,
    gateway: Arc<dyn PersistenceGateway>,
    pipeline: SharedPipeline,
    scheduler: TrackingScheduler,
}

impl TrackerEngine {
    /// Validate the config, load persisted history and build the scheduler.
    ///
    /// Does not start tracking; call [`restore`](Self::restore) on cold start.
    pub fn new(
        config: TrackerConfig,
        gateway: Arc<dyn PersistenceGateway>,
        provider: Arc<dyn GeoFixProvider>,
        host: Arc<dyn BackgroundTaskHost>,
    ) -> Result<Self> {
        config.validate()?;

        let pipeline = SamplePipeline::open(gateway.clone(), &config)?.into_shared();
        let background = BackgroundContext {
            gateway: gateway.clone(),
            provider,
            filter: config.filter.clone(),
            history: config.history.clone(),
        };
        let scheduler =
            TrackingScheduler::new(config.scheduler.clone(), pipeline.clone(), background, host);

        info!("[TrackerEngine] Created");
        Ok(Self {
            config,
            gateway,
            pipeline,
            scheduler,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    // ========================================================================
    // Tracking control
    // ========================================================================

    pub async fn start(&mut self) -> Result<()> {
        self.scheduler.start().await
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.scheduler.stop().await
    }

    /// Resume tracking if it was on when the process last exited.
    pub async fn restore(&mut self) -> Result<bool> {
        self.scheduler.restore().await
    }

    pub async fn handle_host_event(&mut self, event: ControlEvent) -> Result<()> {
        self.scheduler.handle_host_event(event).await
    }

    pub fn control_state(&self) -> ControlState {
        self.scheduler.control_state()
    }

    pub fn tracking_state(&self) -> Result<TrackingState> {
        self.scheduler.tracking_state()
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Delete all samples and the background run counter.
    pub async fn clear(&self) -> Result<()> {
        self.pipeline.lock().await.clear()?;
        info!("[TrackerEngine] History cleared");
        Ok(())
    }

    /// Reload history from storage, e.g. after background runs.
    pub async fn reload(&self) -> Result<usize> {
        self.pipeline.lock().await.reload()
    }

    pub async fn sample_count(&self) -> usize {
        self.pipeline.lock().await.sample_count()
    }

    pub async fn history_stats(&self) -> HistoryStats {
        self.pipeline.lock().await.stats()
    }

    // ========================================================================
    // Heatmap
    // ========================================================================

    pub async fn heatmap(&self) -> HeatmapResult {
        self.pipeline.lock().await.heatmap().clone()
    }

    pub async fn heat_cells(&self) -> Vec<HeatCell> {
        self.pipeline.lock().await.heat_cells().to_vec()
    }

    pub async fn heat_cells_json(&self) -> Result<String> {
        let pipeline = self.pipeline.lock().await;
        serde_json::to_string(pipeline.heat_cells())
            .map_err(|e| TrackerError::persistence(format!("failed to encode heat cells: {}", e)))
    }

    /// Samples in the cell with `key`, oldest first.
    pub async fn cell_members(&self, key: &str) -> Option<Vec<LocationSample>> {
        self.pipeline.lock().await.cell_members(key).map(|m| m.to_vec())
    }

    /// Cell under a map tap, if any.
    pub async fn cell_near(&self, latitude: f64, longitude: f64) -> Option<HeatCell> {
        self.pipeline.lock().await.cell_near(latitude, longitude).cloned()
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn background_health(&self) -> Result<BackgroundHealth> {
        BackgroundHealth::read(self.gateway.as_ref())
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let pipeline = self.pipeline.lock().await;
        let health = self.background_health()?;
        Ok(EngineStats {
            sample_count: pipeline.sample_count() as u32,
            cell_count: pipeline.heat_cells().len() as u32,
            max_visit_count: pipeline.heatmap().max_visit_count,
            tracking_state: self.tracking_state()?,
            consecutive_background_runs: health.consecutive_runs,
        })
    }
}

/// Snapshot of the engine for diagnostics screens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub sample_count: u32,
    pub cell_count: u32,
    pub max_visit_count: u32,
    pub tracking_state: TrackingState,
    pub consecutive_background_runs: i64,
}
