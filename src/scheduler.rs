//! # Tracking Scheduler
//!
//! Decides when and how fixes are requested, reconciling two independent
//! sampling paths:
//!
//! - **Foreground**: two tokio tasks feeding the shared pipeline, a push
//!   subscription (`Continuous`) and a fixed-interval backup poll (`TimerBackup`).
//! - **Background**: a periodic job registered with the host facility, running
//!   [`run_background_unit`](crate::background::run_background_unit).
//!
//! Control state is `Stopped` or `Running { armed }`, where `armed` names the
//! path currently sampling. Host lifecycle callbacks become [`ControlEvent`]s
//! fed through one pure [`transition`] function; the returned
//! [`SchedulerAction`]s are then executed in order.
//!
//! The user-facing [`TrackingState`] is not a scheduler state. It is derived on
//! every observation from persisted data by [`derive_tracking_state`].

use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::background::{BackgroundContext, BackgroundTaskHost, PeriodicTaskRequest, TaskConstraints};
use crate::error::{Result, TrackerError};
use crate::persistence::{keys, PersistenceGateway};
use crate::pipeline::{IngestOutcome, SharedPipeline};
use crate::provider::{acquire_fix, ensure_ready, GeoFixProvider};
use crate::{now_millis, RawFix, SampleSource};

/// Last sample younger than this: `Active`.
pub const ACTIVE_WINDOW_MILLIS: i64 = 2 * 60 * 1000;

/// Last sample younger than this (and not active): `Background`.
pub const BACKGROUND_WINDOW_MILLIS: i64 = 20 * 60 * 1000;

/// Scheduler timing and background registration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the foreground backup poll.
    /// Default: 60_000 ms
    pub backup_poll_interval_millis: u64,

    /// Nominal background period, a lower bound only.
    /// Default: 900_000 ms (15 minutes)
    pub background_interval_millis: u64,

    /// Task id used with the host facility.
    /// Default: "location_heatmap.background_fix"
    pub background_task_id: String,

    pub constraints: TaskConstraints,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backup_poll_interval_millis: 60_000,
            background_interval_millis: 15 * 60 * 1000,
            background_task_id: "location_heatmap.background_fix".to_string(),
            constraints: TaskConstraints::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backup_poll_interval_millis == 0 {
            return Err(TrackerError::config(
                "scheduler.backup_poll_interval_millis must be positive",
            ));
        }
        if self.background_interval_millis == 0 {
            return Err(TrackerError::config(
                "scheduler.background_interval_millis must be positive",
            ));
        }
        if self.background_task_id.trim().is_empty() {
            return Err(TrackerError::config(
                "scheduler.background_task_id must not be empty",
            ));
        }
        Ok(())
    }

    pub fn backup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.backup_poll_interval_millis)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_millis(self.background_interval_millis)
    }
}

// ============================================================================
// Tracking state view
// ============================================================================

/// Five-value view over persisted tracking data, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    Stopped,
    /// Tracking, no sample yet
    Starting,
    /// Last sample under 2 minutes old
    Active,
    /// Last sample 2 to 20 minutes old
    Background,
    /// Last sample 20 minutes old or more
    Inactive,
}

impl TrackingState {
    pub fn label(&self) -> &'static str {
        match self {
            TrackingState::Stopped => "Stopped",
            TrackingState::Starting => "Starting",
            TrackingState::Active => "Active",
            TrackingState::Background => "Background",
            TrackingState::Inactive => "Inactive",
        }
    }
}

/// Derive the tracking state from persisted flags. Never cached.
///
/// A last sample dated after `now` (clock skew) counts as `Active`.
pub fn derive_tracking_state(
    is_tracking: bool,
    last_sample_time: Option<i64>,
    now_millis: i64,
) -> TrackingState {
    if !is_tracking {
        return TrackingState::Stopped;
    }
    let Some(last) = last_sample_time else {
        return TrackingState::Starting;
    };

    let age = now_millis.saturating_sub(last);
    if age < ACTIVE_WINDOW_MILLIS {
        TrackingState::Active
    } else if age < BACKGROUND_WINDOW_MILLIS {
        TrackingState::Background
    } else {
        TrackingState::Inactive
    }
}

// ============================================================================
// Control state machine
// ============================================================================

/// Which sampling path is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplingPath {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlState {
    Stopped,
    Running { armed: SamplingPath },
}

/// Inputs to the control state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlEvent {
    Start,
    Stop,
    /// App moved to the background
    HostSuspended,
    /// App returned to the foreground
    HostResumed,
    /// App UI torn down while the process may live on
    HostDetached,
}

/// Side effects requested by a transition, executed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerAction {
    ArmForeground,
    DisarmForeground,
    RegisterBackground,
    CancelBackground,
}

/// Pure transition function for the control state machine.
pub fn transition(state: ControlState, event: ControlEvent) -> (ControlState, Vec<SchedulerAction>) {
    use ControlEvent::*;
    use SchedulerAction::*;

    let foreground = ControlState::Running {
        armed: SamplingPath::Foreground,
    };
    let background = ControlState::Running {
        armed: SamplingPath::Background,
    };

    match (state, event) {
        (ControlState::Stopped, Start) => (foreground, vec![ArmForeground]),
        (ControlState::Stopped, Stop) => (ControlState::Stopped, vec![CancelBackground]),
        (ControlState::Stopped, _) => (ControlState::Stopped, vec![]),

        (ControlState::Running { .. }, Start) => (state, vec![]),
        (ControlState::Running { armed }, Stop) => {
            let actions = match armed {
                SamplingPath::Foreground => vec![DisarmForeground, CancelBackground],
                SamplingPath::Background => vec![CancelBackground],
            };
            (ControlState::Stopped, actions)
        }

        (ControlState::Running { armed: SamplingPath::Foreground }, HostSuspended | HostDetached) => {
            (background, vec![DisarmForeground, RegisterBackground])
        }
        (ControlState::Running { armed: SamplingPath::Foreground }, HostResumed) => (state, vec![]),

        (ControlState::Running { armed: SamplingPath::Background }, HostResumed) => {
            (foreground, vec![CancelBackground, ArmForeground])
        }
        (ControlState::Running { armed: SamplingPath::Background }, HostSuspended | HostDetached) => {
            (state, vec![])
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

struct ForegroundLoop {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Drives the foreground loop and the background registration.
pub struct TrackingScheduler {
    config: SchedulerConfig,
    gateway: Arc<dyn PersistenceGateway>,
    provider: Arc<dyn GeoFixProvider>,
    host: Arc<dyn BackgroundTaskHost>,
    pipeline: SharedPipeline,
    background: BackgroundContext,
    state: ControlState,
    foreground: Option<ForegroundLoop>,
}

impl TrackingScheduler {
    pub fn new(
        config: SchedulerConfig,
        pipeline: SharedPipeline,
        background: BackgroundContext,
        host: Arc<dyn BackgroundTaskHost>,
    ) -> Self {
        Self {
            config,
            gateway: background.gateway.clone(),
            provider: background.provider.clone(),
            host,
            pipeline,
            background,
            state: ControlState::Stopped,
            foreground: None,
        }
    }

    pub fn control_state(&self) -> ControlState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ControlState::Running { .. })
    }

    /// Start tracking. Checks the service and permission, prompting once.
    ///
    /// Calling `start` while running is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            debug!("[TrackingScheduler] Already running");
            return Ok(());
        }
        ensure_ready(self.provider.as_ref(), true).await?;
        self.gateway.set_bool(keys::WAS_TRACKING, true)?;
        info!("[TrackingScheduler] Tracking started");
        self.apply(ControlEvent::Start).await
    }

    /// Stop tracking: clear the persisted flag, stop the foreground loop and
    /// cancel the background job.
    pub async fn stop(&mut self) -> Result<()> {
        let persisted = self.gateway.set_bool(keys::WAS_TRACKING, false);
        let applied = self.apply(ControlEvent::Stop).await;
        info!("[TrackingScheduler] Tracking stopped");
        persisted.and(applied)
    }

    /// Cold-start recovery: resume tracking if it was left on, without a
    /// permission prompt. Returns whether tracking resumed.
    pub async fn restore(&mut self) -> Result<bool> {
        if self.is_running() {
            return Ok(true);
        }
        let was_tracking = self.gateway.get_bool(keys::WAS_TRACKING)?.unwrap_or(false);
        if !was_tracking {
            debug!("[TrackingScheduler] Nothing to restore");
            return Ok(false);
        }
        ensure_ready(self.provider.as_ref(), false).await?;
        info!("[TrackingScheduler] Restoring tracking from persisted state");
        self.apply(ControlEvent::Start).await?;
        Ok(true)
    }

    /// Feed a host lifecycle event through the state machine.
    pub async fn handle_host_event(&mut self, event: ControlEvent) -> Result<()> {
        debug!("[TrackingScheduler] Host event {:?} in {:?}", event, self.state);
        self.apply(event).await
    }

    /// Current tracking state, read fresh from persisted data.
    pub fn tracking_state(&self) -> Result<TrackingState> {
        self.tracking_state_at(now_millis())
    }

    pub fn tracking_state_at(&self, now: i64) -> Result<TrackingState> {
        let is_tracking = self.gateway.get_bool(keys::WAS_TRACKING)?.unwrap_or(false);
        let last_sample_time = self.gateway.get_int(keys::LAST_TRACKING_TIME)?;
        Ok(derive_tracking_state(is_tracking, last_sample_time, now))
    }

    async fn apply(&mut self, event: ControlEvent) -> Result<()> {
        let (next, actions) = transition(self.state, event);
        if next != self.state {
            debug!("[TrackingScheduler] {:?} -> {:?}", self.state, next);
        }
        self.state = next;

        // Run every action even if one fails; report the first failure
        let mut first_error = None;
        for action in actions {
            if let Err(err) = self.execute(action).await {
                error!("[TrackingScheduler] {:?} failed: {}", action, err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn execute(&mut self, action: SchedulerAction) -> Result<()> {
        match action {
            SchedulerAction::ArmForeground => self.arm_foreground().await,
            SchedulerAction::DisarmForeground => {
                self.disarm_foreground();
                Ok(())
            }
            SchedulerAction::RegisterBackground => self.host.register_periodic(
                PeriodicTaskRequest {
                    id: self.config.background_task_id.clone(),
                    interval: self.config.background_interval(),
                    constraints: self.config.constraints.clone(),
                },
                self.background.callback(),
            ),
            SchedulerAction::CancelBackground => self.host.cancel(&self.config.background_task_id),
        }
    }

    async fn arm_foreground(&mut self) -> Result<()> {
        self.disarm_foreground();

        // Pick up whatever the background path wrote while we were away
        let reloaded = self.pipeline.lock().await.reload();
        if let Err(err) = reloaded {
            warn!("[TrackingScheduler] History reload failed: {}", err);
        }

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(run_fix_stream(
                self.provider.clone(),
                self.pipeline.clone(),
                cancel.clone(),
            )),
            tokio::spawn(run_backup_poll(
                self.provider.clone(),
                self.pipeline.clone(),
                self.config.backup_poll_interval(),
                cancel.clone(),
            )),
        ];
        self.foreground = Some(ForegroundLoop { cancel, tasks });
        info!("[TrackingScheduler] Foreground sampling armed");
        Ok(())
    }

    fn disarm_foreground(&mut self) {
        if let Some(foreground) = self.foreground.take() {
            foreground.cancel.cancel();
            debug!(
                "[TrackingScheduler] Foreground sampling disarmed ({} tasks)",
                foreground.tasks.len()
            );
        }
    }

    /// Whether the foreground tasks are armed and still alive.
    pub fn foreground_active(&self) -> bool {
        self.foreground
            .as_ref()
            .map(|f| !f.cancel.is_cancelled() && f.tasks.iter().any(|t| !t.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for TrackingScheduler {
    fn drop(&mut self) {
        self.disarm_foreground();
    }
}

async fn ingest_logged(pipeline: &SharedPipeline, fix: RawFix, source: SampleSource) {
    let outcome = pipeline.lock().await.ingest(&fix, source);
    match outcome {
        Ok(IngestOutcome::Accepted(sample)) => debug!(
            "[TrackingScheduler] {} sample accepted at {}",
            source.as_str(),
            sample.timestamp_millis
        ),
        Ok(IngestOutcome::Rejected(reason)) => {
            debug!("[TrackingScheduler] {} fix rejected: {:?}", source.as_str(), reason)
        }
        Err(err) => error!("[TrackingScheduler] Failed to store {} sample: {}", source.as_str(), err),
    }
}

/// Push subscription path. Ends on cancellation or when the stream closes.
async fn run_fix_stream(provider: Arc<dyn GeoFixProvider>, pipeline: SharedPipeline, cancel: CancellationToken) {
    let mut fixes = provider.subscribe();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = fixes.next() => next,
        };
        match next {
            Some(Ok(fix)) => ingest_logged(&pipeline, fix, SampleSource::Continuous).await,
            Some(Err(err)) => warn!("[TrackingScheduler] Stream error: {}", err),
            None => {
                info!("[TrackingScheduler] Location stream ended");
                break;
            }
        }
    }
}

/// Fixed-interval backup poll covering gaps in the push stream. The first
/// poll fires immediately.
async fn run_backup_poll(
    provider: Arc<dyn GeoFixProvider>,
    pipeline: SharedPipeline,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let fix = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            fix = acquire_fix(provider.as_ref()) => fix,
        };
        match fix {
            Ok(fix) => ingest_logged(&pipeline, fix, SampleSource::TimerBackup).await,
            Err(err) => warn!("[TrackingScheduler] Backup poll failed: {}", err),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
