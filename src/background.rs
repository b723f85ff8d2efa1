//! # Background Execution
//!
//! The host's best-effort periodic task facility and the unit of work it runs.
//!
//! A background run shares no memory with the foreground context. Every
//! invocation reads what it needs fresh from the [`PersistenceGateway`]:
//! 1. Skip if `was_tracking` is false (tracking was stopped since registration).
//! 2. Check service and permission without prompting.
//! 3. Acquire one fix.
//! 4. Open the history store, run the fix through the sample filter, append.
//! 5. Increment `consecutive_bg_updates`.
//!
//! Any error or panic in steps 2-5 resets the counter to 0 and is reported as a
//! failed run. Nothing propagates back into the host.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TrackerError};
use crate::filter::{FilterConfig, SampleFilter};
use crate::history::{HistoryConfig, HistoryStore};
use crate::persistence::{keys, PersistenceGateway};
use crate::provider::{acquire_fix, ensure_ready, GeoFixProvider};
use crate::SampleSource;

/// Smallest period the host facility will honor.
pub const MIN_PERIODIC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Execution constraints passed through to the host unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConstraints {
    pub requires_network: bool,
    pub requires_battery_not_low: bool,
    pub requires_charging: bool,
    pub requires_device_idle: bool,
    pub requires_storage_not_low: bool,
}

/// A periodic task registration.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicTaskRequest {
    /// Unique task name; registering the same id again replaces the task
    pub id: String,
    /// Nominal period, a lower bound only
    pub interval: Duration,
    pub constraints: TaskConstraints,
}

/// How one background invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundRunReport {
    /// A fix was acquired and filtered. A filter rejection still counts as success.
    Completed { accepted: bool, consecutive_runs: i64 },
    /// Tracking is off; nothing was done
    Skipped,
    /// Error or panic inside the unit; the run counter was reset
    Failed { message: String },
}

impl BackgroundRunReport {
    pub fn is_success(&self) -> bool {
        matches!(self, BackgroundRunReport::Completed { .. })
    }
}

/// Work the host invokes on each period.
pub type BackgroundCallback = Arc<dyn Fn() -> BoxFuture<'static, BackgroundRunReport> + Send + Sync>;

/// Host facility for best-effort periodic execution.
pub trait BackgroundTaskHost: Send + Sync {
    fn register_periodic(&self, request: PeriodicTaskRequest, callback: BackgroundCallback) -> Result<()>;

    /// Cancel one task. Cancelling an unknown id is not an error.
    fn cancel(&self, id: &str) -> Result<()>;

    fn cancel_all(&self) -> Result<()>;
}

// ============================================================================
// Tokio host
// ============================================================================

/// In-process host backed by tokio intervals.
///
/// Enforces [`MIN_PERIODIC_INTERVAL`]. Cancelling stops the task loop between
/// ticks; a run that is already executing finishes its current unit.
#[derive(Default)]
pub struct TokioBackgroundHost {
    tasks: Mutex<HashMap<String, PeriodicTask>>,
}

struct PeriodicTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    fn stop(&self) {
        self.cancel.cancel();
    }
}

impl TokioBackgroundHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of the currently registered tasks, sorted.
    pub fn registered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = match self.tasks.lock() {
            Ok(tasks) => tasks.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.contains_key(id))
            .unwrap_or(false)
    }

    /// Whether no task loop is registered and running under `id`.
    pub fn is_finished(&self, id: &str) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.get(id).map_or(true, |task| task.handle.is_finished()))
            .unwrap_or(true)
    }

    fn lock_tasks(&self) -> Result<MutexGuard<'_, HashMap<String, PeriodicTask>>> {
        self.tasks.lock().map_err(|_| TrackerError::BackgroundHost {
            message: "task table lock poisoned".to_string(),
        })
    }
}

async fn run_periodic(id: String, period: Duration, callback: BackgroundCallback, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // Not raced against cancellation: a started unit always completes
        match AssertUnwindSafe(callback()).catch_unwind().await {
            Ok(report) => debug!("[BackgroundHost] '{}' finished: {:?}", id, report),
            Err(_) => error!("[BackgroundHost] '{}' panicked", id),
        }
    }
    debug!("[BackgroundHost] '{}' loop exited", id);
}

impl BackgroundTaskHost for TokioBackgroundHost {
    fn register_periodic(&self, request: PeriodicTaskRequest, callback: BackgroundCallback) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| TrackerError::BackgroundHost {
            message: format!("no tokio runtime: {}", e),
        })?;

        let period = request.interval.max(MIN_PERIODIC_INTERVAL);
        if period != request.interval {
            debug!(
                "[BackgroundHost] Raised interval for '{}' from {:?} to {:?}",
                request.id, request.interval, period
            );
        }

        let mut tasks = self.lock_tasks()?;
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run_periodic(
            request.id.clone(),
            period,
            callback,
            cancel.clone(),
        ));
        if let Some(previous) = tasks.insert(request.id.clone(), PeriodicTask { cancel, handle }) {
            previous.stop();
        }
        info!(
            "[BackgroundHost] Registered '{}' every {:?} ({:?})",
            request.id, period, request.constraints
        );
        Ok(())
    }

    fn cancel(&self, id: &str) -> Result<()> {
        if let Some(task) = self.lock_tasks()?.remove(id) {
            task.stop();
            info!("[BackgroundHost] Cancelled '{}'", id);
        }
        Ok(())
    }

    fn cancel_all(&self) -> Result<()> {
        let drained: Vec<(String, PeriodicTask)> = self.lock_tasks()?.drain().collect();
        for (_, task) in &drained {
            task.stop();
        }
        info!("[BackgroundHost] Cancelled {} tasks", drained.len());
        Ok(())
    }
}

impl Drop for TokioBackgroundHost {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.values() {
                task.stop();
            }
        }
    }
}

// ============================================================================
// Background run
// ============================================================================

/// Everything a background run needs; no state is shared with the foreground.
#[derive(Clone)]
pub struct BackgroundContext {
    pub gateway: Arc<dyn PersistenceGateway>,
    pub provider: Arc<dyn GeoFixProvider>,
    pub filter: FilterConfig,
    pub history: HistoryConfig,
}

impl BackgroundContext {
    /// Wrap this context as a host callback.
    pub fn callback(&self) -> BackgroundCallback {
        let context = self.clone();
        Arc::new(move || {
            let context = context.clone();
            async move { run_background_unit(&context).await }.boxed()
        })
    }
}

/// Execute one background run. Never fails and never panics outward.
pub async fn run_background_unit(context: &BackgroundContext) -> BackgroundRunReport {
    let outcome = AssertUnwindSafe(background_unit(context)).catch_unwind().await;

    let message = match outcome {
        Ok(Ok(report)) => {
            info!("[BackgroundRun] {:?}", report);
            return report;
        }
        Ok(Err(err)) => err.to_string(),
        Err(panic) => format!("panic: {}", panic_message(panic.as_ref())),
    };

    warn!("[BackgroundRun] Failed: {}", message);
    if let Err(err) = context.gateway.set_int(keys::CONSECUTIVE_BG_UPDATES, 0) {
        error!("[BackgroundRun] Could not reset run counter: {}", err);
    }
    BackgroundRunReport::Failed { message }
}

async fn background_unit(context: &BackgroundContext) -> Result<BackgroundRunReport> {
    let was_tracking = context.gateway.get_bool(keys::WAS_TRACKING)?.unwrap_or(false);
    if !was_tracking {
        return Ok(BackgroundRunReport::Skipped);
    }

    ensure_ready(context.provider.as_ref(), false).await?;
    let fix = acquire_fix(context.provider.as_ref()).await?;

    let mut store = HistoryStore::open(context.gateway.clone(), &context.history)?;
    let filter = SampleFilter::new(context.filter.clone());
    let decision = store.record(&filter, &fix, SampleSource::Background)?;

    let runs = context
        .gateway
        .get_int(keys::CONSECUTIVE_BG_UPDATES)?
        .unwrap_or(0)
        .max(0)
        .saturating_add(1);
    context.gateway.set_int(keys::CONSECUTIVE_BG_UPDATES, runs)?;

    Ok(BackgroundRunReport::Completed {
        accepted: decision.is_accepted(),
        consecutive_runs: runs,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Health of the background path as seen from persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundHealth {
    /// Consecutive successful background runs (0 after any failure)
    pub consecutive_runs: i64,
    pub last_tracking_time: Option<i64>,
}

impl BackgroundHealth {
    pub fn read(gateway: &dyn PersistenceGateway) -> Result<Self> {
        Ok(Self {
            consecutive_runs: gateway.get_int(keys::CONSECUTIVE_BG_UPDATES)?.unwrap_or(0),
            last_tracking_time: gateway.get_int(keys::LAST_TRACKING_TIME)?,
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_runs > 0
    }
}

// ============================================================================
// Tests
// ============================================================================
