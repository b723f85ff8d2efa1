//! End-to-end tracking lifecycle: foreground sampling, suspension into the
//! background job, resumption, and cold-start restore.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};

use location_heatmap::{
    keys, now_millis, BackgroundTaskHost, ControlEvent, ControlState, GeoFixProvider,
    MemoryGateway, PermissionStatus, PersistenceGateway, RawFix, Result, SampleSource,
    SamplingPath, TokioBackgroundHost, TrackerConfig, TrackerEngine, TrackerError, TrackingState,
};

struct ScriptedProvider {
    granted: AtomicBool,
    fixes: Mutex<VecDeque<Result<RawFix>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Result<RawFix>>>>,
}

impl ScriptedProvider {
    fn new() -> Self {
        Self {
            granted: AtomicBool::new(true),
            fixes: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn script(&self, fix: Result<RawFix>) {
        self.fixes.lock().unwrap().push_back(fix);
    }

    fn emit(&self, fix: RawFix) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.unbounded_send(Ok(fix)).is_ok());
    }
}

impl GeoFixProvider for ScriptedProvider {
    fn is_service_enabled(&self) -> BoxFuture<'_, bool> {
        async { true }.boxed()
    }

    fn has_permission(&self) -> BoxFuture<'_, PermissionStatus> {
        let status = if self.granted.load(Ordering::SeqCst) {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        };
        async move { status }.boxed()
    }

    fn request_permission(&self) -> BoxFuture<'_, PermissionStatus> {
        self.has_permission()
    }

    fn get_fix(&self) -> BoxFuture<'_, Result<RawFix>> {
        let next = self.fixes.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(TrackerError::FixAcquisitionFailed {
                message: "no fix scripted".to_string(),
            })
        });
        async move { next }.boxed()
    }

    fn subscribe(&self) -> BoxStream<'static, Result<RawFix>> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx.boxed()
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

fn engine(
    gateway: Arc<dyn PersistenceGateway>,
    provider: Arc<ScriptedProvider>,
    host: Arc<TokioBackgroundHost>,
) -> TrackerEngine {
    TrackerEngine::new(TrackerConfig::default(), gateway, provider, host).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_suspend_background_resume() {
    let _ = env_logger::builder().is_test(true).try_init();

    let gateway = Arc::new(MemoryGateway::new());
    let provider = Arc::new(ScriptedProvider::new());
    let host = Arc::new(TokioBackgroundHost::new());
    let mut engine = engine(gateway.clone(), provider.clone(), host.clone());

    let t0 = now_millis();
    provider.script(Ok(RawFix::new(37.0, -122.0, t0).with_accuracy(10.0)));

    engine.start().await.unwrap();
    settle().await;
    assert_eq!(engine.sample_count().await, 1);

    // Push subscription feeds the same pipeline
    provider.emit(RawFix::new(37.002, -122.0, t0 + 5_000).with_accuracy(8.0));
    settle().await;
    assert_eq!(engine.sample_count().await, 2);

    engine
        .handle_host_event(ControlEvent::HostSuspended)
        .await
        .unwrap();
    assert_eq!(
        engine.control_state(),
        ControlState::Running {
            armed: SamplingPath::Background
        }
    );
    assert!(host.is_registered(&engine.config().scheduler.background_task_id));
    gateway.set_int(keys::CONSECUTIVE_BG_UPDATES, 4).unwrap();

    // First background run fails: counter resets
    provider.script(Err(TrackerError::FixAcquisitionFailed {
        message: "gnss timeout".to_string(),
    }));
    tokio::time::sleep(Duration::from_secs(16 * 60)).await;
    assert_eq!(engine.background_health().unwrap().consecutive_runs, 0);

    // Second run succeeds: counter counts up from zero
    provider.script(Ok(RawFix::new(37.05, -122.0, t0 + 31 * 60_000).with_accuracy(12.0)));
    tokio::time::sleep(Duration::from_secs(15 * 60)).await;
    let health = engine.background_health().unwrap();
    assert_eq!(health.consecutive_runs, 1);
    assert_eq!(health.last_tracking_time, Some(t0 + 31 * 60_000));

    // Foreground picks up the background sample on resume
    engine
        .handle_host_event(ControlEvent::HostResumed)
        .await
        .unwrap();
    assert!(!host.is_registered(&engine.config().scheduler.background_task_id));
    settle().await;

    let stats = engine.history_stats().await;
    assert_eq!(stats.sample_count, 3);
    assert_eq!(stats.by_source.get(SampleSource::Background.as_str()), Some(&1));
    assert_eq!(stats.by_source.get(SampleSource::Continuous.as_str()), Some(&1));
    assert_eq!(stats.by_source.get(SampleSource::TimerBackup.as_str()), Some(&1));
    assert_eq!(engine.heat_cells().await.len(), 3);

    engine.stop().await.unwrap();
    assert_eq!(engine.tracking_state().unwrap(), TrackingState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_background_run_skips_after_stop() {
    let gateway = Arc::new(MemoryGateway::new());
    let provider = Arc::new(ScriptedProvider::new());
    let host = Arc::new(TokioBackgroundHost::new());
    let mut engine = engine(gateway.clone(), provider.clone(), host.clone());

    engine.start().await.unwrap();
    engine
        .handle_host_event(ControlEvent::HostSuspended)
        .await
        .unwrap();

    // The flag flips without going through the engine (e.g. another process)
    gateway.set_bool(keys::WAS_TRACKING, false).unwrap();
    provider.script(Ok(RawFix::new(10.0, 10.0, now_millis())));
    tokio::time::sleep(Duration::from_secs(16 * 60)).await;

    assert_eq!(engine.reload().await.unwrap(), 0);
    assert_eq!(gateway.get_int(keys::CONSECUTIVE_BG_UPDATES).unwrap(), None);

    engine.stop().await.unwrap();
    assert!(host.registered_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_start_without_permission() {
    let gateway = Arc::new(MemoryGateway::new());
    let provider = Arc::new(ScriptedProvider::new());
    provider.granted.store(false, Ordering::SeqCst);
    let mut engine = engine(gateway.clone(), provider, Arc::new(TokioBackgroundHost::new()));

    assert!(matches!(engine.start().await, Err(TrackerError::PermissionDenied)));
    assert_eq!(engine.control_state(), ControlState::Stopped);
    assert_eq!(engine.tracking_state().unwrap(), TrackingState::Stopped);
}

#[cfg(feature = "persistence")]
#[tokio::test(start_paused = true)]
async fn test_cold_start_restore_from_sqlite() {
    use location_heatmap::SqliteGateway;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tracker.db");
    let path = path.to_str().unwrap();
    let t0 = now_millis();

    {
        let gateway = Arc::new(SqliteGateway::new(path).unwrap());
        let provider = Arc::new(ScriptedProvider::new());
        provider.script(Ok(RawFix::new(48.8566, 2.3522, t0).with_accuracy(6.0)));
        let mut engine = engine(gateway, provider, Arc::new(TokioBackgroundHost::new()));
        engine.start().await.unwrap();
        settle().await;
        assert_eq!(engine.sample_count().await, 1);
        // Process dies without stopping
    }

    let gateway = Arc::new(SqliteGateway::new(path).unwrap());
    let provider = Arc::new(ScriptedProvider::new());
    let mut engine = engine(gateway, provider, Arc::new(TokioBackgroundHost::new()));
    assert_eq!(engine.sample_count().await, 1);
    assert_eq!(engine.tracking_state().unwrap(), TrackingState::Active);

    assert!(engine.restore().await.unwrap());
    assert_eq!(
        engine.control_state(),
        ControlState::Running {
            armed: SamplingPath::Foreground
        }
    );
    let cell = engine.cell_near(48.8566, 2.3522).await.unwrap();
    assert_eq!(cell.visit_count, 1);
}
