// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The control loop: a single ticker that fans out stream supervision,
//! motion polling, disk cleanup, and detection-worker upkeep, plus the
//! shared runtime state ([`Nvr`]) the web surface mutates through.

use crate::detect::Dispatcher;
use crate::events::Hub;
use crate::janitor::{self, Target, WatchedFolder};
use crate::poller::{Breaker, MotionPoller};
use crate::process::Supervisor;
use crate::streamer::{playlist_path, StreamHandle, Streamer};
use crate::tracker::{Observation, Tracker, TrackerState};
use crate::verify;
use base::clock::Clocks;
use base::{Error, ErrorKind};
use db::json::{Camera, Movement, ProcessingState, Settings};
use db::store::{Namespace, ScanOpts, Store};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Control tick cadence.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Per-camera runtime state: process handle, circuit breaker, tracker.
/// Owned by a per-camera async mutex so poll tasks and web mutations never
/// interleave.
#[derive(Default)]
pub struct CameraRuntime {
    pub stream: Option<StreamHandle>,
    pub breaker: Breaker,
    pub last_poll_ms: i64,
    pub tracker_state: TrackerState,
}

type CameraCell = Arc<tokio::sync::Mutex<CameraRuntime>>;

pub struct Nvr {
    pub store: Arc<Store>,
    pub clocks: Arc<dyn Clocks>,
    pub hub: Arc<Hub>,
    pub supervisor: Arc<Supervisor>,
    pub dispatcher: Dispatcher,
    pub poller: MotionPoller,
    pub streamer: Streamer,
    pub tracker: Tracker,
    pub transcoder_bin: String,
    cameras: Mutex<HashMap<String, CameraCell>>,
    last_disk_check_ms: AtomicI64,
    shutting_down: AtomicBool,
}

impl Nvr {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        clocks: Arc<dyn Clocks>,
        hub: Arc<Hub>,
        supervisor: Arc<Supervisor>,
        dispatcher: Dispatcher,
        poller: MotionPoller,
        streamer: Streamer,
        tracker: Tracker,
        transcoder_bin: String,
    ) -> Self {
        Nvr {
            store,
            clocks,
            hub,
            supervisor,
            dispatcher,
            poller,
            streamer,
            tracker,
            transcoder_bin,
            cameras: Mutex::new(HashMap::new()),
            last_disk_check_ms: AtomicI64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> Option<Settings> {
        match self.store.get::<Settings>(Namespace::Settings, "config") {
            Ok(s) => s,
            Err(e) => {
                error!(err = %e.chain(), "unable to read settings");
                None
            }
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn camera_runtime(&self, key: &str) -> CameraCell {
        self.cameras.lock().entry(key.to_owned()).or_default().clone()
    }

    /// One pass of the control loop. A single camera's trouble must never
    /// stop the tick: every fallible per-camera step logs and moves on, and
    /// the longer-running pieces run in their own tasks.
    pub async fn tick(self: Arc<Self>) {
        let settings = self.settings();
        let cameras = match self.store.scan::<Camera>(Namespace::Cameras, &ScanOpts::forward()) {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e.chain(), "unable to scan cameras");
                return;
            }
        };

        for (key, camera) in &cameras {
            let cell = self.camera_runtime(key);
            // A busy cell means a poll or web mutation is mid-flight for
            // this camera; it'll be picked up next tick.
            let mut rt = match cell.clone().try_lock_owned() {
                Ok(rt) => rt,
                Err(_) => continue,
            };
            tick_camera_stream(&self, key, camera, &mut rt, settings.as_ref());
            maybe_poll(&self, key, camera, cell.clone(), rt);
        }

        if let Some(s) = &settings {
            maybe_run_janitor(&self, s, &cameras);
        }
        self.dispatcher.tick();
    }

    /// The folders the janitor watches for the global cleanup.
    pub fn watched_folders(&self, settings: &Settings, cameras: &[(String, Camera)]) -> Vec<WatchedFolder> {
        let mut folders: Vec<WatchedFolder> = cameras
            .iter()
            .filter(|(_, c)| !c.delete && c.enable_streaming)
            .map(|(key, c)| WatchedFolder {
                camera_key: Some(key.clone()),
                path: crate::streamer::camera_dir(c),
                evict: true,
            })
            .collect();
        let frames = PathBuf::from(&settings.disk_base_dir).join(&settings.detection_frames_path);
        if !folders.iter().any(|f| f.path == frames) {
            folders.push(WatchedFolder {
                camera_key: None,
                path: frames,
                evict: true,
            });
        }
        folders
    }

    /// Runs a cleanup immediately (the `POST /diskcleanup` path).
    pub async fn run_janitor_now(self: Arc<Self>, target: Target) -> Result<janitor::Outcome, Error> {
        let settings = self
            .settings()
            .ok_or_else(|| base::format_err_t!(FailedPrecondition, "no settings configured"))?;
        let cameras = self
            .store
            .scan::<Camera>(Namespace::Cameras, &ScanOpts::forward())?;
        let folders = self.watched_folders(&settings, &cameras);
        let base_dir = PathBuf::from(&settings.disk_base_dir);
        let nvr = self;
        tokio::task::spawn_blocking(move || {
            let usage = move || janitor::statvfs_occupancy_pct(&base_dir);
            janitor::clear_down_disk(&nvr.store, nvr.clocks.as_ref(), &folders, target, &usage)
        })
        .await
        .map_err(|e| Error::wrap(ErrorKind::Internal, e))?
    }

    /// Stops the camera's transcoder with graceful-then-force semantics and
    /// resets its runtime state.
    pub async fn stop_camera(&self, key: &str) {
        let cell = self.camera_runtime(key);
        let mut rt = cell.lock().await;
        if let Some(handle) = rt.stream.take() {
            self.streamer.stop(key, &handle).await;
        }
        rt.tracker_state = TrackerState::default();
        rt.breaker = Breaker::default();
    }

    /// Janitor-deletes all of one camera's files and movements (the `reset`
    /// / `delall` paths). The shared frames folder participates only for
    /// frame cleanup of the deleted movements.
    pub async fn wipe_camera(
        self: Arc<Self>,
        key: &str,
        camera: &Camera,
    ) -> Result<janitor::Outcome, Error> {
        let mut folders = vec![WatchedFolder {
            camera_key: Some(key.to_owned()),
            path: crate::streamer::camera_dir(camera),
            evict: true,
        }];
        if let Some(settings) = self.settings() {
            folders.push(WatchedFolder {
                camera_key: None,
                path: PathBuf::from(&settings.disk_base_dir).join(&settings.detection_frames_path),
                evict: false,
            });
        }
        let nvr = self;
        tokio::task::spawn_blocking(move || {
            let usage = || Ok(100.0);
            janitor::clear_down_disk(&nvr.store, nvr.clocks.as_ref(), &folders, Target::All, &usage)
        })
        .await
        .map_err(|e| Error::wrap(ErrorKind::Internal, e))?
    }

    /// Re-enqueues movements interrupted by a previous run: `pending` ones
    /// go back on the detection queue in key order; ones stuck `processing`
    /// are marked failed. Returns the re-enqueued keys.
    pub fn requeue_pending(&self) -> Result<Vec<String>, Error> {
        let cameras: HashMap<String, Camera> = self
            .store
            .scan::<Camera>(Namespace::Cameras, &ScanOpts::forward())?
            .into_iter()
            .collect();
        let mut requeued = Vec::new();
        for (key, mut m) in self
            .store
            .scan::<Movement>(Namespace::Movements, &ScanOpts::forward())?
        {
            match m.processing_state {
                ProcessingState::Processing => {
                    m.processing_state = ProcessingState::Failed;
                    m.processing_error = Some("interrupted by restart".to_owned());
                    self.store.put(Namespace::Movements, &key, &m)?;
                    warn!(movement = %key, "failing movement interrupted by restart");
                }
                ProcessingState::Pending => {
                    let camera = match cameras.get(&m.camera_key) {
                        Some(c) if !c.delete => c,
                        _ => continue,
                    };
                    let already_processed = camera
                        .state_last_processed_movement_key
                        .as_deref()
                        .map(|last| key.as_str() <= last)
                        .unwrap_or(false);
                    if already_processed {
                        warn!(movement = %key, "pending movement predates processed watermark");
                        continue;
                    }
                    self.dispatcher.enqueue_movement(key.clone());
                    requeued.push(key);
                }
                _ => {}
            }
        }
        if !requeued.is_empty() {
            info!(count = requeued.len(), "requeued pending movements");
        }
        Ok(requeued)
    }
}

fn stop_stream_task(nvr: &Arc<Nvr>, key: &str, handle: StreamHandle) {
    let nvr = nvr.clone();
    let key = key.to_owned();
    tokio::spawn(async move {
        nvr.streamer.stop(&key, &handle).await;
    });
}

fn tick_camera_stream(
    nvr: &Arc<Nvr>,
    key: &str,
    camera: &Camera,
    rt: &mut CameraRuntime,
    settings: Option<&Settings>,
) {
    let wanted = camera.enable_streaming && !camera.delete;
    if !wanted {
        if let Some(handle) = rt.stream.take() {
            stop_stream_task(nvr, key, handle);
        }
        return;
    }

    if let Some(handle) = &rt.stream {
        if !handle.process.is_alive() {
            debug!(camera = %camera.name, "transcoder gone; restarting");
            rt.stream = None;
        } else if nvr.streamer.is_stalled(camera, handle) {
            warn!(camera = %camera.name, "live playlist stalled; restarting transcoder");
            rt.breaker.record_failure(nvr.clocks.realtime_ms());
            if let Some(handle) = rt.stream.take() {
                stop_stream_task(nvr, key, handle);
            }
        }
    }

    if rt.stream.is_none() {
        match nvr.streamer.start(key, camera) {
            Ok(handle) => {
                let process = handle.process.clone();
                rt.stream = Some(handle);
                let verify_timeout = Duration::from_millis(
                    settings.map(|s| s.stream_verify_timeout_ms).unwrap_or(30_000),
                );
                let nvr = nvr.clone();
                let cell = nvr.camera_runtime(key);
                let playlist = playlist_path(camera);
                let name = camera.name.clone();
                tokio::spawn(async move {
                    let outcome = verify::wait_for_stream(
                        &process,
                        &playlist,
                        verify_timeout,
                        verify::DEFAULT_STALENESS,
                    )
                    .await;
                    if outcome != verify::VerifyOutcome::Ready {
                        warn!(camera = %name, ?outcome, "stream failed verification");
                        process.kill();
                        let mut rt = cell.lock().await;
                        rt.breaker.record_failure(nvr.clocks.realtime_ms());
                    }
                });
            }
            Err(e) => {
                error!(camera = %camera.name, err = %e.chain(), "unable to start stream");
                rt.breaker.record_failure(nvr.clocks.realtime_ms());
            }
        }
    }
}

/// Fires a poll task for the camera when one is due. The task owns the
/// camera cell until it finishes, which keeps tracker updates strictly
/// serial per camera.
fn maybe_poll(
    nvr: &Arc<Nvr>,
    key: &str,
    camera: &Camera,
    cell: CameraCell,
    mut rt: tokio::sync::OwnedMutexGuard<CameraRuntime>,
) {
    if !camera.enable_movement || camera.delete {
        return;
    }
    let now = nvr.clocks.realtime_ms();
    let up_long_enough = match &rt.stream {
        Some(h) => now - h.started_at_ms >= i64::from(camera.sec_movement_startup_delay) * 1_000,
        None => false,
    };
    if !up_long_enough
        || now - rt.last_poll_ms < camera.poll_frequency_ms as i64
        || !rt.breaker.can_poll(now)
    {
        return;
    }
    rt.breaker.in_progress = true;
    rt.last_poll_ms = now;
    drop(rt);

    let nvr = nvr.clone();
    let key = key.to_owned();
    let camera = camera.clone();
    tokio::spawn(async move {
        let outcome = nvr.poller.poll(&camera).await;
        let mut rt = cell.lock().await;
        rt.breaker.in_progress = false;
        match outcome {
            Ok(o) => {
                rt.breaker.record_success();
                let mut state = rt.tracker_state.clone();
                match nvr.tracker.observe(&key, &camera, &mut state, o) {
                    Ok(obs) => {
                        rt.tracker_state = state;
                        if let Observation::Completed(movement_key) = obs {
                            nvr.dispatcher.enqueue_movement(movement_key);
                        }
                    }
                    Err(e) => {
                        error!(camera = %camera.name, err = %e.chain(), "tracker update failed")
                    }
                }
            }
            Err(e) => {
                let now = nvr.clocks.realtime_ms();
                rt.breaker.record_failure(now);
                error!(camera = %camera.name, err = %e.chain(),
                       retry_after_ms = rt.breaker.retry_after_ms, "motion poll failed");
            }
        }
    });
}

fn maybe_run_janitor(nvr: &Arc<Nvr>, settings: &Settings, cameras: &[(String, Camera)]) {
    let target = match Target::from_pct(settings.disk_cleanup_capacity_pct) {
        Some(t) => t,
        None => return, // 0 disables
    };
    let now = nvr.clocks.realtime_ms();
    let last = nvr.last_disk_check_ms.load(Ordering::SeqCst);
    let interval_ms = i64::from(settings.disk_cleanup_interval_min) * 60_000;
    if now - last < interval_ms {
        return;
    }
    nvr.last_disk_check_ms.store(now, Ordering::SeqCst);
    let folders = nvr.watched_folders(settings, cameras);
    let base_dir = PathBuf::from(&settings.disk_base_dir);
    let nvr = nvr.clone();
    tokio::task::spawn_blocking(move || {
        let usage = move || janitor::statvfs_occupancy_pct(&base_dir);
        if let Err(e) =
            janitor::clear_down_disk(&nvr.store, nvr.clocks.as_ref(), &folders, target, &usage)
        {
            error!(err = %e.chain(), "disk cleanup failed");
        }
    });
}

/// Drives [`Nvr::tick`] until shutdown.
pub async fn run_loop(nvr: Arc<Nvr>, shutdown: base::shutdown::Receiver) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {}
        }
        if nvr.is_shutting_down() {
            break;
        }
        nvr.clone().tick().await;
    }
    debug!("control loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DispatcherConfig;
    use base::clock::SimulatedClocks;
    use db::movement::{movement_key, new_movement};
    use db::testutil::{TestDb, TEST_CAMERA_KEY};

    fn nvr_for(tdb: &TestDb) -> Arc<Nvr> {
        let clocks: Arc<dyn Clocks> = Arc::new(SimulatedClocks::new(1_700_000_000_000));
        let hub = Arc::new(Hub::new());
        let supervisor = Arc::new(Supervisor::new());
        let dispatcher = Dispatcher::spawn(DispatcherConfig {
            store: tdb.store.clone(),
            clocks: clocks.clone(),
            hub: hub.clone(),
            supervisor: supervisor.clone(),
            transcoder_bin: "/bin/false".to_owned(),
            detector_bin: "/bin/false".to_owned(),
        });
        Arc::new(Nvr::new(
            tdb.store.clone(),
            clocks.clone(),
            hub.clone(),
            supervisor.clone(),
            dispatcher,
            MotionPoller::new().unwrap(),
            Streamer::new(supervisor, clocks.clone(), "/bin/false".to_owned()),
            Tracker::new(tdb.store.clone(), clocks, hub),
            "/bin/false".to_owned(),
        ))
    }

    #[tokio::test]
    async fn watched_folders_include_frames_once() {
        let tdb = TestDb::new();
        let nvr = nvr_for(&tdb);
        let cameras = vec![(TEST_CAMERA_KEY.to_owned(), tdb.camera.clone())];
        let folders = nvr.watched_folders(&tdb.settings, &cameras);
        assert_eq!(folders.len(), 2);
        assert_eq!(folders[0].camera_key.as_deref(), Some(TEST_CAMERA_KEY));
        assert!(folders[1].path.ends_with("frames"));

        // Tombstoned or non-streaming cameras aren't watched.
        let mut dead = tdb.camera.clone();
        dead.delete = true;
        let folders =
            nvr.watched_folders(&tdb.settings, &[("C9".to_owned(), dead)]);
        assert_eq!(folders.len(), 1);
        assert!(folders[0].camera_key.is_none());
    }

    #[tokio::test]
    async fn requeue_marks_interrupted_and_returns_pending() {
        let tdb = TestDb::new();
        let nvr = nvr_for(&tdb);

        let pending_key = movement_key(1_700_000_001_000);
        tdb.store
            .put(
                Namespace::Movements,
                &pending_key,
                &new_movement(TEST_CAMERA_KEY, 1_700_000_001_000, Some(1)),
            )
            .unwrap();
        let mut stuck = new_movement(TEST_CAMERA_KEY, 1_700_000_002_000, Some(2));
        stuck.processing_state = ProcessingState::Processing;
        let stuck_key = movement_key(1_700_000_002_000);
        tdb.store
            .put(Namespace::Movements, &stuck_key, &stuck)
            .unwrap();
        // Already past the camera's watermark: not requeued.
        let mut old_camera: Camera = tdb
            .store
            .get(Namespace::Cameras, TEST_CAMERA_KEY)
            .unwrap()
            .unwrap();
        old_camera.state_last_processed_movement_key = Some(movement_key(1_700_000_000_500));
        tdb.store
            .put(Namespace::Cameras, TEST_CAMERA_KEY, &old_camera)
            .unwrap();
        let stale_key = movement_key(1_700_000_000_100);
        tdb.store
            .put(
                Namespace::Movements,
                &stale_key,
                &new_movement(TEST_CAMERA_KEY, 1_700_000_000_100, None),
            )
            .unwrap();

        let requeued = nvr.requeue_pending().unwrap();
        assert_eq!(requeued, vec![pending_key]);

        let stuck: Movement = tdb
            .store
            .get(Namespace::Movements, &stuck_key)
            .unwrap()
            .unwrap();
        assert_eq!(stuck.processing_state, ProcessingState::Failed);
        assert_eq!(
            stuck.processing_error.as_deref(),
            Some("interrupted by restart")
        );
    }

    #[tokio::test]
    async fn tick_skips_disabled_cameras() {
        let tdb = TestDb::new();
        let mut camera = tdb.camera.clone();
        camera.enable_streaming = false;
        camera.enable_movement = false;
        tdb.store
            .put(Namespace::Cameras, TEST_CAMERA_KEY, &camera)
            .unwrap();
        let nvr = nvr_for(&tdb);
        nvr.clone().tick().await;
        let rt = nvr.camera_runtime(TEST_CAMERA_KEY);
        let rt = rt.lock().await;
        assert!(rt.stream.is_none());
        assert_eq!(rt.last_poll_ms, 0);
    }

    #[tokio::test]
    async fn stop_camera_clears_runtime() {
        let tdb = TestDb::new();
        let nvr = nvr_for(&tdb);
        {
            let cell = nvr.camera_runtime(TEST_CAMERA_KEY);
            let mut rt = cell.lock().await;
            rt.breaker.record_failure(5_000);
            rt.tracker_state.current_movement_key = Some("x".to_owned());
        }
        nvr.stop_camera(TEST_CAMERA_KEY).await;
        let cell = nvr.camera_runtime(TEST_CAMERA_KEY);
        let rt = cell.lock().await;
        assert!(!rt.breaker.failed);
        assert!(rt.tracker_state.current_movement_key.is_none());
    }
}
