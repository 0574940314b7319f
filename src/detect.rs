// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The detection dispatcher: a single task owning the movement queue, the
//! long-lived detection worker child, and the in-flight frame bookkeeping.
//!
//! The worker speaks a line protocol: it prints `READY` once, then for each
//! newline-terminated image path on stdin it echoes `IMAGE:<path>` followed
//! by one JSON line of detections. Movements are processed strictly
//! one-at-a-time; a scheduled daily restart drains in-flight frames before
//! recycling the worker.

use crate::events::{EventKind, Hub};
use crate::extractor::{self, ExtractorEvent};
use crate::json::MovementToClient;
use crate::process::{OutputSink, ProcessHandle, SpawnOptions, Supervisor};
use base::clock::Clocks;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use db::json::{Camera, DetectionStatus, Movement, ProcessingState, Settings};
use db::store::{Namespace, Store};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt as _;
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Grace given to the worker on recycle/shutdown before a force-kill.
const WORKER_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct DetectionResponse {
    image: String,
    #[serde(default)]
    detections: Vec<Detection>,
}

#[derive(Debug, Deserialize)]
struct Detection {
    object: String,
    probability: f64,
}

/// One parsed line of worker stdout.
#[derive(Debug)]
enum Line {
    Ready,
    Echo(String),
    Response(DetectionResponse),
    Other(String),
}

fn parse_worker_line(line: &str) -> Line {
    if line == "READY" {
        return Line::Ready;
    }
    if let Some(path) = line.strip_prefix("IMAGE:") {
        return Line::Echo(path.to_owned());
    }
    if line.starts_with('{') {
        if let Ok(resp) = serde_json::from_str::<DetectionResponse>(line) {
            return Line::Response(resp);
        }
    }
    Line::Other(line.to_owned())
}

/// Whether the scheduled daily restart should now become pending.
fn restart_due(
    schedule: &str,
    now_local: NaiveDateTime,
    last_restart_date: Option<NaiveDate>,
    restart_pending: bool,
) -> bool {
    if restart_pending || schedule.is_empty() {
        return false;
    }
    let at = match NaiveTime::parse_from_str(schedule, "%H:%M") {
        Ok(t) => t,
        Err(_) => return false,
    };
    now_local.time() >= at && last_restart_date != Some(now_local.date())
}

enum Msg {
    Enqueue(String),
    Extractor(ExtractorEvent),
    WorkerLine { generation: u64, line: String },
    WorkerExited { generation: u64 },
    Tick,
    Shutdown(oneshot::Sender<()>),
}

pub struct DispatcherConfig {
    pub store: Arc<Store>,
    pub clocks: Arc<dyn Clocks>,
    pub hub: Arc<Hub>,
    pub supervisor: Arc<Supervisor>,
    pub transcoder_bin: String,
    pub detector_bin: String,
}

/// Cloneable handle to the dispatcher task.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Msg>,
}

impl Dispatcher {
    pub fn spawn(cfg: DispatcherConfig) -> Dispatcher {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut inner = Inner::new(cfg, tx.clone());
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let quit = matches!(&msg, Msg::Shutdown(_));
                inner.handle(msg).await;
                if quit {
                    break;
                }
            }
        });
        Dispatcher { tx }
    }

    pub fn enqueue_movement(&self, key: String) {
        let _ = self.tx.send(Msg::Enqueue(key));
    }

    /// Periodic work: start or recycle the worker, dispatch the queue.
    pub fn tick(&self) {
        let _ = self.tx.send(Msg::Tick);
    }

    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Msg::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

struct Worker {
    generation: u64,
    handle: ProcessHandle,
    stdin: ChildStdin,
    ready: bool,
    started_at_ms: i64,
}

struct Current {
    key: String,
    camera_name: String,
    extractor_done: bool,
}

struct SentFrame {
    movement_key: String,
    sent_at_ms: i64,
}

struct Inner {
    cfg: DispatcherConfig,
    tx: mpsc::UnboundedSender<Msg>,
    queue: VecDeque<String>,
    current: Option<Current>,
    worker: Option<Worker>,
    next_generation: u64,
    restart_pending: bool,
    last_restart_date: Option<NaiveDate>,
    /// Frames held back while the worker is absent or a restart drains.
    paused: Vec<PathBuf>,
    /// Frames written to the worker and not yet answered.
    in_flight: HashMap<String, SentFrame>,
}

impl Inner {
    fn new(cfg: DispatcherConfig, tx: mpsc::UnboundedSender<Msg>) -> Self {
        Inner {
            cfg,
            tx,
            queue: VecDeque::new(),
            current: None,
            worker: None,
            next_generation: 0,
            restart_pending: false,
            last_restart_date: None,
            paused: Vec::new(),
            in_flight: HashMap::new(),
        }
    }

    async fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Enqueue(key) => self.handle_enqueue(key).await,
            Msg::Extractor(ev) => self.handle_extractor(ev).await,
            Msg::WorkerLine { generation, line } => {
                self.handle_worker_line(generation, &line).await
            }
            Msg::WorkerExited { generation } => self.handle_worker_exited(generation).await,
            Msg::Tick => self.handle_tick().await,
            Msg::Shutdown(ack) => {
                if let Some(w) = self.worker.take() {
                    w.handle.stop(WORKER_STOP_GRACE).await;
                }
                let _ = ack.send(());
            }
        }
    }

    fn settings(&self) -> Option<Settings> {
        match self.cfg.store.get::<Settings>(Namespace::Settings, "config") {
            Ok(s) => s,
            Err(e) => {
                error!(err = %e.chain(), "unable to read settings");
                None
            }
        }
    }

    fn load_movement(&self, key: &str) -> Option<Movement> {
        match self.cfg.store.get::<Movement>(Namespace::Movements, key) {
            Ok(m) => m,
            Err(e) => {
                error!(movement = %key, err = %e.chain(), "unable to read movement");
                None
            }
        }
    }

    fn put_movement(&self, key: &str, m: &Movement) {
        if let Err(e) = self.cfg.store.put(Namespace::Movements, key, m) {
            error!(movement = %key, err = %e.chain(), "unable to write movement");
        }
    }

    fn publish_update(&self, key: &str, m: &Movement) {
        let camera_name = match &self.current {
            Some(c) if c.key == key => c.camera_name.clone(),
            _ => self
                .cfg
                .store
                .get::<Camera>(Namespace::Cameras, &m.camera_key)
                .ok()
                .flatten()
                .map(|c| c.name)
                .unwrap_or_default(),
        };
        self.cfg.hub.publish(
            EventKind::MovementUpdate,
            &MovementToClient::new(key, &camera_name, m),
        );
    }

    async fn handle_enqueue(&mut self, key: String) {
        let already = self.queue.contains(&key)
            || self.current.as_ref().map(|c| c.key.as_str()) == Some(key.as_str());
        if already {
            debug!(movement = %key, "already queued");
            return;
        }
        self.queue.push_back(key);
        self.try_dispatch().await;
    }

    /// Starts processing the head of the queue when idle and the worker is
    /// up.
    async fn try_dispatch(&mut self) {
        loop {
            if self.current.is_some() || self.restart_pending {
                return;
            }
            match &self.worker {
                Some(w) if w.ready => {}
                _ => return,
            }
            let key = match self.queue.pop_front() {
                Some(k) => k,
                None => return,
            };
            let mut movement = match self.load_movement(&key) {
                Some(m) => m,
                None => {
                    warn!(movement = %key, "queued movement vanished");
                    continue;
                }
            };
            let camera = match self
                .cfg
                .store
                .get::<Camera>(Namespace::Cameras, &movement.camera_key)
                .ok()
                .flatten()
            {
                Some(c) => c,
                None => {
                    Box::pin(self.fail_movement(&key, "camera no longer exists")).await;
                    continue;
                }
            };
            let settings = match self.settings() {
                Some(s) => s,
                None => {
                    // Put it back; nothing can be extracted without a
                    // frames path.
                    self.queue.push_front(key);
                    return;
                }
            };

            let now = self.cfg.clocks.realtime_ms();
            movement.processing_state = ProcessingState::Processing;
            movement.processing_started_at = Some(now);
            movement.detection_status = DetectionStatus::Starting;
            movement.processing_attempts += 1;
            self.put_movement(&key, &movement);
            self.current = Some(Current {
                key: key.clone(),
                camera_name: camera.name.clone(),
                extractor_done: false,
            });
            self.publish_update(&key, &movement);
            info!(movement = %key, camera = %camera.name, "processing movement");

            let frames_dir = PathBuf::from(&settings.disk_base_dir)
                .join(&settings.detection_frames_path);
            let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
            let msg_tx = self.tx.clone();
            tokio::spawn(async move {
                while let Some(ev) = ev_rx.recv().await {
                    if msg_tx.send(Msg::Extractor(ev)).is_err() {
                        break;
                    }
                }
            });
            let supervisor = self.cfg.supervisor.clone();
            let transcoder_bin = self.cfg.transcoder_bin.clone();
            tokio::spawn(async move {
                extractor::run(
                    &supervisor,
                    &transcoder_bin,
                    key,
                    &camera,
                    &movement,
                    frames_dir,
                    ev_tx,
                )
                .await;
            });
            return;
        }
    }

    async fn handle_extractor(&mut self, ev: ExtractorEvent) {
        match ev {
            ExtractorEvent::Frame { movement_key, path } => {
                if self.current.as_ref().map(|c| c.key.as_str()) != Some(movement_key.as_str()) {
                    debug!(movement = %movement_key, "frame for stale movement");
                    return;
                }
                if let Some(mut m) = self.load_movement(&movement_key) {
                    if m.detection_status == DetectionStatus::Starting {
                        m.detection_status = DetectionStatus::Extracting;
                        self.put_movement(&movement_key, &m);
                        self.publish_update(&movement_key, &m);
                    }
                }
                self.send_frames(vec![path]).await;
            }
            ExtractorEvent::Done {
                movement_key,
                frames_found,
                error,
            } => {
                if self.current.as_ref().map(|c| c.key.as_str()) != Some(movement_key.as_str()) {
                    debug!(movement = %movement_key, "extractor done for stale movement");
                    return;
                }
                debug!(movement = %movement_key, frames_found, "extractor finished");
                let mut failed_early = false;
                if let Some(mut m) = self.load_movement(&movement_key) {
                    if let Some(err) = &error {
                        m.processing_error = Some(err.clone());
                        self.put_movement(&movement_key, &m);
                        if m.frames_received_from_ml == 0 && !self.movement_has_frames_out(&movement_key)
                        {
                            failed_early = true;
                        }
                    } else {
                        self.put_movement(&movement_key, &m);
                    }
                }
                if failed_early {
                    self.fail_movement(&movement_key, "frame extraction failed")
                        .await;
                    return;
                }
                if let Some(cur) = &mut self.current {
                    cur.extractor_done = true;
                }
                self.maybe_complete().await;
            }
        }
    }

    /// Any frame of this movement still in flight or buffered?
    fn movement_has_frames_out(&self, key: &str) -> bool {
        !self.paused.is_empty() || self.in_flight.values().any(|f| f.movement_key == key)
    }

    /// Writes frames to the worker, or buffers them while paused. Updates
    /// the owning movement's sent counter.
    async fn send_frames(&mut self, paths: Vec<PathBuf>) {
        let cur_key = match &self.current {
            Some(c) => c.key.clone(),
            None => return,
        };
        let mut sent = 0u32;
        for path in paths {
            let blocked = self.restart_pending
                || !matches!(&self.worker, Some(w) if w.ready);
            if blocked {
                self.paused.push(path);
                continue;
            }
            let path_str = path.to_string_lossy().into_owned();
            let line = format!("{path_str}\n");
            let write_failed = {
                let w = self.worker.as_mut().expect("checked above");
                w.stdin.write_all(line.as_bytes()).await.is_err()
            };
            if write_failed {
                warn!(movement = %cur_key, "worker stdin closed; buffering frame");
                self.paused.push(path);
                continue;
            }
            self.in_flight.insert(
                path_str,
                SentFrame {
                    movement_key: cur_key.clone(),
                    sent_at_ms: self.cfg.clocks.realtime_ms(),
                },
            );
            sent += 1;
        }
        if sent > 0 {
            if let Some(mut m) = self.load_movement(&cur_key) {
                m.frames_sent_to_ml += sent;
                if m.detection_status != DetectionStatus::Analyzing {
                    m.detection_status = DetectionStatus::Analyzing;
                }
                self.put_movement(&cur_key, &m);
            }
        }
    }

    async fn handle_worker_line(&mut self, generation: u64, line: &str) {
        match &self.worker {
            Some(w) if w.generation == generation => {}
            _ => return,
        }
        match parse_worker_line(line) {
            Line::Ready => {
                info!("detection worker ready");
                if let Some(w) = &mut self.worker {
                    w.ready = true;
                }
                let paused = std::mem::take(&mut self.paused);
                if !paused.is_empty() {
                    self.send_frames(paused).await;
                }
                self.try_dispatch().await;
            }
            Line::Echo(path) => debug!(frame = %path, "worker accepted frame"),
            Line::Response(resp) => self.handle_response(resp).await,
            Line::Other(l) => debug!(line = %l, "worker chatter"),
        }
    }

    async fn handle_response(&mut self, resp: DetectionResponse) {
        let sent = match self.in_flight.remove(&resp.image) {
            Some(s) => s,
            None => {
                warn!(image = %resp.image, "response for unknown frame");
                return;
            }
        };
        let elapsed = (self.cfg.clocks.realtime_ms() - sent.sent_at_ms).max(0);
        let image_name = std::path::Path::new(&resp.image)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| resp.image.clone());
        if let Some(mut m) = self.load_movement(&sent.movement_key) {
            let dets: Vec<(String, f64)> = resp
                .detections
                .iter()
                .map(|d| (d.object.clone(), d.probability))
                .collect();
            db::movement::apply_frame(&mut m, &image_name, &dets, elapsed);
            self.put_movement(&sent.movement_key, &m);
            self.publish_update(&sent.movement_key, &m);
        }
        self.maybe_complete().await;
        if self.restart_pending && self.in_flight.is_empty() {
            self.do_restart().await;
        }
    }

    /// Completes the current movement once its extractor has closed and no
    /// frames remain outstanding.
    async fn maybe_complete(&mut self) {
        let key = match &self.current {
            Some(c) if c.extractor_done => c.key.clone(),
            _ => return,
        };
        if self.movement_has_frames_out(&key) {
            return;
        }
        if let Some(mut m) = self.load_movement(&key) {
            let now = self.cfg.clocks.realtime_ms();
            m.detection_status = DetectionStatus::Complete;
            m.processing_state = ProcessingState::Completed;
            m.processing_completed_at = Some(now);
            self.put_movement(&key, &m);
            self.publish_update(&key, &m);
            self.advance_camera_state(&m.camera_key, &key);
            info!(movement = %key, tags = m.detection_output.tags.len(), "movement processed");
        }
        self.current = None;
        self.try_dispatch().await;
    }

    async fn fail_movement(&mut self, key: &str, reason: &str) {
        if let Some(mut m) = self.load_movement(key) {
            m.processing_state = ProcessingState::Failed;
            if m.processing_error.is_none() {
                m.processing_error = Some(reason.to_owned());
            }
            self.put_movement(key, &m);
            self.publish_update(key, &m);
            self.advance_camera_state(&m.camera_key, key);
        }
        warn!(movement = %key, reason, "movement failed");
        self.in_flight.retain(|_, f| f.movement_key != key);
        self.paused.clear();
        if self.current.as_ref().map(|c| c.key.as_str()) == Some(key) {
            self.current = None;
        }
        self.try_dispatch().await;
    }

    /// Records the newest finished movement on the camera so a restart can
    /// resume the queue after it.
    fn advance_camera_state(&self, camera_key: &str, movement_key: &str) {
        let camera = self
            .cfg
            .store
            .get::<Camera>(Namespace::Cameras, camera_key)
            .ok()
            .flatten();
        if let Some(mut c) = camera {
            let newer = c
                .state_last_processed_movement_key
                .as_deref()
                .map(|prev| movement_key > prev)
                .unwrap_or(true);
            if newer {
                c.state_last_processed_movement_key = Some(movement_key.to_owned());
                if let Err(e) = self.cfg.store.put(Namespace::Cameras, camera_key, &c) {
                    error!(camera = %camera_key, err = %e.chain(), "unable to update camera state");
                }
            }
        }
    }

    async fn handle_worker_exited(&mut self, generation: u64) {
        let uptime_ms = match &self.worker {
            Some(w) if w.generation == generation => {
                self.cfg.clocks.realtime_ms() - w.started_at_ms
            }
            _ => return,
        };
        warn!(uptime_ms, "detection worker exited unexpectedly");
        self.worker = None;
        self.in_flight.clear();
        if let Some(cur) = self.current.take() {
            self.fail_movement(&cur.key, "detection worker exited unexpectedly")
                .await;
        }
        // Respawn happens on the next tick, which acts as implicit backoff.
    }

    async fn handle_tick(&mut self) {
        let settings = match self.settings() {
            Some(s) => s,
            None => return,
        };
        if settings.detection_enable && self.worker.is_none() {
            if let Err(e) = self.spawn_worker(&settings) {
                error!(err = %e.chain(), "unable to start detection worker");
            }
        } else if !settings.detection_enable {
            if let Some(w) = self.worker.take() {
                info!("detection disabled; stopping worker");
                w.handle.stop(WORKER_STOP_GRACE).await;
                self.in_flight.clear();
            }
        }

        let now_local = chrono::Local::now().naive_local();
        if restart_due(
            &settings.ml_restart_schedule,
            now_local,
            self.last_restart_date,
            self.restart_pending,
        ) {
            info!(schedule = %settings.ml_restart_schedule, "detection worker restart pending");
            self.restart_pending = true;
        }
        if self.restart_pending && self.in_flight.is_empty() {
            self.do_restart().await;
        }
        self.try_dispatch().await;
    }

    async fn do_restart(&mut self) {
        info!("recycling detection worker");
        if let Some(w) = self.worker.take() {
            w.handle.stop(WORKER_STOP_GRACE).await;
        }
        self.last_restart_date = Some(chrono::Local::now().date_naive());
        self.restart_pending = false;
        if let Some(settings) = self.settings() {
            if settings.detection_enable {
                if let Err(e) = self.spawn_worker(&settings) {
                    error!(err = %e.chain(), "unable to restart detection worker");
                }
            }
        }
    }

    fn spawn_worker(&mut self, settings: &Settings) -> Result<(), base::Error> {
        let generation = self.next_generation;
        self.next_generation += 1;
        let mut args = vec!["--model".to_owned(), settings.detection_model.clone()];
        if let Some(hw) = &settings.detection_target_hw {
            args.push("--target".to_owned());
            args.push(hw.clone());
        }
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let mut opts = SpawnOptions::new("detect-worker", self.cfg.detector_bin.clone(), args);
        opts.stdout = OutputSink::Lines(line_tx);
        opts.pipe_stdin = true;
        let (handle, stdin) = self.cfg.supervisor.spawn(opts)?;
        let stdin = stdin.expect("pipe_stdin was requested");

        let msg_tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                if msg_tx.send(Msg::WorkerLine { generation, line }).is_err() {
                    break;
                }
            }
        });
        let msg_tx = self.tx.clone();
        let exit_handle = handle.clone();
        tokio::spawn(async move {
            exit_handle.wait_exited().await;
            let _ = msg_tx.send(Msg::WorkerExited { generation });
        });

        self.worker = Some(Worker {
            generation,
            handle,
            stdin,
            ready: false,
            started_at_ms: self.cfg.clocks.realtime_ms(),
        });
        info!(generation, "detection worker starting");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use db::json::TagFilter;
    use db::movement::{movement_key, new_movement};
    use db::testutil::{TestDb, TEST_CAMERA_KEY};
    use std::os::unix::fs::PermissionsExt as _;

    const WORKER_SCRIPT: &str = "#!/bin/sh\n\
        echo READY\n\
        while read p; do\n\
          echo \"IMAGE:$p\"\n\
          printf '{\"image\":\"%s\",\"detections\":[{\"object\":\"person\",\"probability\":0.93},{\"object\":\"car\",\"probability\":0.42}]}\\n' \"$p\"\n\
        done\n";

    #[test]
    fn parses_worker_lines() {
        assert!(matches!(parse_worker_line("READY"), Line::Ready));
        match parse_worker_line("IMAGE:/f/mov1_0001.jpg") {
            Line::Echo(p) => assert_eq!(p, "/f/mov1_0001.jpg"),
            other => panic!("unexpected {other:?}"),
        }
        match parse_worker_line(
            r#"{"image":"/f/a.jpg","detections":[{"object":"person","probability":0.5}]}"#,
        ) {
            Line::Response(r) => {
                assert_eq!(r.image, "/f/a.jpg");
                assert_eq!(r.detections.len(), 1);
                assert_eq!(r.detections[0].object, "person");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(parse_worker_line("warming up"), Line::Other(_)));
        assert!(matches!(parse_worker_line("{not json"), Line::Other(_)));
    }

    #[test]
    fn restart_due_logic() {
        let t = |s: &str| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
        };
        let today = t("2024-03-01 01:00").date();
        // Before the scheduled minute: not due.
        assert!(!restart_due("01:00", t("2024-03-01 00:59"), None, false));
        // At/after it: due.
        assert!(restart_due("01:00", t("2024-03-01 01:00"), None, false));
        assert!(restart_due("01:00", t("2024-03-01 23:59"), None, false));
        // Already restarted today: not due again.
        assert!(!restart_due("01:00", t("2024-03-01 02:00"), Some(today), false));
        // Restarted yesterday: due again today.
        assert!(restart_due(
            "01:00",
            t("2024-03-02 01:00"),
            Some(today),
            false
        ));
        // Pending or disabled: never due.
        assert!(!restart_due("01:00", t("2024-03-01 02:00"), None, true));
        assert!(!restart_due("", t("2024-03-01 02:00"), None, false));
        assert!(!restart_due("nonsense", t("2024-03-01 02:00"), None, false));
    }

    struct Rig {
        tdb: TestDb,
        inner: Inner,
        rx: mpsc::UnboundedReceiver<Msg>,
        hub: Arc<Hub>,
    }

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// A dispatcher wired to a stub worker and the given stand-in for the
    /// transcoder, with the test pumping the message loop by hand.
    fn rig(transcoder_script: &str) -> Rig {
        let tdb = TestDb::new();
        let mut settings = tdb.settings.clone();
        settings.detection_enable = true;
        settings.detection_tag_filters = vec![TagFilter {
            tag: "person".to_owned(),
            min_probability: 0.5,
        }];
        tdb.store
            .put(Namespace::Settings, "config", &settings)
            .unwrap();

        let detector_bin = write_script(tdb.tmpdir.path(), "worker.sh", WORKER_SCRIPT);
        let transcoder_bin = write_script(tdb.tmpdir.path(), "transcoder.sh", transcoder_script);
        let hub = Arc::new(Hub::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let cfg = DispatcherConfig {
            store: tdb.store.clone(),
            clocks: Arc::new(SimulatedClocks::new(1_700_000_000_000)),
            hub: hub.clone(),
            supervisor: Arc::new(Supervisor::new()),
            transcoder_bin,
            detector_bin,
        };
        let inner = Inner::new(cfg, tx);
        Rig {
            tdb,
            inner,
            rx,
            hub,
        }
    }

    /// Seeds a pending movement with segments on disk, returning its key.
    fn seed_movement(tdb: &TestDb) -> String {
        let cam_dir = tdb.tmpdir.path().join("testcam");
        for n in 98u64..=103 {
            std::fs::write(cam_dir.join(format!("stream{n}.ts")), b"ts").unwrap();
        }
        let mut m = new_movement(TEST_CAMERA_KEY, 1_700_000_000_000, Some(100));
        m.seconds = 4;
        m.end_segment = Some(102);
        let key = movement_key(1_700_000_000_000);
        tdb.store.put(Namespace::Movements, &key, &m).unwrap();
        key
    }

    async fn pump_until<F>(inner: &mut Inner, rx: &mut mpsc::UnboundedReceiver<Msg>, pred: F)
    where
        F: Fn(&Msg) -> bool,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("no message within deadline")
                .expect("dispatcher channel closed");
            let hit = pred(&msg);
            inner.handle(msg).await;
            if hit {
                return;
            }
        }
    }

    fn is_ready(msg: &Msg) -> bool {
        matches!(msg, Msg::WorkerLine { line, .. } if line == "READY")
    }

    fn is_response(msg: &Msg) -> bool {
        matches!(msg, Msg::WorkerLine { line, .. } if line.starts_with('{'))
    }

    fn is_extractor_done(msg: &Msg) -> bool {
        matches!(msg, Msg::Extractor(ExtractorEvent::Done { .. }))
    }

    /// Pumps messages until the movement leaves the processing state.
    async fn pump_until_settled(r: &mut Rig, key: &str) -> Movement {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let m: Movement = r
                .tdb
                .store
                .get(Namespace::Movements, key)
                .unwrap()
                .unwrap();
            if !m.processing_state.is_in_flight() {
                return m;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "movement never settled"
            );
            if let Ok(Some(msg)) =
                tokio::time::timeout(Duration::from_millis(250), r.rx.recv()).await
            {
                r.inner.handle(msg).await;
            }
        }
    }

    async fn shut_down(mut rig: Rig) {
        let (ack_tx, ack_rx) = oneshot::channel();
        rig.inner.handle(Msg::Shutdown(ack_tx)).await;
        ack_rx.await.unwrap();
    }

    #[tokio::test]
    async fn processes_movement_and_aggregates_detections() {
        let mut r = rig("#!/bin/sh\nsleep 1\n");
        let key = seed_movement(&r.tdb);
        let mut events = r.hub.subscribe();

        r.inner.handle(Msg::Tick).await;
        pump_until(&mut r.inner, &mut r.rx, is_ready).await;
        r.inner.handle(Msg::Enqueue(key.clone())).await;

        let m: Movement = r
            .tdb
            .store
            .get(Namespace::Movements, &key)
            .unwrap()
            .unwrap();
        assert_eq!(m.processing_state, ProcessingState::Processing);
        assert_eq!(m.processing_attempts, 1);

        // Feed one frame through the stub worker.
        let frame = r.tdb.tmpdir.path().join(format!("frames/mov{key}_0001.jpg"));
        r.inner
            .handle(Msg::Extractor(ExtractorEvent::Frame {
                movement_key: key.clone(),
                path: frame.clone(),
            }))
            .await;
        pump_until(&mut r.inner, &mut r.rx, is_response).await;

        let m: Movement = r
            .tdb
            .store
            .get(Namespace::Movements, &key)
            .unwrap()
            .unwrap();
        assert_eq!(m.frames_sent_to_ml, 1);
        assert_eq!(m.frames_received_from_ml, 1);
        let person = m
            .detection_output
            .tags
            .iter()
            .find(|t| t.tag == "person")
            .unwrap();
        assert_eq!(person.max_probability, 0.93);
        assert_eq!(person.count, 1);
        assert_eq!(person.max_probability_image, format!("mov{key}_0001.jpg"));
        let car = m
            .detection_output
            .tags
            .iter()
            .find(|t| t.tag == "car")
            .unwrap();
        assert_eq!(car.max_probability, 0.42);

        // The stand-in transcoder exits after a second; the movement then
        // completes.
        let m = pump_until_settled(&mut r, &key).await;
        assert_eq!(m.processing_state, ProcessingState::Completed);
        assert_eq!(m.detection_status, DetectionStatus::Complete);
        assert!(m.processing_completed_at.is_some());

        let camera: Camera = r
            .tdb
            .store
            .get(Namespace::Cameras, TEST_CAMERA_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(camera.state_last_processed_movement_key, Some(key.clone()));

        // SSE: hello plus a stream of movement_update, none before our
        // subscription, all for this key.
        let hello = events.rx.try_recv().unwrap();
        assert!(std::str::from_utf8(&hello).unwrap().contains("connected"));
        let mut saw_completed = false;
        while let Ok(ev) = events.rx.try_recv() {
            let ev = String::from_utf8(ev.to_vec()).unwrap();
            assert!(ev.contains("movement_update"), "{ev}");
            assert!(ev.contains(&key), "{ev}");
            if ev.contains(r#""processingState":"completed""#) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);

        shut_down(r).await;
    }

    #[tokio::test]
    async fn extractor_failure_fails_movement() {
        let mut r = rig("#!/bin/sh\necho 'no such segment' >&2\nexit 1\n");
        let key = seed_movement(&r.tdb);

        r.inner.handle(Msg::Tick).await;
        pump_until(&mut r.inner, &mut r.rx, is_ready).await;
        r.inner.handle(Msg::Enqueue(key.clone())).await;
        pump_until(&mut r.inner, &mut r.rx, is_extractor_done).await;

        let m: Movement = r
            .tdb
            .store
            .get(Namespace::Movements, &key)
            .unwrap()
            .unwrap();
        assert_eq!(m.processing_state, ProcessingState::Failed);
        assert!(m.processing_error.unwrap().contains("no such segment"));
        // Failed movements are recorded as processed so a restart doesn't
        // re-dispatch them.
        let camera: Camera = r
            .tdb
            .store
            .get(Namespace::Cameras, TEST_CAMERA_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(camera.state_last_processed_movement_key, Some(key));

        shut_down(r).await;
    }

    #[tokio::test]
    async fn pending_restart_drains_then_recycles() {
        let mut r = rig("#!/bin/sh\nsleep 5\n");
        let key = seed_movement(&r.tdb);

        r.inner.handle(Msg::Tick).await;
        pump_until(&mut r.inner, &mut r.rx, is_ready).await;
        assert_eq!(r.inner.worker.as_ref().unwrap().generation, 0);
        r.inner.handle(Msg::Enqueue(key.clone())).await;

        // One frame in flight...
        let frame1 = r.tdb.tmpdir.path().join(format!("frames/mov{key}_0001.jpg"));
        r.inner
            .handle(Msg::Extractor(ExtractorEvent::Frame {
                movement_key: key.clone(),
                path: frame1,
            }))
            .await;
        assert_eq!(r.inner.in_flight.len(), 1);

        // ...when the scheduled restart becomes pending: further frames are
        // held back, nothing new reaches the worker.
        r.inner.restart_pending = true;
        let frame2 = r.tdb.tmpdir.path().join(format!("frames/mov{key}_0002.jpg"));
        r.inner
            .handle(Msg::Extractor(ExtractorEvent::Frame {
                movement_key: key.clone(),
                path: frame2,
            }))
            .await;
        assert_eq!(r.inner.in_flight.len(), 1);
        assert_eq!(r.inner.paused.len(), 1);

        // The response to the in-flight frame drains the count to zero,
        // which triggers the recycle.
        pump_until(&mut r.inner, &mut r.rx, is_response).await;
        assert!(!r.inner.restart_pending);
        assert_eq!(
            r.inner.last_restart_date,
            Some(chrono::Local::now().date_naive())
        );
        let w = r.inner.worker.as_ref().unwrap();
        assert_eq!(w.generation, 1);

        // Once the new worker says READY, the held-back frame flows.
        pump_until(&mut r.inner, &mut r.rx, is_ready).await;
        assert!(r.inner.paused.is_empty());
        assert_eq!(r.inner.in_flight.len(), 1);

        shut_down(r).await;
    }
}
