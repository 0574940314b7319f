// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The per-camera movement state machine: motion-poll outcomes in, durable
//! movement records and SSE events out.

use crate::events::{EventKind, Hub};
use crate::hls;
use crate::json::MovementToClient;
use crate::poller::PollOutcome;
use crate::streamer::playlist_path;
use base::clock::Clocks;
use base::Error;
use db::json::{Camera, Movement};
use db::movement::{movement_key, new_movement, segment_seconds};
use db::store::{Namespace, Store};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-camera tracker state, owned by the camera's runtime entry.
#[derive(Clone, Debug, Default)]
pub struct TrackerState {
    /// Key of the movement currently being tracked, if any.
    pub current_movement_key: Option<String>,
}

/// What a single poll observation did; the caller enqueues completed
/// movements for detection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Observation {
    Idle,
    Started(String),
    Updated(String),
    Completed(String),
}

pub struct Tracker {
    store: Arc<Store>,
    clocks: Arc<dyn Clocks>,
    hub: Arc<Hub>,
}

impl Tracker {
    pub fn new(store: Arc<Store>, clocks: Arc<dyn Clocks>, hub: Arc<Hub>) -> Self {
        Tracker { store, clocks, hub }
    }

    /// The live playlist's newest media-sequence number, when readable.
    fn live_edge(&self, camera: &Camera) -> Option<u64> {
        match hls::read_live_playlist(&playlist_path(camera)) {
            Ok(p) => Some(p.live_edge()),
            Err(e) => {
                debug!(camera = %camera.name, err = %e.chain(), "live playlist unreadable");
                None
            }
        }
    }

    /// Applies one poll outcome. Per-camera calls are strictly serial (the
    /// poll circuit breaker's `in_progress` guard guarantees it).
    pub fn observe(
        &self,
        camera_key: &str,
        camera: &Camera,
        state: &mut TrackerState,
        outcome: PollOutcome,
    ) -> Result<Observation, Error> {
        match &state.current_movement_key {
            None => match outcome {
                PollOutcome::NoMovement => Ok(Observation::Idle),
                PollOutcome::Movement => self.start_movement(camera_key, camera, state),
            },
            Some(key) => {
                let key = key.clone();
                self.continue_movement(&key, camera, state, outcome)
            }
        }
    }

    fn start_movement(
        &self,
        camera_key: &str,
        camera: &Camera,
        state: &mut TrackerState,
    ) -> Result<Observation, Error> {
        let now = self.clocks.realtime_ms();
        let key = movement_key(now);
        let m = new_movement(camera_key, now, self.live_edge(camera));
        // A failed write aborts the transition; the next poll retries.
        self.store.put(Namespace::Movements, &key, &m)?;
        state.current_movement_key = Some(key.clone());
        info!(camera = %camera.name, movement = %key, start_segment = ?m.start_segment,
              "movement started");
        self.hub.publish(
            EventKind::MovementNew,
            &MovementToClient::new(&key, &camera.name, &m),
        );
        Ok(Observation::Started(key))
    }

    fn continue_movement(
        &self,
        key: &str,
        camera: &Camera,
        state: &mut TrackerState,
        outcome: PollOutcome,
    ) -> Result<Observation, Error> {
        let mut m: Movement = match self.store.get(Namespace::Movements, key)? {
            Some(m) => m,
            None => {
                // Evicted underneath us (operator reset); drop tracking.
                warn!(camera = %camera.name, movement = %key, "tracked movement disappeared");
                state.current_movement_key = None;
                return Ok(Observation::Idle);
            }
        };

        let edge = self.live_edge(camera);
        m.poll_count += 1;
        match outcome {
            PollOutcome::Movement => m.consecutive_polls_without_movement = 0,
            PollOutcome::NoMovement => m.consecutive_polls_without_movement += 1,
        }
        if let (Some(start), Some(edge)) = (m.start_segment, edge) {
            m.seconds = segment_seconds(start, edge);
        }

        let lapsed = m.consecutive_polls_without_movement >= camera.polls_without_movement
            && outcome == PollOutcome::NoMovement;
        let over_long = m.seconds >= camera.sec_max_single_movement;
        let closing = lapsed || over_long;
        if closing {
            m.end_segment = edge.or(m.start_segment);
            m.detection_ended_at = Some(self.clocks.realtime_ms());
        }
        // The whole transition, close-out included, is one write.
        self.store.put(Namespace::Movements, key, &m)?;

        let to_client = MovementToClient::new(key, &camera.name, &m);
        self.hub.publish(EventKind::MovementUpdate, &to_client);
        if closing {
            info!(camera = %camera.name, movement = %key, seconds = m.seconds,
                  end_segment = ?m.end_segment, "movement complete");
            self.hub.publish(EventKind::MovementComplete, &to_client);
            state.current_movement_key = None;
            return Ok(Observation::Completed(key.to_owned()));
        }
        Ok(Observation::Updated(key.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use db::json::ProcessingState;
    use db::testutil::{TestDb, TEST_CAMERA_KEY};

    struct Rig {
        tdb: TestDb,
        clocks: SimulatedClocks,
        hub: Arc<Hub>,
        tracker: Tracker,
        state: TrackerState,
    }

    fn rig() -> Rig {
        let tdb = TestDb::new();
        let clocks = SimulatedClocks::new(1_700_000_000_000);
        let hub = Arc::new(Hub::new());
        let tracker = Tracker::new(
            tdb.store.clone(),
            Arc::new(clocks.clone()),
            hub.clone(),
        );
        Rig {
            tdb,
            clocks,
            hub,
            tracker,
            state: TrackerState::default(),
        }
    }

    fn write_playlist(rig: &Rig, media_sequence: u64, segments: u64) {
        let mut body = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"
        );
        for n in media_sequence..media_sequence + segments {
            body.push_str(&format!("#EXTINF:2.000000,\nstream{n}.ts\n"));
        }
        std::fs::write(playlist_path(&rig.tdb.camera), body).unwrap();
    }

    fn observe(rig: &mut Rig, outcome: PollOutcome) -> Observation {
        let camera = rig.tdb.camera.clone();
        let mut state = rig.state.clone();
        let obs = rig
            .tracker
            .observe(TEST_CAMERA_KEY, &camera, &mut state, outcome)
            .unwrap();
        rig.state = state;
        obs
    }

    fn event_types(rx: &mut tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            let ev = String::from_utf8(ev.to_vec()).unwrap();
            let v: serde_json::Value =
                serde_json::from_str(ev.trim_start_matches("data: ").trim()).unwrap();
            out.push(v["type"].as_str().unwrap().to_owned());
        }
        out
    }

    #[tokio::test]
    async fn no_movement_has_no_side_effects() {
        let mut r = rig();
        let mut sub = r.hub.subscribe();
        assert_eq!(observe(&mut r, PollOutcome::NoMovement), Observation::Idle);
        assert_eq!(r.tdb.store.count(Namespace::Movements).unwrap(), 0);
        assert_eq!(event_types(&mut sub.rx), ["connected"]);
    }

    #[tokio::test]
    async fn single_movement_lifecycle() {
        let mut r = rig();
        let mut sub = r.hub.subscribe();
        write_playlist(&r, 95, 6); // live edge 100

        let obs = observe(&mut r, PollOutcome::Movement);
        let key = match obs {
            Observation::Started(k) => k,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(key, movement_key(1_700_000_000_000));

        // Three quiet polls at 100 ms cadence; the third closes it out.
        for i in 1..=3u64 {
            r.clocks.advance_ms(100);
            write_playlist(&r, 95 + i, 6);
            let obs = observe(&mut r, PollOutcome::NoMovement);
            if i < 3 {
                assert_eq!(obs, Observation::Updated(key.clone()));
            } else {
                assert_eq!(obs, Observation::Completed(key.clone()));
            }
        }

        let m: Movement = r
            .tdb
            .store
            .get(Namespace::Movements, &key)
            .unwrap()
            .unwrap();
        assert_eq!(m.poll_count, 4);
        assert_eq!(m.consecutive_polls_without_movement, 3);
        assert_eq!(m.start_segment, Some(100));
        assert_eq!(m.end_segment, Some(103));
        assert_eq!(m.seconds, 6);
        assert_eq!(m.processing_state, ProcessingState::Pending);
        assert!(m.detection_ended_at.is_some());
        assert_eq!(r.state.current_movement_key, None);

        assert_eq!(
            event_types(&mut sub.rx),
            [
                "connected",
                "movement_new",
                "movement_update",
                "movement_update",
                "movement_update",
                "movement_complete",
            ]
        );
    }

    #[tokio::test]
    async fn movement_resets_quiet_streak() {
        let mut r = rig();
        write_playlist(&r, 100, 1);
        observe(&mut r, PollOutcome::Movement);
        observe(&mut r, PollOutcome::NoMovement);
        observe(&mut r, PollOutcome::NoMovement);
        // Motion returns: the streak starts over.
        observe(&mut r, PollOutcome::Movement);
        let key = r.state.current_movement_key.clone().unwrap();
        let m: Movement = r
            .tdb
            .store
            .get(Namespace::Movements, &key)
            .unwrap()
            .unwrap();
        assert_eq!(m.consecutive_polls_without_movement, 0);
        assert_eq!(m.poll_count, 4);
        assert!(r.state.current_movement_key.is_some());
    }

    #[tokio::test]
    async fn overlong_movement_is_cut_off() {
        let mut r = rig();
        r.tdb.camera.sec_max_single_movement = 60;
        write_playlist(&r, 100, 1); // edge 100
        observe(&mut r, PollOutcome::Movement);
        let key = r.state.current_movement_key.clone().unwrap();

        // The camera keeps reporting motion while the stream advances 31
        // segments: 62 s exceeds secMaxSingleMovement = 60.
        write_playlist(&r, 131, 1);
        let obs = observe(&mut r, PollOutcome::Movement);
        assert_eq!(obs, Observation::Completed(key.clone()));
        let m: Movement = r
            .tdb
            .store
            .get(Namespace::Movements, &key)
            .unwrap()
            .unwrap();
        assert_eq!(m.seconds, 62);
        assert_eq!(m.end_segment, Some(131));
    }

    #[tokio::test]
    async fn unreadable_playlist_still_tracks() {
        let mut r = rig();
        // No playlist on disk at all.
        std::fs::remove_file(playlist_path(&r.tdb.camera)).ok();
        observe(&mut r, PollOutcome::Movement);
        let key = r.state.current_movement_key.clone().unwrap();
        let m: Movement = r
            .tdb
            .store
            .get(Namespace::Movements, &key)
            .unwrap()
            .unwrap();
        assert_eq!(m.start_segment, None);
        assert_eq!(m.seconds, 0);
    }
}
