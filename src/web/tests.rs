// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use super::*;
use crate::control::Nvr;
use crate::detect::{Dispatcher, DispatcherConfig};
use crate::events::{EventKind, Hub};
use crate::poller::MotionPoller;
use crate::process::Supervisor;
use crate::streamer::Streamer;
use crate::tracker::Tracker;
use base::clock::{Clocks, SimulatedClocks};
use db::movement::{movement_key, new_movement};
use db::testutil::{TestDb, TEST_CAMERA_KEY};
use hyper::service::{make_service_fn, service_fn};

struct Server {
    tdb: TestDb,
    nvr: Arc<Nvr>,
    base_url: String,
}

fn start_server() -> Server {
    let tdb = TestDb::new();
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
    let nvr = Arc::new(Nvr::new(
        tdb.store.clone(),
        clocks.clone(),
        hub.clone(),
        supervisor.clone(),
        dispatcher,
        MotionPoller::new().unwrap(),
        Streamer::new(supervisor.clone(), clocks.clone(), "/bin/false".to_owned()),
        Tracker::new(tdb.store.clone(), clocks, hub),
        "/bin/false".to_owned(),
    ));

    let svc = Arc::new(Service::new(nvr.clone()));
    let make_svc = make_service_fn(move |_conn| {
        let svc = Arc::clone(&svc);
        futures::future::ok::<_, std::convert::Infallible>(service_fn({
            move |req| Arc::clone(&svc).serve(req)
        }))
    });
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], 0));
    let server = hyper::Server::bind(&addr).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);

    Server {
        tdb,
        nvr,
        base_url: format!("http://{addr}"),
    }
}

fn seed_movements(s: &Server, times_ms: &[i64]) {
    for &ms in times_ms {
        s.tdb
            .store
            .put(
                Namespace::Movements,
                &movement_key(ms),
                &new_movement(TEST_CAMERA_KEY, ms, Some(100)),
            )
            .unwrap();
    }
}

#[tokio::test]
async fn settings_roundtrip() {
    db::testutil::init();
    let s = start_server();
    let cli = reqwest::Client::new();

    let mut settings = s.tdb.settings.clone();
    settings.disk_cleanup_capacity_pct = 85;
    let resp = cli
        .post(format!("{}/api/settings", s.base_url))
        .json(&settings)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);

    let listing: serde_json::Value = cli
        .get(format!("{}/api/movements", s.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["config"]["settings"]["diskCleanupCapacityPct"], 85);
    assert_eq!(
        listing["config"]["settings"]["diskBaseDir"],
        settings.disk_base_dir.as_str()
    );

    // A base dir that doesn't exist is rejected.
    settings.disk_base_dir = "/definitely/not/a/real/dir".to_owned();
    let resp = cli
        .post(format!("{}/api/settings", s.base_url))
        .json(&settings)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn movements_list_newest_first_with_cursor() {
    db::testutil::init();
    let s = start_server();
    seed_movements(&s, &[1_000, 2_000, 3_000, 4_000, 5_000]);
    let cli = reqwest::Client::new();

    let page1: serde_json::Value = cli
        .get(format!("{}/api/movements?limit=2", s.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let keys: Vec<&str> = page1["movements"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["key"].as_str().unwrap())
        .collect();
    assert_eq!(keys, [movement_key(5_000), movement_key(4_000)]);
    assert_eq!(page1["hasMore"], true);
    assert_eq!(page1["movements"][0]["cameraName"], "test camera");
    let cursor = page1["nextCursor"].as_str().unwrap();

    let page2: serde_json::Value = cli
        .get(format!(
            "{}/api/movements?limit=2&cursor={cursor}",
            s.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let keys: Vec<&str> = page2["movements"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["key"].as_str().unwrap())
        .collect();
    assert_eq!(keys, [movement_key(3_000), movement_key(2_000)]);

    let cursor = page2["nextCursor"].as_str().unwrap();
    let page3: serde_json::Value = cli
        .get(format!(
            "{}/api/movements?limit=2&cursor={cursor}",
            s.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page3["movements"].as_array().unwrap().len(), 1);
    assert_eq!(page3["hasMore"], false);

    // Cameras ride along, without credentials.
    let cameras = page1["cameras"].as_array().unwrap();
    assert_eq!(cameras.len(), 1);
    assert!(cameras[0].get("password").is_none());
    assert!(cameras[0].get("ip").is_none());

    let resp = cli
        .get(format!("{}/api/movements?limit=0", s.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let resp = cli
        .get(format!("{}/api/movements?mode=Bogus", s.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn filtered_mode_applies_tag_thresholds() {
    db::testutil::init();
    let s = start_server();
    let mut settings = s.tdb.settings.clone();
    settings.detection_tag_filters = vec![db::json::TagFilter {
        tag: "person".to_owned(),
        min_probability: 0.5,
    }];
    s.tdb
        .store
        .put(Namespace::Settings, "config", &settings)
        .unwrap();

    seed_movements(&s, &[1_000, 2_000]);
    let mut hit = new_movement(TEST_CAMERA_KEY, 3_000, Some(100));
    db::movement::apply_frame(&mut hit, "f.jpg", &[("person".to_owned(), 0.93)], 5);
    s.tdb
        .store
        .put(Namespace::Movements, &movement_key(3_000), &hit)
        .unwrap();

    let cli = reqwest::Client::new();
    let listing: serde_json::Value = cli
        .get(format!("{}/api/movements?mode=Filtered", s.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let movements = listing["movements"].as_array().unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0]["key"], movement_key(3_000));
}

#[tokio::test]
async fn clip_playlist_covers_requested_span() {
    db::testutil::init();
    let s = start_server();
    let cli = reqwest::Client::new();
    let resp = cli
        .get(format!(
            "{}/video/100/10/{TEST_CAMERA_KEY}/stream.m3u8?preseq=2&postseq=2",
            s.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(
        resp.headers()[reqwest::header::CONTENT_TYPE],
        "application/x-mpegURL"
    );
    let body = resp.text().await.unwrap();
    assert!(body.contains("#EXTM3U"));
    assert!(body.contains("#EXT-X-TARGETDURATION:2"));
    assert_eq!(body.matches("#EXTINF:2.000000,").count(), 9);
    for n in 98..=106 {
        assert!(body.contains(&format!("stream{n}.ts")), "missing {n}");
    }
    assert!(!body.contains("stream97.ts"));
    assert!(!body.contains("stream107.ts"));
    assert!(body.contains("#EXT-X-ENDLIST"));
}

#[tokio::test]
async fn live_media_serves_playlist_and_segments() {
    db::testutil::init();
    let s = start_server();
    let dir = s.tdb.tmpdir.path().join("testcam");
    std::fs::write(dir.join("stream.m3u8"), "#EXTM3U\n").unwrap();
    std::fs::write(dir.join("stream5.ts"), b"tsdata").unwrap();

    let cli = reqwest::Client::new();
    let resp = cli
        .get(format!(
            "{}/video/live/{TEST_CAMERA_KEY}/stream.m3u8",
            s.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(
        resp.headers()[reqwest::header::CONTENT_TYPE],
        "application/x-mpegURL"
    );
    assert_eq!(resp.text().await.unwrap(), "#EXTM3U\n");

    let resp = cli
        .get(format!(
            "{}/video/live/{TEST_CAMERA_KEY}/stream5.ts",
            s.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.headers()[reqwest::header::CONTENT_TYPE], "video/MP2T");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"tsdata");

    // Missing segment: 404. Non-media name: 404. Unknown camera: 404.
    for path in [
        format!("/video/live/{TEST_CAMERA_KEY}/stream99.ts"),
        format!("/video/live/{TEST_CAMERA_KEY}/notes.txt"),
        "/video/live/C999/stream.m3u8".to_owned(),
    ] {
        let resp = cli
            .get(format!("{}{path}", s.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND, "{path}");
    }
}

#[tokio::test]
async fn camera_create_update_tombstone() {
    db::testutil::init();
    let s = start_server();
    let cli = reqwest::Client::new();

    let body = serde_json::json!({
        "name": "garage",
        "folder": "garage",
        "disk": s.tdb.settings.disk_base_dir,
        "streamSource": "rtsp://example/garage",
        "enableStreaming": false,
        "enableMovement": false,
        "pollFrequencyMs": 1500,
        "secMaxSingleMovement": 120,
        // Server-owned state must be discarded on write.
        "stateLastProcessedMovementKey": "999999999999",
    });
    let resp = cli
        .post(format!("{}/api/camera/new", s.base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    let created: serde_json::Value = resp.json().await.unwrap();
    let key = created["key"].as_str().unwrap().to_owned();
    assert!(key.starts_with('C'));
    assert!(std::path::Path::new(&s.tdb.settings.disk_base_dir)
        .join("garage")
        .is_dir());

    let stored: Camera = s.tdb.store.get(Namespace::Cameras, &key).unwrap().unwrap();
    assert_eq!(stored.name, "garage");
    assert_eq!(stored.state_last_processed_movement_key, None);

    // Update preserves the server-owned watermark.
    let mut with_state = stored.clone();
    with_state.state_last_processed_movement_key = Some("000000000001".to_owned());
    s.tdb
        .store
        .put(Namespace::Cameras, &key, &with_state)
        .unwrap();
    let mut update = body.clone();
    update["name"] = "garage door".into();
    let resp = cli
        .post(format!("{}/api/camera/{key}", s.base_url))
        .json(&update)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let stored: Camera = s.tdb.store.get(Namespace::Cameras, &key).unwrap().unwrap();
    assert_eq!(stored.name, "garage door");
    assert_eq!(
        stored.state_last_processed_movement_key.as_deref(),
        Some("000000000001")
    );

    // Tombstone: retained in the store, gone from listings.
    let resp = cli
        .post(format!("{}/api/camera/{key}?delopt=del", s.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let stored: Camera = s.tdb.store.get(Namespace::Cameras, &key).unwrap().unwrap();
    assert!(stored.delete);
    let listing: serde_json::Value = cli
        .get(format!("{}/api/movements", s.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listing["cameras"]
        .as_array()
        .unwrap()
        .iter()
        .all(|c| c["key"] != key.as_str()));

    let resp = cli
        .post(format!("{}/api/camera/C424242?delopt=del", s.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_and_diskstatus() {
    db::testutil::init();
    let s = start_server();
    seed_movements(&s, &[1_700_000_000_000, 1_700_000_060_000]);
    s.tdb
        .store
        .put(
            Namespace::DiskStatus,
            TEST_CAMERA_KEY,
            &db::json::DiskStatus {
                last_run_ms: 42,
                files_deleted: 3,
                bytes_deleted: 300,
                cutoff_ms: 40,
                movements_deleted: 1,
            },
        )
        .unwrap();
    let cli = reqwest::Client::new();

    let stats: serde_json::Value = cli
        .get(format!("{}/api/stats", s.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats[TEST_CAMERA_KEY]["total"], 2);
    assert_eq!(stats[TEST_CAMERA_KEY]["perDay"][0]["count"], 2);

    let ds: serde_json::Value = cli
        .get(format!("{}/api/diskstatus", s.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ds[TEST_CAMERA_KEY]["filesDeleted"], 3);
    assert_eq!(ds[TEST_CAMERA_KEY]["movementsDeleted"], 1);
}

#[tokio::test]
async fn disk_cleanup_validates_target() {
    db::testutil::init();
    let s = start_server();
    let cli = reqwest::Client::new();
    for bad in ["0", "100", "nope", ""] {
        let resp = cli
            .post(format!("{}/api/diskcleanup?target={bad}", s.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST, "{bad}");
    }
    // Delete-all against an empty camera folder is a no-op.
    let resp = cli
        .post(format!("{}/api/diskcleanup?target=-1", s.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let outcome: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(outcome["filesDeleted"], 0);
}

#[tokio::test]
async fn image_and_frame_serving() {
    db::testutil::init();
    let s = start_server();
    let cli = reqwest::Client::new();

    let resp = cli
        .get(format!("{}/image/000000000042", s.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    // A movement whose best detection frame is on disk.
    let key = movement_key(1_700_000_000_000);
    let mut m = new_movement(TEST_CAMERA_KEY, 1_700_000_000_000, Some(100));
    let frame_name = format!("mov{key}_0001.jpg");
    db::movement::apply_frame(&mut m, &frame_name, &[("person".to_owned(), 0.9)], 5);
    s.tdb.store.put(Namespace::Movements, &key, &m).unwrap();
    std::fs::write(
        s.tdb.tmpdir.path().join("frames").join(&frame_name),
        b"jpeg-bytes",
    )
    .unwrap();

    let resp = cli
        .get(format!("{}/image/{key}", s.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.headers()[reqwest::header::CONTENT_TYPE], "image/jpeg");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"jpeg-bytes");

    let resp = cli
        .get(format!("{}/frame/{key}/{frame_name}", s.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    // Frames of other movements can't be reached through this one.
    let resp = cli
        .get(format!("{}/frame/{key}/mov000000000001_0001.jpg", s.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn event_stream_delivers_published_events() {
    db::testutil::init();
    let s = start_server();
    let cli = reqwest::Client::new();
    let mut resp = cli
        .get(format!("{}/api/movements/stream", s.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()[reqwest::header::CONTENT_TYPE],
        "text/event-stream"
    );

    let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), resp.chunk())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let hello = String::from_utf8(chunk.to_vec()).unwrap();
    assert!(hello.contains(r#""type":"connected""#), "{hello}");

    let m = new_movement(TEST_CAMERA_KEY, 1_700_000_000_000, Some(100));
    s.nvr.hub.publish(
        EventKind::MovementNew,
        &crate::json::MovementToClient::new(&movement_key(1_700_000_000_000), "test camera", &m),
    );
    let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), resp.chunk())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let ev = String::from_utf8(chunk.to_vec()).unwrap();
    assert!(ev.starts_with("data: "), "{ev}");
    assert!(ev.contains(r#""type":"movement_new""#), "{ev}");
    assert!(ev.contains("test camera"), "{ev}");
}
