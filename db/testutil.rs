// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving Nightowl NVR's persistence
//! layer. Used by tests of both `nightowl-db` and `nightowl-nvr`.

use crate::json::{Camera, Settings};
use crate::store::{Namespace, Store};
use std::sync::Arc;
use tempfile::TempDir;

static INIT: std::sync::Once = std::sync::Once::new();

/// Key of the camera created by `TestDb::new`.
pub const TEST_CAMERA_KEY: &str = "C100000000";

/// Performs global initialization for tests: logging to the test writer.
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
    });
}

pub struct TestDb {
    pub store: Arc<Store>,
    pub tmpdir: TempDir,
    pub settings: Settings,
    pub camera: Camera,
}

impl TestDb {
    /// Creates an in-memory store with settings rooted in a tempdir and one
    /// enabled camera whose folder exists on disk.
    pub fn new() -> Self {
        init();
        let tmpdir = tempfile::Builder::new()
            .prefix("nightowl-nvr-test")
            .tempdir()
            .unwrap();
        let base_dir = tmpdir.path().to_str().unwrap().to_owned();
        std::fs::create_dir_all(tmpdir.path().join("testcam")).unwrap();
        std::fs::create_dir_all(tmpdir.path().join("frames")).unwrap();

        let settings = Settings {
            disk_base_dir: base_dir.clone(),
            disk_cleanup_interval_min: 60,
            disk_cleanup_capacity_pct: 0,
            detection_enable: false,
            detection_model: "default".to_owned(),
            detection_target_hw: None,
            detection_frames_path: "frames".to_owned(),
            detection_tag_filters: Vec::new(),
            ml_restart_schedule: String::new(),
            shutdown_timeout_ms: 1_000,
            stream_verify_timeout_ms: 1_000,
        };
        let camera = Camera {
            name: "test camera".to_owned(),
            folder: "testcam".to_owned(),
            disk: base_dir,
            stream_source: Some("rtsp://test-camera/main".to_owned()),
            motion_url: Some("http://test-camera/motion".to_owned()),
            enable_streaming: true,
            enable_movement: true,
            poll_frequency_ms: 1_000,
            polls_without_movement: 3,
            sec_max_single_movement: 600,
            segments_prior_to_movement: 2,
            segments_post_movement: 2,
            ..Camera::default()
        };

        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .put(Namespace::Settings, "config", &settings)
            .unwrap();
        store
            .put(Namespace::Cameras, TEST_CAMERA_KEY, &camera)
            .unwrap();

        TestDb {
            store,
            tmpdir,
            settings,
            camera,
        }
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}
