// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON-compatible serde types for the durable data model. The same shapes
//! are stored in the key-value store and (selectively) served over the web
//! API.

use base::{bail_t, Error};
use serde::{Deserialize, Serialize};

/// The singleton server settings, stored at key `config` in the `settings`
/// namespace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Absolute path under which all camera folders live. No trailing slash.
    pub disk_base_dir: String,

    #[serde(default = "default_cleanup_interval_min")]
    pub disk_cleanup_interval_min: u32,

    /// Occupancy target in percent (1..=99). 0 disables cleanup.
    #[serde(default)]
    pub disk_cleanup_capacity_pct: i32,

    #[serde(default)]
    pub detection_enable: bool,

    #[serde(default)]
    pub detection_model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_target_hw: Option<String>,

    /// Frames folder, relative to `disk_base_dir`. No trailing slash.
    #[serde(default = "default_frames_path")]
    pub detection_frames_path: String,

    /// Thresholds applied by the `Filtered` movements view, in order.
    #[serde(default)]
    pub detection_tag_filters: Vec<TagFilter>,

    /// Local-time `HH:MM` at which the detection worker is recycled daily;
    /// empty disables.
    #[serde(default)]
    pub ml_restart_schedule: String,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    #[serde(default = "default_stream_verify_timeout_ms")]
    pub stream_verify_timeout_ms: u64,
}

fn default_cleanup_interval_min() -> u32 {
    60
}

fn default_frames_path() -> String {
    "frames".to_owned()
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_stream_verify_timeout_ms() -> u64 {
    30_000
}

impl Settings {
    pub fn validate(&self) -> Result<(), Error> {
        if self.disk_base_dir.is_empty() || !self.disk_base_dir.starts_with('/') {
            bail_t!(
                InvalidArgument,
                "diskBaseDir must be an absolute path, got {:?}",
                self.disk_base_dir
            );
        }
        if self.disk_base_dir.len() > 1 && self.disk_base_dir.ends_with('/') {
            bail_t!(InvalidArgument, "diskBaseDir must not end with a slash");
        }
        if self.disk_cleanup_capacity_pct != 0
            && !(1..=99).contains(&self.disk_cleanup_capacity_pct)
        {
            bail_t!(
                InvalidArgument,
                "diskCleanupCapacityPct must be 0 (disabled) or 1..=99, got {}",
                self.disk_cleanup_capacity_pct
            );
        }
        if self.detection_frames_path.starts_with('/') || self.detection_frames_path.ends_with('/')
        {
            bail_t!(
                InvalidArgument,
                "detectionFramesPath must be relative with no trailing slash"
            );
        }
        for f in &self.detection_tag_filters {
            if !(0.0..=1.0).contains(&f.min_probability) {
                bail_t!(
                    InvalidArgument,
                    "tag filter {:?} probability must be within [0, 1]",
                    f.tag
                );
            }
        }
        if !self.ml_restart_schedule.is_empty()
            && chrono::NaiveTime::parse_from_str(&self.ml_restart_schedule, "%H:%M").is_err()
        {
            bail_t!(
                InvalidArgument,
                "mlRestartSchedule must be HH:MM or empty, got {:?}",
                self.ml_restart_schedule
            );
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagFilter {
    pub tag: String,
    pub min_probability: f64,
}

/// A configured camera. Key format: `"C" + (unix_seconds - 1_600_000_000)`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Camera {
    pub name: String,

    /// Folder under `disk` holding this camera's playlist and segments.
    pub folder: String,

    /// Absolute base path; normally equal to the settings' `disk_base_dir`.
    pub disk: String,

    /// Explicit stream source (URL or file path). When absent, derived from
    /// `ip`/`password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Explicit motion endpoint override. When absent, derived from
    /// `ip`/`password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_url: Option<String>,

    #[serde(default)]
    pub enable_streaming: bool,

    #[serde(default)]
    pub enable_movement: bool,

    /// Tombstone: config retained, no processes started.
    #[serde(default)]
    pub delete: bool,

    #[serde(default = "default_poll_frequency_ms")]
    pub poll_frequency_ms: u64,

    #[serde(default = "default_polls_without_movement")]
    pub polls_without_movement: u32,

    #[serde(default = "default_sec_max_single_movement")]
    pub sec_max_single_movement: u32,

    /// Counts of 2-second HLS segments added around a clip.
    #[serde(default)]
    pub segments_prior_to_movement: u32,

    #[serde(default)]
    pub segments_post_movement: u32,

    /// Polling doesn't start until the stream has been up this long.
    #[serde(default)]
    pub sec_movement_startup_delay: u32,

    /// Server-owned: key of the newest movement that finished processing.
    /// Never writable by clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_last_processed_movement_key: Option<String>,
}

fn default_poll_frequency_ms() -> u64 {
    1_000
}

fn default_polls_without_movement() -> u32 {
    3
}

fn default_sec_max_single_movement() -> u32 {
    600
}

impl Camera {
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            bail_t!(InvalidArgument, "camera name must not be empty");
        }
        if self.folder.is_empty() || self.folder.contains('/') || self.folder.contains("..") {
            bail_t!(
                InvalidArgument,
                "camera folder must be a single path component, got {:?}",
                self.folder
            );
        }
        if !self.disk.starts_with('/') {
            bail_t!(InvalidArgument, "camera disk must be an absolute path");
        }
        if self.poll_frequency_ms < 1_000 {
            bail_t!(
                InvalidArgument,
                "pollFrequencyMs must be at least 1000, got {}",
                self.poll_frequency_ms
            );
        }
        if self.polls_without_movement > 10 {
            bail_t!(
                InvalidArgument,
                "pollsWithoutMovement must be within 0..=10, got {}",
                self.polls_without_movement
            );
        }
        if self.sec_max_single_movement < 60 {
            bail_t!(
                InvalidArgument,
                "secMaxSingleMovement must be at least 60, got {}",
                self.sec_max_single_movement
            );
        }
        if self.stream_source.is_none() && self.ip.is_none() {
            bail_t!(
                InvalidArgument,
                "camera needs either streamSource or ip/password"
            );
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingState {
    /// In-flight movements must not be evicted or re-dispatched.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ProcessingState::Pending | ProcessingState::Processing)
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    #[default]
    Starting,
    Extracting,
    Analyzing,
    Complete,
}

/// One motion episode. Key: zero-padded decimal millisecond epoch, width 12.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movement {
    pub camera_key: String,
    pub start_date_ms: i64,

    /// HLS media-sequence number at movement start; set on first
    /// observation of the live playlist.
    #[serde(default)]
    pub start_segment: Option<u64>,

    /// Set when the movement ends.
    #[serde(default)]
    pub end_segment: Option<u64>,

    /// Running duration at 2 s granularity.
    #[serde(default)]
    pub seconds: u32,

    #[serde(default)]
    pub poll_count: u32,

    #[serde(default)]
    pub consecutive_polls_without_movement: u32,

    #[serde(default)]
    pub processing_state: ProcessingState,

    #[serde(default)]
    pub detection_status: DetectionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_started_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_ended_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_completed_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_error: Option<String>,

    #[serde(default)]
    pub processing_attempts: u32,

    #[serde(default)]
    pub frames_sent_to_ml: u32,

    #[serde(default)]
    pub frames_received_from_ml: u32,

    #[serde(default)]
    pub ml_total_processing_time_ms: i64,

    #[serde(default)]
    pub ml_max_processing_time_ms: i64,

    #[serde(default)]
    pub detection_output: DetectionOutput,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionOutput {
    #[serde(default)]
    pub tags: Vec<DetectionTag>,
}

/// Aggregated per-tag result: at most one entry per tag string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionTag {
    pub tag: String,
    pub max_probability: f64,
    pub count: u32,
    pub max_probability_image: String,
}

/// Result of the most recent disk cleanup, one row per camera.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskStatus {
    pub last_run_ms: i64,
    pub files_deleted: u64,
    pub bytes_deleted: u64,
    pub cutoff_ms: i64,
    pub movements_deleted: u64,
}
