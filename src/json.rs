// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON-compatible serde types for the web API.

use db::json::{Camera, Movement, Settings};
use serde::Serialize;

/// A movement as served to clients, both from `GET /movements` and on the
/// event stream.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementToClient {
    pub key: String,
    pub camera_name: String,
    #[serde(flatten)]
    pub movement: Movement,
}

impl MovementToClient {
    pub fn new(key: &str, camera_name: &str, movement: &Movement) -> Self {
        MovementToClient {
            key: key.to_owned(),
            camera_name: camera_name.to_owned(),
            movement: movement.clone(),
        }
    }

    /// Whether any aggregated tag clears at least one of the configured
    /// thresholds; the `Filtered` view keeps only such movements.
    pub fn passes_filters(&self, filters: &[db::json::TagFilter]) -> bool {
        self.movement.detection_output.tags.iter().any(|t| {
            filters
                .iter()
                .any(|f| f.tag == t.tag && t.max_probability >= f.min_probability)
        })
    }
}

/// A camera as served to clients: credentials and credential-bearing URLs
/// are never exposed.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraToClient {
    pub key: String,
    pub name: String,
    pub folder: String,
    pub enable_streaming: bool,
    pub enable_movement: bool,
    pub delete: bool,
    pub poll_frequency_ms: u64,
    pub polls_without_movement: u32,
    pub sec_max_single_movement: u32,
    pub segments_prior_to_movement: u32,
    pub segments_post_movement: u32,
    pub sec_movement_startup_delay: u32,
}

impl CameraToClient {
    pub fn new(key: &str, c: &Camera) -> Self {
        CameraToClient {
            key: key.to_owned(),
            name: c.name.clone(),
            folder: c.folder.clone(),
            enable_streaming: c.enable_streaming,
            enable_movement: c.enable_movement,
            delete: c.delete,
            poll_frequency_ms: c.poll_frequency_ms,
            polls_without_movement: c.polls_without_movement,
            sec_max_single_movement: c.sec_max_single_movement,
            segments_prior_to_movement: c.segments_prior_to_movement,
            segments_post_movement: c.segments_post_movement,
            sec_movement_startup_delay: c.sec_movement_startup_delay,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigToClient {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
}

/// Response shape of `GET /movements`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementsResponse {
    pub config: ConfigToClient,
    pub cameras: Vec<CameraToClient>,
    pub movements: Vec<MovementToClient>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Listing mode of `GET /movements`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ListMode {
    #[default]
    Movement,
    Filtered,
    /// Same server-side listing as `Movement`; the distinction is a client
    /// rendering concern.
    Time,
}

impl ListMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Movement" => Some(ListMode::Movement),
            "Filtered" => Some(ListMode::Filtered),
            "Time" => Some(ListMode::Time),
            _ => None,
        }
    }
}
