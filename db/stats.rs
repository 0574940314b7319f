// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-camera movement statistics, computed by a full scan of the
//! `movements` namespace.

use crate::json::Movement;
use crate::store::{Namespace, ScanOpts, Store};
use base::Error;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraStats {
    pub total: u64,
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
    pub per_day: Vec<DayCount>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayCount {
    /// UTC calendar day, `YYYY-MM-DD`.
    pub day: String,
    pub count: u64,
}

/// Scans every movement and buckets by camera and UTC day.
pub fn movement_stats(store: &Store) -> Result<HashMap<String, CameraStats>, Error> {
    let mut per_camera: HashMap<String, (CameraStats, BTreeMap<String, u64>)> = HashMap::new();
    for (_, m) in store.scan::<Movement>(Namespace::Movements, &ScanOpts::forward())? {
        let entry = per_camera.entry(m.camera_key.clone()).or_default();
        entry.0.total += 1;
        entry.0.oldest = Some(match entry.0.oldest {
            None => m.start_date_ms,
            Some(o) => o.min(m.start_date_ms),
        });
        entry.0.newest = Some(match entry.0.newest {
            None => m.start_date_ms,
            Some(n) => n.max(m.start_date_ms),
        });
        if let Some(day) = chrono::DateTime::from_timestamp_millis(m.start_date_ms) {
            *entry
                .1
                .entry(day.date_naive().format("%Y-%m-%d").to_string())
                .or_default() += 1;
        }
    }
    Ok(per_camera
        .into_iter()
        .map(|(camera, (mut stats, days))| {
            stats.per_day = days
                .into_iter()
                .map(|(day, count)| DayCount { day, count })
                .collect();
            (camera, stats)
        })
        .collect())
}
