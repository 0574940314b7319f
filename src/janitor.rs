// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Disk-pressure cleanup: delete the oldest files across the watched
//! folders until occupancy is under the capacity target, then delete the
//! movement records whose media fell inside the cleared range.

use base::clock::Clocks;
use base::{Error, ErrorKind, ResultExt as _};
use db::json::{DiskStatus, Movement};
use db::movement::movement_key;
use db::store::{Namespace, ScanOpts, Store};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

/// A folder the janitor watches. Camera folders carry their camera's key;
/// the shared frames folder doesn't belong to any camera. Folders with
/// `evict` unset are exempt from age-based file deletion but still get
/// frame cleanup for deleted movements (used by per-camera resets).
#[derive(Clone, Debug)]
pub struct WatchedFolder {
    pub camera_key: Option<String>,
    pub path: PathBuf,
    pub evict: bool,
}

/// Either an occupancy target in percent, or delete-all (the `-1` sentinel
/// used for resets).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Target {
    Pct(u8),
    All,
}

impl Target {
    pub fn from_pct(pct: i32) -> Option<Target> {
        match pct {
            -1 => Some(Target::All),
            1..=99 => Some(Target::Pct(pct as u8)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub files_deleted: u64,
    pub bytes_deleted: u64,
    pub movements_deleted: u64,
    /// Max mtime (ms) across all deleted files; `None` when nothing was
    /// deleted.
    pub cutoff_ms: Option<i64>,
}

struct FileEntry {
    path: PathBuf,
    mtime_ms: i64,
    size: u64,
    folder: usize,
}

#[derive(Default)]
struct FolderStats {
    files_deleted: u64,
    bytes_deleted: u64,
    newest_deleted_ms: Option<i64>,
}

/// Occupancy probe, as a fraction of capacity in percent. Injected so tests
/// can model a shrinking disk; production uses statvfs.
pub type UsageProbe = dyn Fn() -> Result<f64, Error> + Send + Sync;

/// Occupancy of the filesystem holding `path`, in percent.
pub fn statvfs_occupancy_pct(path: &std::path::Path) -> Result<f64, Error> {
    let vfs = nix::sys::statvfs::statvfs(path).err_kind(ErrorKind::Unavailable)?;
    let total = vfs.blocks() as f64 * vfs.fragment_size() as f64;
    if total <= 0.0 {
        return Ok(0.0);
    }
    let avail = vfs.blocks_available() as f64 * vfs.fragment_size() as f64;
    Ok((total - avail) / total * 100.0)
}

fn collect_files(folders: &[WatchedFolder]) -> Vec<FileEntry> {
    let mut out = Vec::new();
    for (i, folder) in folders.iter().enumerate() {
        if !folder.evict {
            continue;
        }
        let entries = match std::fs::read_dir(&folder.path) {
            Ok(e) => e,
            Err(e) => {
                debug!(folder = %folder.path.display(), err = %e, "unreadable watched folder");
                continue;
            }
        };
        for entry in entries.flatten() {
            let md = match entry.metadata() {
                Ok(md) if md.is_file() => md,
                _ => continue,
            };
            let mtime_ms = md
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            out.push(FileEntry {
                path: entry.path(),
                mtime_ms,
                size: md.len(),
                folder: i,
            });
        }
    }
    out.sort_by_key(|f| f.mtime_ms);
    out
}

/// Runs one cleanup pass. See module docs; the algorithm is:
///
/// 1. Gather `(mtime, size)` for every file in every watched folder.
/// 2. Delete globally-oldest-first while over target (all of them for
///    [`Target::All`]).
/// 3. The newest deleted mtime per folder becomes that folder's cutoff; the
///    max across folders bounds the movement sweep.
/// 4. Batch-delete matching movement records, skipping (with a warning) any
///    still pending or processing.
/// 5. Overwrite per-camera `DiskStatus` rows.
pub fn clear_down_disk(
    store: &Store,
    clocks: &dyn Clocks,
    folders: &[WatchedFolder],
    target: Target,
    usage: &UsageProbe,
) -> Result<Outcome, Error> {
    let files = collect_files(folders);
    let mut stats: Vec<FolderStats> = folders.iter().map(|_| FolderStats::default()).collect();
    let mut outcome = Outcome::default();

    for f in &files {
        let over = match target {
            Target::All => true,
            Target::Pct(p) => usage()? > f64::from(p),
        };
        if !over {
            break;
        }
        match std::fs::remove_file(&f.path) {
            Ok(()) => {
                let s = &mut stats[f.folder];
                s.files_deleted += 1;
                s.bytes_deleted += f.size;
                s.newest_deleted_ms = Some(s.newest_deleted_ms.unwrap_or(i64::MIN).max(f.mtime_ms));
                outcome.files_deleted += 1;
                outcome.bytes_deleted += f.size;
                outcome.cutoff_ms =
                    Some(outcome.cutoff_ms.unwrap_or(i64::MIN).max(f.mtime_ms));
            }
            Err(e) => debug!(path = %f.path.display(), err = %e, "unable to delete"),
        }
    }

    // Sweep movement records belonging to the watched cameras.
    let cameras: HashSet<&str> = folders
        .iter()
        .filter_map(|f| f.camera_key.as_deref())
        .collect();
    let scan = match (target, outcome.cutoff_ms) {
        (Target::All, _) => Some(ScanOpts::forward()),
        (Target::Pct(_), Some(cutoff)) => Some(ScanOpts::forward().lte(movement_key(cutoff))),
        (Target::Pct(_), None) => None,
    };
    let mut doomed: Vec<String> = Vec::new();
    let mut doomed_per_camera: HashMap<String, u64> = HashMap::new();
    if let Some(scan) = scan {
        for (key, m) in store.scan::<Movement>(Namespace::Movements, &scan)? {
            if !cameras.contains(m.camera_key.as_str()) {
                continue;
            }
            if m.processing_state.is_in_flight() {
                // Its segment files may already be gone; that's lost data,
                // not a reason to corrupt an in-progress movement.
                warn!(
                    movement = %key,
                    camera = %m.camera_key,
                    state = ?m.processing_state,
                    "skipping in-flight movement during cleanup"
                );
                continue;
            }
            *doomed_per_camera.entry(m.camera_key.clone()).or_default() += 1;
            doomed.push(key);
        }
    }
    if !doomed.is_empty() {
        delete_movement_frames(folders, &doomed);
        store.batch_delete(Namespace::Movements, &doomed)?;
        outcome.movements_deleted = doomed.len() as u64;
    }

    // Persist one DiskStatus row per camera.
    let now_ms = clocks.realtime_ms();
    for (i, folder) in folders.iter().enumerate() {
        let camera_key = match &folder.camera_key {
            Some(k) => k,
            None => continue,
        };
        let s = &stats[i];
        let status = DiskStatus {
            last_run_ms: now_ms,
            files_deleted: s.files_deleted,
            bytes_deleted: s.bytes_deleted,
            cutoff_ms: s.newest_deleted_ms.unwrap_or(0),
            movements_deleted: doomed_per_camera.get(camera_key).copied().unwrap_or(0),
        };
        store.put(Namespace::DiskStatus, camera_key, &status)?;
    }

    info!(
        files = outcome.files_deleted,
        bytes = outcome.bytes_deleted,
        movements = outcome.movements_deleted,
        "disk cleanup finished"
    );
    Ok(outcome)
}

/// Removes extracted frames (`mov<key>_*.jpg`) of deleted movements from any
/// watched folder that holds them.
fn delete_movement_frames(folders: &[WatchedFolder], doomed: &[String]) {
    let keys: HashSet<&str> = doomed.iter().map(String::as_str).collect();
    for folder in folders.iter().filter(|f| f.camera_key.is_none()) {
        let entries = match std::fs::read_dir(&folder.path) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let key = name
                .strip_prefix("mov")
                .and_then(|rest| rest.split_once('_'))
                .map(|(key, _)| key);
            if let Some(key) = key {
                if keys.contains(key) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }
}
