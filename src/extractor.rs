// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-movement frame extraction: a transcoder run over the movement's
//! segment range that emits JPEG frames for the detection worker.

use crate::hls;
use crate::process::{OutputSink, SpawnOptions, Supervisor};
use base::{bail_t, Error, ErrorKind, ResultExt as _};
use db::json::{Camera, Movement};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How often the frames folder is re-examined while the extractor runs.
const SCAN_INTERVAL: Duration = Duration::from_millis(250);

/// Safety bound on a single extraction.
const EXTRACT_DEADLINE: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub enum ExtractorEvent {
    /// A newly observed frame, in filename order.
    Frame { movement_key: String, path: PathBuf },
    /// The extractor finished; `frames_found` frames were published in
    /// total. `error` is set when the transcoder failed.
    Done {
        movement_key: String,
        frames_found: u32,
        error: Option<String>,
    },
}

/// Filename prefix of this movement's frames within the frames folder.
pub fn frame_prefix(movement_key: &str) -> String {
    format!("mov{movement_key}_")
}

/// Builds the concat list over the movement's clip range, skipping segments
/// the janitor already removed. Returns the list body and how many segments
/// it references.
fn build_concat_list(camera: &Camera, movement: &Movement) -> Result<(String, u32), Error> {
    let start = match movement.start_segment {
        Some(s) => s,
        None => bail_t!(FailedPrecondition, "movement has no start segment"),
    };
    let (first, last) = hls::clip_range(
        start,
        movement.seconds,
        camera.segments_prior_to_movement,
        camera.segments_post_movement,
    );
    let dir = crate::streamer::camera_dir(camera);
    let mut body = String::new();
    let mut count = 0;
    for n in first..=last {
        let path = dir.join(hls::segment_file(n));
        if path.exists() {
            body.push_str(&format!("file '{}'\n", path.display()));
            count += 1;
        }
    }
    if count == 0 {
        bail_t!(
            NotFound,
            "no segments on disk for range {}..={}",
            first,
            last
        );
    }
    Ok((body, count))
}

fn build_args(list_path: &PathBuf, out_pattern: &PathBuf) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "info".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list_path.to_string_lossy().into_owned(),
        "-vf".into(),
        "fps=1".into(),
        "-q:v".into(),
        "2".into(),
        out_pattern.to_string_lossy().into_owned(),
    ]
}

/// Extracts frames for one movement, publishing each new frame path and a
/// final `Done` on the channel. Never panics the caller: failures arrive as
/// `Done { error: Some(..) }`.
pub async fn run(
    supervisor: &Supervisor,
    transcoder_bin: &str,
    movement_key: String,
    camera: &Camera,
    movement: &Movement,
    frames_dir: PathBuf,
    tx: mpsc::UnboundedSender<ExtractorEvent>,
) {
    let list_path = frames_dir.join(format!("mov{movement_key}.concat"));
    let prepared = build_concat_list(camera, movement).and_then(|(body, count)| {
        std::fs::create_dir_all(&frames_dir).err_kind(ErrorKind::Unavailable)?;
        std::fs::write(&list_path, body).err_kind(ErrorKind::Unavailable)?;
        Ok(count)
    });
    let segments = match prepared {
        Ok(n) => n,
        Err(e) => {
            warn!(movement = %movement_key, err = %e.chain(), "frame extraction not started");
            let _ = tx.send(ExtractorEvent::Done {
                movement_key,
                frames_found: 0,
                error: Some(e.to_string()),
            });
            return;
        }
    };
    debug!(movement = %movement_key, segments, "extracting frames");

    let out_pattern = frames_dir.join(format!("{}%04d.jpg", frame_prefix(&movement_key)));
    let args = build_args(&list_path, &out_pattern);
    run_with_command(
        supervisor,
        transcoder_bin,
        args,
        movement_key,
        frames_dir.clone(),
        tx,
    )
    .await;
    let _ = std::fs::remove_file(&list_path);
}

/// The spawn-watch-publish core, parameterized on the exact command so tests
/// can substitute a stub for the transcoder.
async fn run_with_command(
    supervisor: &Supervisor,
    program: &str,
    args: Vec<String>,
    movement_key: String,
    frames_dir: PathBuf,
    tx: mpsc::UnboundedSender<ExtractorEvent>,
) {
    // Progress lines land in the debug log; the last ~500 bytes of stderr
    // are kept by the supervisor for error reporting.
    let mut opts = SpawnOptions::new(
        format!("extract-{movement_key}"),
        program.to_owned(),
        args,
    );
    opts.stdout = OutputSink::Null;
    opts.stderr = OutputSink::Log;
    let (handle, _) = match supervisor.spawn(opts) {
        Ok(h) => h,
        Err(e) => {
            let _ = tx.send(ExtractorEvent::Done {
                movement_key,
                frames_found: 0,
                error: Some(e.to_string()),
            });
            return;
        }
    };

    let prefix = frame_prefix(&movement_key);
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let publish_new = |seen: &mut HashSet<PathBuf>| {
        let entries = match std::fs::read_dir(&frames_dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        let mut fresh: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.extension().map(|e| e == "jpg").unwrap_or(false)
                    && p.file_name()
                        .map(|n| n.to_string_lossy().starts_with(&prefix))
                        .unwrap_or(false)
                    && !seen.contains(p)
            })
            .collect();
        fresh.sort();
        for path in fresh {
            seen.insert(path.clone());
            let _ = tx.send(ExtractorEvent::Frame {
                movement_key: movement_key.clone(),
                path,
            });
        }
    };

    let deadline = tokio::time::Instant::now() + EXTRACT_DEADLINE;
    let exit = loop {
        tokio::select! {
            exit = handle.wait_exited() => break Some(exit),
            _ = tokio::time::sleep(SCAN_INTERVAL) => {
                publish_new(&mut seen);
                if tokio::time::Instant::now() > deadline {
                    warn!(movement = %movement_key, "frame extraction ran too long; killing");
                    handle.kill();
                    break None;
                }
            }
        }
    };
    let exit = match exit {
        Some(e) => e,
        None => handle.wait_exited().await,
    };
    // One final sweep picks up frames written right before exit.
    publish_new(&mut seen);

    let error = match exit.code {
        Some(0) => None,
        code => {
            let tail = handle.stderr_tail();
            Some(if tail.is_empty() {
                format!("transcoder exited with code {code:?}")
            } else {
                tail
            })
        }
    };
    let _ = tx.send(ExtractorEvent::Done {
        movement_key,
        frames_found: seen.len() as u32,
        error,
    });
}
