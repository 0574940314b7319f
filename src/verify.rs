// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Asserting that a supervised stream process is alive and its output file
//! is fresh within a deadline.

use crate::process::ProcessHandle;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Default bound on how stale an output file may be while still counting as
/// live.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(5);

/// How often the output file is re-examined while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VerifyOutcome {
    /// The process is alive and its output file is fresh.
    Ready,
    /// The process exited before the output file became fresh.
    Failed,
    /// The deadline passed first.
    Timeout,
}

/// Returns whether `path` exists and was modified within `max_age`.
///
/// Also used by the stream controller for ongoing health checks of a running
/// stream.
pub fn is_stream_current(path: &Path, max_age: Duration) -> bool {
    let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age <= max_age,
        // Modified in the future: clock skew, call it current.
        Err(_) => true,
    }
}

/// Waits up to `timeout` for the process's output file to be fresh while the
/// process remains alive.
pub async fn wait_for_stream(
    process: &ProcessHandle,
    output: &Path,
    timeout: Duration,
    staleness: Duration,
) -> VerifyOutcome {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !process.is_alive() {
            debug!(process = %process.name(), "exited during stream verification");
            return VerifyOutcome::Failed;
        }
        if is_stream_current(output, staleness) {
            return VerifyOutcome::Ready;
        }
        if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
            return VerifyOutcome::Timeout;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
