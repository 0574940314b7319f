// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! Every durable timestamp in the system is a millisecond epoch, so that is
//! the unit the trait deals in.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstract interface to the wall clock. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current time as milliseconds since the Unix epoch.
    fn realtime_ms(&self) -> i64;
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn realtime_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is after the epoch")
            .as_millis() as i64
    }
}

/// Simulated clock for testing; advances only on request.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<AtomicI64>);

impl SimulatedClocks {
    pub fn new(now_ms: i64) -> Self {
        SimulatedClocks(Arc::new(AtomicI64::new(now_ms)))
    }

    /// Advances the clock by the specified amount without actually sleeping.
    pub fn advance_ms(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clocks for SimulatedClocks {
    fn realtime_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}
