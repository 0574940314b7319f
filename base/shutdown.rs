// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! Dropping the [`Sender`] requests shutdown. The [`Receiver`] can be cloned
//! freely, checked synchronously from loops, and awaited from async code.

use tokio::sync::watch;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

pub struct Sender(watch::Sender<bool>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Flip the flag before the watch channel itself closes so receivers
        // polling `check` and receivers awaiting `wait` both observe it.
        let _ = self.0.send(true);
    }
}

#[derive(Clone)]
pub struct Receiver(watch::Receiver<bool>);

impl Receiver {
    /// Returns an error iff shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if *self.0.borrow() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Completes when shutdown is requested.
    pub async fn wait(&self) {
        let mut rx = self.0.clone();
        // An error here means the sender is gone, which is itself shutdown.
        let _ = rx.wait_for(|&requested| requested).await;
    }
}

/// Returns a sender and receiver for graceful shutdown.
pub fn channel() -> (Sender, Receiver) {
    let (tx, rx) = watch::channel(false);
    (Sender(tx), Receiver(rx))
}

#[cfg(test)]
mod tests {
    #[test]
    fn simple_check() {
        let (tx, rx) = super::channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[tokio::test]
    async fn wait_wakes_on_drop() {
        let (tx, rx) = super::channel();
        let rx2 = rx.clone();
        let h = tokio::spawn(async move { rx2.wait().await });
        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(5), h)
            .await
            .expect("wait should complete promptly")
            .unwrap();
        rx.check().unwrap_err();
    }
}
