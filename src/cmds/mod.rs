// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{bail_t, Error};
use db::store::Store;
use std::path::{Path, PathBuf};
use tracing::info;

pub mod init;
pub mod run;

fn store_path(db_dir: &Path) -> PathBuf {
    db_dir.join("db")
}

/// Opens the store inside `db_dir`, optionally creating the directory.
pub(crate) fn open_store(db_dir: &Path, create: bool) -> Result<Store, Error> {
    if create {
        std::fs::create_dir_all(db_dir).map_err(|e| {
            base::Error::wrap(base::ErrorKind::FailedPrecondition, e)
                .context(format!("unable to create db dir {}", db_dir.display()))
        })?;
    } else if !db_dir.is_dir() {
        bail_t!(
            FailedPrecondition,
            "db dir {} not found; try running nightowl-nvr init",
            db_dir.display()
        );
    }
    let path = store_path(db_dir);
    info!(
        "Opening {} with SQLite version {}",
        path.display(),
        rusqlite::version()
    );
    Store::open(&path)
}
