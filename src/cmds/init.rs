// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use std::path::PathBuf;
use structopt::StructOpt;
use tracing::info;

/// Initializes the database directory.
#[derive(StructOpt)]
pub struct Args {
    /// Directory holding the SQLite store.
    #[structopt(
        long,
        default_value = "/var/lib/nightowl-nvr/db",
        value_name = "path",
        parse(from_os_str)
    )]
    db_dir: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    super::open_store(&args.db_dir, true)?;
    info!("Store initialized at {}", args.db_dir.display());
    Ok(0)
}
