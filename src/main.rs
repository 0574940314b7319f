// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use structopt::StructOpt;
use tracing::{debug, error};

mod cmds;
mod control;
mod detect;
mod events;
mod extractor;
mod hls;
mod janitor;
mod json;
mod poller;
mod process;
mod streamer;
mod tracker;
mod verify;
mod web;

/// Nightowl NVR: a multi-camera network video recorder with motion-driven
/// object detection.
#[derive(StructOpt)]
#[structopt(name = "nightowl-nvr")]
enum Args {
    /// Initializes the database directory.
    Init(cmds::init::Args),

    /// Runs the recorder and web server.
    Run(cmds::run::Args),
}

impl Args {
    fn run(self) -> Result<i32, base::Error> {
        match self {
            Args::Init(a) => cmds::init::run(a),
            Args::Run(a) => cmds::run::run(a),
        }
    }
}

fn main() {
    base::tracing_setup::install();
    let args = Args::from_args();
    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {rv}");
            std::process::exit(rv);
        }
    }
}
