// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::control::{self, Nvr};
use crate::detect::{Dispatcher, DispatcherConfig};
use crate::events::Hub;
use crate::poller::MotionPoller;
use crate::process::Supervisor;
use crate::streamer::Streamer;
use crate::tracker::Tracker;
use crate::web;
use base::clock::{Clocks, RealClocks};
use base::{bail_t, Error, ErrorKind, ResultExt as _};
use db::json::Settings;
use db::store::Namespace;
use hyper::service::{make_service_fn, service_fn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Runs the recorder and web server.
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

    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[structopt(long, value_name = "worker_threads")]
    worker_threads: Option<usize>,

    /// Bind address for the HTTP server.
    #[structopt(long, default_value = "0.0.0.0:8000", parse(try_from_str))]
    http_addr: std::net::SocketAddr,

    /// Transcoder binary used for live capture, frame extraction, and MP4
    /// export.
    #[structopt(long, default_value = "ffmpeg", value_name = "bin")]
    transcoder_bin: String,

    /// Object-detection worker binary.
    #[structopt(long, default_value = "nightowl-detect", value_name = "bin")]
    detector_bin: String,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = args.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let rt = builder.build().err_kind(ErrorKind::Internal)?;
    let r = rt.block_on(async_run(args));

    // In the graceful path, everything to wait for has been waited for with
    // logging; in the immediate path, waiting is exactly what we don't want.
    rt.shutdown_background();
    r
}

async fn async_run(args: Args) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    let mut int = signal(SignalKind::interrupt()).err_kind(ErrorKind::Internal)?;
    let mut term = signal(SignalKind::terminate()).err_kind(ErrorKind::Internal)?;
    tokio::pin! {
        let inner = inner(args, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("Received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("Received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail_t!(Cancelled, "immediate shutdown due to second signal (SIGINT)"),
        _ = term.recv() => bail_t!(Cancelled, "immediate shutdown due to second signal (SIGTERM)"),
        result = &mut inner => result,
    }
}

async fn inner(args: Args, shutdown_rx: base::shutdown::Receiver) -> Result<i32, Error> {
    let store = Arc::new(super::open_store(&args.db_dir, false)?);
    info!("Store is loaded.");

    // A configured base dir that has gone away is a configuration error, not
    // something to limp along with.
    if let Some(settings) = store.get::<Settings>(Namespace::Settings, "config")? {
        if !std::path::Path::new(&settings.disk_base_dir).is_dir() {
            bail_t!(
                FailedPrecondition,
                "diskBaseDir {:?} is not an existing directory",
                settings.disk_base_dir
            );
        }
    } else {
        info!("No settings configured yet; waiting for POST /api/settings.");
    }

    let clocks: Arc<dyn Clocks> = Arc::new(RealClocks);
    let hub = Arc::new(Hub::new());
    let supervisor = Arc::new(Supervisor::new());
    let dispatcher = Dispatcher::spawn(DispatcherConfig {
        store: store.clone(),
        clocks: clocks.clone(),
        hub: hub.clone(),
        supervisor: supervisor.clone(),
        transcoder_bin: args.transcoder_bin.clone(),
        detector_bin: args.detector_bin.clone(),
    });
    let nvr = Arc::new(Nvr::new(
        store.clone(),
        clocks.clone(),
        hub.clone(),
        supervisor.clone(),
        dispatcher,
        MotionPoller::new()?,
        Streamer::new(supervisor.clone(), clocks.clone(), args.transcoder_bin.clone()),
        Tracker::new(store.clone(), clocks.clone(), hub.clone()),
        args.transcoder_bin.clone(),
    ));

    nvr.requeue_pending()?;

    let svc = Arc::new(web::Service::new(nvr.clone()));
    let make_svc = make_service_fn(move |_conn| {
        futures::future::ok::<_, std::convert::Infallible>(service_fn({
            let svc = Arc::clone(&svc);
            move |req| Arc::clone(&svc).serve(req)
        }))
    });
    let server = hyper::Server::try_bind(&args.http_addr)
        .err_kind(ErrorKind::Unavailable)
        .map_err(|e| e.context(format!("unable to bind --http-addr={}", args.http_addr)))?
        .tcp_nodelay(true)
        .serve(make_svc);
    let graceful_rx = shutdown_rx.clone();
    let server = server.with_graceful_shutdown(async move { graceful_rx.wait().await });
    let server_handle = tokio::spawn(server);

    let control_handle = tokio::spawn(control::run_loop(nvr.clone(), shutdown_rx.clone()));

    info!("Ready to serve HTTP requests");
    shutdown_rx.wait().await;
    nvr.begin_shutdown();

    info!("Shutting down control loop and detection dispatcher.");
    control_handle.await.err_kind(ErrorKind::Internal)?;
    nvr.dispatcher.shutdown().await;
    hub.close_all();

    let shutdown_timeout = nvr
        .settings()
        .map(|s| s.shutdown_timeout_ms)
        .unwrap_or(5_000);
    info!("Stopping supervised processes.");
    supervisor
        .shutdown_all(Duration::from_millis(shutdown_timeout))
        .await;

    info!("Waiting for HTTP requests to finish.");
    server_handle
        .await
        .err_kind(ErrorKind::Internal)?
        .err_kind(ErrorKind::Internal)?;
    info!("Exiting.");
    Ok(0)
}
