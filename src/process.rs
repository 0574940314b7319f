// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Child-process supervision: spawn with drained stdio, a process-wide
//! registry, graceful-exit classification, and terminate-then-kill shutdown.

use base::{bail_t, Error, ErrorKind, ResultExt as _};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// How much trailing stderr is retained per process for error reporting.
const STDERR_TAIL_BYTES: usize = 500;

/// Where a drained output stream goes.
pub enum OutputSink {
    /// Discard.
    Null,
    /// Log each line at debug severity under the process name.
    Log,
    /// Forward each line to a channel; the receiver side may be dropped at
    /// any time.
    Lines(mpsc::UnboundedSender<String>),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Exit codes 0 and 255 and death-by-signal are how transcoders normally
    /// go away; anything else deserves attention.
    pub fn is_graceful(&self) -> bool {
        matches!(self.code, Some(0) | Some(255) | None)
    }
}

pub struct SpawnOptions {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
    /// When set, the child's stdin is piped and returned from `spawn`.
    pub pipe_stdin: bool,
}

impl SpawnOptions {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        SpawnOptions {
            name: name.into(),
            program: program.into(),
            args,
            cwd: None,
            stdout: OutputSink::Null,
            stderr: OutputSink::Log,
            pipe_stdin: false,
        }
    }
}

struct Shared {
    id: u64,
    name: String,
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    stderr_tail: Mutex<Vec<u8>>,
}

/// Handle to a supervised process. Cloneable; the process itself is owned by
/// a reaper task inside the supervisor.
#[derive(Clone)]
pub struct ProcessHandle(Arc<Shared>);

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_alive(&self) -> bool {
        self.0.exit_rx.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.0.exit_rx.borrow()
    }

    /// Completes when the process has exited and been reaped.
    pub async fn wait_exited(&self) -> ExitInfo {
        let mut rx = self.0.exit_rx.clone();
        let result = match rx.wait_for(|e| e.is_some()).await {
            Ok(e) => (*e).expect("wait_for guarantees Some"),
            // The sender lives in the reaper task; if it's gone the process
            // is certainly no longer running.
            Err(_) => self.exit_info().unwrap_or(ExitInfo {
                code: None,
                signal: None,
            }),
        };
        result
    }

    /// Last ~500 bytes of stderr, lossily decoded.
    pub fn stderr_tail(&self) -> String {
        String::from_utf8_lossy(&self.0.stderr_tail.lock()).into_owned()
    }

    fn send_signal(&self, sig: nix::sys::signal::Signal) {
        if !self.is_alive() {
            return;
        }
        if let Some(pid) = self.0.pid {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            if let Err(e) = nix::sys::signal::kill(pid, sig) {
                debug!(process = %self.0.name, %sig, err = %e, "signal failed");
            }
        }
    }

    pub fn terminate(&self) {
        self.send_signal(nix::sys::signal::Signal::SIGTERM);
    }

    pub fn kill(&self) {
        self.send_signal(nix::sys::signal::Signal::SIGKILL);
    }

    /// Asks the process to terminate, then force-kills after `graceful_wait`.
    pub async fn stop(&self, graceful_wait: Duration) -> ExitInfo {
        self.terminate();
        if tokio::time::timeout(graceful_wait, self.wait_exited())
            .await
            .is_err()
        {
            warn!(process = %self.0.name, "did not exit after SIGTERM; killing");
            self.kill();
            return self.wait_exited().await;
        }
        self.exit_info().unwrap_or(ExitInfo {
            code: None,
            signal: None,
        })
    }
}

#[derive(Default)]
struct Registry {
    procs: HashMap<u64, ProcessHandle>,
}

/// Spawns, tracks, and reaps every child process in the server.
pub struct Supervisor {
    next_id: AtomicU64,
    registry: Arc<Mutex<Registry>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor {
            next_id: AtomicU64::new(1),
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn process_count(&self) -> usize {
        self.registry.lock().procs.len()
    }

    /// Spawns a supervised process. Stdout/stderr are drained by dedicated
    /// tasks for the lifetime of the process; a reaper task classifies and
    /// logs the exit and removes the process from the registry.
    pub fn spawn(&self, opts: SpawnOptions) -> Result<(ProcessHandle, Option<ChildStdin>), Error> {
        let mut cmd = Command::new(&opts.program);
        cmd.args(&opts.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if opts.pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd
            .spawn()
            .err_kind(ErrorKind::Unavailable)
            .map_err(|e| e.context(format!("unable to spawn {} ({})", opts.name, opts.program)))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let stdin = child.stdin.take();
        let (exit_tx, exit_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            id,
            name: opts.name.clone(),
            pid,
            exit_rx,
            stderr_tail: Mutex::new(Vec::new()),
        });
        let handle = ProcessHandle(shared.clone());
        info!(process = %opts.name, pid, "spawned");

        let stdout_drain = child
            .stdout
            .take()
            .map(|s| tokio::spawn(drain(opts.name.clone(), s, opts.stdout, None)));
        let stderr_drain = child.stderr.take().map(|s| {
            tokio::spawn(drain(
                opts.name.clone(),
                s,
                opts.stderr,
                Some(shared.clone()),
            ))
        });

        self.registry.lock().procs.insert(id, handle.clone());
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            // The drains hit EOF once the process is gone; waiting for them
            // means an observed exit implies fully-captured output.
            if let Some(t) = stdout_drain {
                let _ = t.await;
            }
            if let Some(t) = stderr_drain {
                let _ = t.await;
            }
            let exit = match status {
                Ok(s) => ExitInfo {
                    code: s.code(),
                    signal: s.signal(),
                },
                Err(e) => {
                    error!(process = %shared.name, err = %e, "wait failed");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            if exit.is_graceful() {
                info!(process = %shared.name, code = ?exit.code, signal = ?exit.signal,
                      "exited gracefully");
            } else {
                let tail = String::from_utf8_lossy(&shared.stderr_tail.lock()).into_owned();
                error!(process = %shared.name, code = ?exit.code, %tail, "exited with error");
            }
            registry.lock().procs.remove(&shared.id);
            let _ = exit_tx.send(Some(exit));
        });

        Ok((handle, stdin))
    }

    /// Runs a command to completion, returning its status and captured
    /// output. A deadline, when given, kills the process on expiry.
    pub async fn run_to_completion(
        &self,
        name: &str,
        program: &str,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<CompletedProcess, Error> {
        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .err_kind(ErrorKind::Unavailable)
            .map_err(|e| e.context(format!("unable to spawn {name} ({program})")))?;
        debug!(process = %name, "running to completion");
        let output = match timeout {
            None => child.wait_with_output().await,
            Some(t) => match tokio::time::timeout(t, child.wait_with_output()).await {
                Ok(r) => r,
                // Dropping the future drops the child; kill_on_drop reaps it.
                Err(_) => {
                    bail_t!(DeadlineExceeded, "{} did not finish within {:?}", name, t)
                }
            },
        }
        .err_kind(ErrorKind::Internal)?;
        Ok(CompletedProcess {
            code: output.status.code(),
            signal: output.status.signal(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Walks the registry, asking every process to terminate and then
    /// force-killing stragglers after `shutdown_timeout`.
    pub async fn shutdown_all(&self, shutdown_timeout: Duration) {
        let procs: Vec<ProcessHandle> = self.registry.lock().procs.values().cloned().collect();
        if procs.is_empty() {
            return;
        }
        info!(count = procs.len(), "terminating supervised processes");
        for p in &procs {
            p.terminate();
        }
        let wait_all = async {
            for p in &procs {
                p.wait_exited().await;
            }
        };
        if tokio::time::timeout(shutdown_timeout, wait_all).await.is_err() {
            for p in &procs {
                if p.is_alive() {
                    warn!(process = %p.name(), "force-killing at shutdown");
                    p.kill();
                }
            }
            for p in &procs {
                p.wait_exited().await;
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct CompletedProcess {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

async fn drain<R: AsyncRead + Unpin>(
    name: String,
    stream: R,
    sink: OutputSink,
    tail: Option<Arc<Shared>>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(shared) = &tail {
                    let mut t = shared.stderr_tail.lock();
                    t.extend_from_slice(line.as_bytes());
                    t.push(b'\n');
                    if t.len() > STDERR_TAIL_BYTES {
                        let excess = t.len() - STDERR_TAIL_BYTES;
                        t.drain(..excess);
                    }
                }
                match &sink {
                    OutputSink::Null => {}
                    OutputSink::Log => debug!(process = %name, "{line}"),
                    OutputSink::Lines(tx) => {
                        let _ = tx.send(line);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(process = %name, err = %e, "error draining output");
                break;
            }
        }
    }
}
