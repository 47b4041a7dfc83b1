//! Worker process supervision.
//!
//! The master spawns one process per worker, each a re-exec of this binary in
//! `worker` mode. Identity and the resolved config travel in the environment;
//! reports come back as JSON lines on the worker's stdout, read by one
//! collector thread per worker.
//!
//! Workers are not restarted. A worker that exits unsuccessfully raises the
//! shared failure flag and the consumer winds the run down.

mod ipc;
mod proc;
mod protocol;
mod signals;
mod worker_main;

pub use protocol::WorkerMessage;
pub use signals::TerminationReason;
pub use worker_main::run_worker_main;

use crate::config::{CONFIG_ENV, PipelineConfig, WORKER_ID_ENV};
use crate::error::{PipelineError, Result};
use crate::partition::{WorkerPartition, partition_table};
use crate::pipeline::CancelFlags;
use crate::pipeline::stats::WorkerStats;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use proc::WorkerProc;
use serde::Serialize;
use signals::analyze_wait_status;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Time stragglers get between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(500);

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// This binary's hidden `worker` subcommand.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| {
                PipelineError::Worker(format!("Failed to get current executable: {}", e))
            })?;
        Ok(Self::new(exe).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn spawn(&self, worker_id: u32, config_env: &str) -> Result<WorkerProc> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ID_ENV, worker_id.to_string())
            .env(CONFIG_ENV, config_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                PipelineError::Worker(format!("Failed to spawn worker {}: {}", worker_id, e))
            })?;
        WorkerProc::from_child(worker_id, child)
    }
}

/// Hooks for worker lifecycle events. Called from collector threads.
pub trait WorkerObserver: Send + Sync {
    fn on_online(&self, _worker_id: u32, _pid: u32) {}
    fn on_progress(&self, _worker_id: u32, _frames_rendered: u32, _overdue: u32) {}
    fn on_error(&self, _worker_id: u32, _message: &str) {}
    /// The worker's report pipe closed; it is about to be reaped.
    fn on_disconnect(&self, _worker_id: u32) {}
    fn on_exit(&self, _worker_id: u32, _reason: &TerminationReason) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct LogObserver;

impl WorkerObserver for LogObserver {
    fn on_online(&self, worker_id: u32, pid: u32) {
        debug!(worker_id, pid, "Worker online");
    }

    fn on_progress(&self, worker_id: u32, frames_rendered: u32, overdue: u32) {
        debug!(worker_id, frames_rendered, overdue, "Worker progress");
    }

    fn on_error(&self, worker_id: u32, message: &str) {
        warn!(worker_id, message, "Worker reported error");
    }

    fn on_disconnect(&self, worker_id: u32) {
        trace!(worker_id, "Worker pipe closed");
    }

    fn on_exit(&self, worker_id: u32, reason: &TerminationReason) {
        if reason.is_success() {
            debug!(worker_id, %reason, "Worker exited");
        } else {
            warn!(worker_id, %reason, "Worker failed");
        }
    }
}

/// Everything the master learned about one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub worker_id: u32,
    /// `None` for the inline worker.
    pub pid: Option<u32>,
    pub universe_begin: u32,
    pub universe_end: u32,
    pub stats: Option<WorkerStats>,
    pub errors: Vec<String>,
    /// `None` for the inline worker.
    pub exit: Option<TerminationReason>,
}

impl WorkerReport {
    pub fn new(partition: &WorkerPartition) -> Self {
        Self {
            worker_id: partition.worker_id,
            pid: None,
            universe_begin: partition.universe_begin,
            universe_end: partition.universe_end,
            stats: None,
            errors: Vec::new(),
            exit: None,
        }
    }

    pub fn failed(&self) -> bool {
        !self.errors.is_empty() || self.exit.as_ref().is_some_and(|e| !e.is_success())
    }
}

struct RunningWorker {
    worker_id: u32,
    pid: Pid,
    collector: JoinHandle<()>,
}

/// Owns the worker processes of one run.
pub struct Supervisor {
    config: PipelineConfig,
    config_env: String,
    command: WorkerCommand,
    observer: Arc<dyn WorkerObserver>,
    cancel: CancelFlags,
    running: Vec<RunningWorker>,
    reports_tx: Sender<WorkerReport>,
    reports_rx: Receiver<WorkerReport>,
}

impl Supervisor {
    pub fn new(
        config: &PipelineConfig,
        command: WorkerCommand,
        observer: Arc<dyn WorkerObserver>,
        cancel: CancelFlags,
    ) -> Result<Self> {
        let (reports_tx, reports_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            config: config.clone(),
            config_env: config.to_env_value()?,
            command,
            observer,
            cancel,
            running: Vec::new(),
            reports_tx,
            reports_rx,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.running.len()
    }

    /// Spawn every worker in the configured partition table.
    ///
    /// On error the workers already started keep running; `join` them after
    /// closing the output.
    pub fn spawn_all(&mut self) -> Result<()> {
        for partition in partition_table(self.config.universes, self.config.workers)? {
            self.launch_worker(&partition)?;
        }
        info!(workers = self.worker_count(), "Workers spawned");
        Ok(())
    }

    /// Start one worker and its collector thread.
    pub fn launch_worker(&mut self, partition: &WorkerPartition) -> Result<()> {
        let worker_id = partition.worker_id;
        let proc = self.command.spawn(worker_id, &self.config_env)?;
        let pid = proc.pid();
        debug!(worker_id, pid = pid.as_raw(), universes = ?partition.universes(), "Spawned worker");

        let report = WorkerReport::new(partition);
        let observer = Arc::clone(&self.observer);
        let cancel = self.cancel.clone();
        let tx = self.reports_tx.clone();
        let collector = std::thread::Builder::new()
            .name(format!("pixelpipe-collector-{}", worker_id))
            .spawn(move || collect(proc, report, observer.as_ref(), &cancel, &tx))?;

        self.running.push(RunningWorker {
            worker_id,
            pid,
            collector,
        });
        Ok(())
    }

    /// Wait up to `timeout` for every worker to exit, then terminate the
    /// stragglers. Reports come back in worker order.
    pub fn join(self, timeout: Duration) -> Vec<WorkerReport> {
        let Self {
            running,
            reports_tx,
            reports_rx,
            ..
        } = self;
        drop(reports_tx);

        let mut reports = Vec::with_capacity(running.len());
        let deadline = Instant::now() + timeout;
        receive_until(&reports_rx, &mut reports, running.len(), deadline);

        if reports.len() < running.len() {
            let stragglers = signal_pending(&running, &reports, Signal::SIGTERM);
            warn!(
                stragglers,
                timeout_ms = timeout.as_millis() as u64,
                "Workers did not exit in time, terminating"
            );
            receive_until(
                &reports_rx,
                &mut reports,
                running.len(),
                Instant::now() + TERM_GRACE,
            );
        }
        if reports.len() < running.len() {
            let stragglers = signal_pending(&running, &reports, Signal::SIGKILL);
            warn!(stragglers, "Killing workers");
        }

        for worker in running {
            if worker.collector.join().is_err() {
                warn!(worker_id = worker.worker_id, "Collector thread panicked");
            }
        }
        // Collectors that finished after the last wait.
        reports.extend(reports_rx.try_iter());

        reports.sort_by_key(|r| r.worker_id);
        reports
    }
}

fn receive_until(
    rx: &Receiver<WorkerReport>,
    reports: &mut Vec<WorkerReport>,
    expected: usize,
    deadline: Instant,
) {
    while reports.len() < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(report) => reports.push(report),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Signal every worker that has not reported yet. Returns how many.
fn signal_pending(running: &[RunningWorker], reports: &[WorkerReport], sig: Signal) -> usize {
    let mut count = 0;
    for worker in running {
        if reports.iter().any(|r| r.worker_id == worker.worker_id) {
            continue;
        }
        count += 1;
        if let Err(e) = signal::kill(worker.pid, sig) {
            debug!(worker_id = worker.worker_id, error = %e, "Signal not delivered");
        }
    }
    count
}

/// Collector thread body: drain one worker's reports, then reap it.
fn collect(
    mut proc: WorkerProc,
    mut report: WorkerReport,
    observer: &dyn WorkerObserver,
    cancel: &CancelFlags,
    tx: &Sender<WorkerReport>,
) {
    let worker_id = proc.worker_id();
    report.pid = Some(proc.pid().as_raw() as u32);

    loop {
        match proc.recv() {
            Ok(Some(message)) => {
                trace!(worker_id, kind = message.kind(), "Worker message");
                handle_message(&mut report, observer, message)
            }
            Ok(None) => break,
            Err(PipelineError::Json(e)) => {
                warn!(worker_id, error = %e, "Ignoring malformed worker message");
            }
            Err(e) => {
                warn!(worker_id, error = %e, "Lost worker pipe");
                break;
            }
        }
    }
    observer.on_disconnect(worker_id);

    let reason = match proc.wait() {
        Ok(status) => analyze_wait_status(status),
        Err(e) => {
            warn!(worker_id, error = %e, "Failed to reap worker");
            TerminationReason::Unknown
        }
    };
    if !reason.is_success() {
        cancel.fail_worker();
    }
    observer.on_exit(worker_id, &reason);
    report.exit = Some(reason);

    // The receiver is gone only if the supervisor itself was dropped.
    let _ = tx.send(report);
}

fn handle_message(
    report: &mut WorkerReport,
    observer: &dyn WorkerObserver,
    message: WorkerMessage,
) {
    let worker_id = report.worker_id;
    match message {
        WorkerMessage::Online {
            pid,
            universe_begin,
            universe_end,
            ..
        } => {
            if universe_begin != report.universe_begin || universe_end != report.universe_end {
                warn!(
                    worker_id,
                    expected = ?(report.universe_begin..report.universe_end),
                    actual = ?(universe_begin..universe_end),
                    "Worker computed a different partition"
                );
            }
            observer.on_online(worker_id, pid);
        }
        WorkerMessage::Progress {
            frames_rendered,
            overdue,
            ..
        } => observer.on_progress(worker_id, frames_rendered, overdue),
        WorkerMessage::Stats { stats } => report.stats = Some(stats),
        WorkerMessage::Error { message, .. } => {
            observer.on_error(worker_id, &message);
            report.errors.push(message);
        }
    }
}
