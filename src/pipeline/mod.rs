//! Frame pipeline: shared queue, render workers and the consumer.
//!
//! The master creates the shared frame queue, spawns worker processes (or
//! renders inline when `workers == 0`) and runs the consumer until the
//! sequence ends, the output closes, a worker fails or the user interrupts.

mod consumer;
mod report;
pub mod stats;
mod worker;

pub use consumer::{Consumer, ConsumerResult, unwind_timeout};
pub use report::{RunOutcome, RunReport, achieved_fps};
pub use worker::WorkerLoop;

use crate::backend::OutputBackend;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::partition::partition;
use crate::shm::FrameQueue;
use crate::shm::layout::OutputState;
use crate::supervisor::{LogObserver, Supervisor, WorkerCommand, WorkerObserver, WorkerReport};
use stats::peak_rss_kib;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::runtime::Runtime;
use tracing::{info, instrument, warn};

/// Process-local stop requests, shared with signal handlers and collector
/// threads. Workers never see these; they follow the shared output state.
#[derive(Debug, Clone, Default)]
pub struct CancelFlags {
    interrupted: Arc<AtomicBool>,
    worker_failed: Arc<AtomicBool>,
}

impl CancelFlags {
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn fail_worker(&self) {
        self.worker_failed.store(true, Ordering::SeqCst);
    }

    pub fn worker_failed(&self) -> bool {
        self.worker_failed.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_interrupted() || self.worker_failed()
    }
}

/// What one process knows about the run: its config, its mapping of the
/// queue and its cancellation flags.
pub struct ProcessContext {
    pub config: PipelineConfig,
    pub queue: FrameQueue,
    pub cancel: CancelFlags,
}

impl ProcessContext {
    /// Master side: validate the config and create the queue.
    pub fn create(config: PipelineConfig, cancel: CancelFlags) -> Result<Self> {
        config.validate()?;
        let queue = FrameQueue::create(config.shm_key, config.layout(), config.frames)?;
        Ok(Self {
            config,
            queue,
            cancel,
        })
    }

    /// Worker side: attach to the master's queue.
    pub fn attach(config: PipelineConfig) -> Result<Self> {
        let queue = FrameQueue::attach(config.shm_key, config.layout())?;
        Ok(Self {
            config,
            queue,
            cancel: CancelFlags::default(),
        })
    }
}

/// Single-threaded runtime used by the master and by every worker.
pub fn build_runtime() -> Result<Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?)
}

/// One run of the pipeline.
pub struct Pipeline<'a> {
    config: PipelineConfig,
    cancel: CancelFlags,
    command: Option<WorkerCommand>,
    observer: Arc<dyn WorkerObserver>,
    on_frame: Option<&'a (dyn Fn(u32) + 'a)>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            cancel: CancelFlags::default(),
            command: None,
            observer: Arc::new(LogObserver),
            on_frame: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlags) -> Self {
        self.cancel = cancel;
        self
    }

    /// Command used to start worker processes. Defaults to this binary's
    /// `worker` subcommand.
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkerObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn on_frame(mut self, f: &'a (dyn Fn(u32) + 'a)) -> Self {
        self.on_frame = Some(f);
        self
    }

    /// Stream the configured sequence to `backend`.
    ///
    /// Errors are startup failures and fatal conditions (desync, wait ceiling
    /// exceeded); every other way a run can end is a [`RunOutcome`].
    #[instrument(skip_all, fields(workers = self.config.workers, frames = self.config.frames))]
    pub fn run(self, backend: &mut dyn OutputBackend) -> Result<RunReport> {
        let Self {
            config,
            cancel,
            command,
            observer,
            on_frame,
        } = self;
        let started = Instant::now();
        let ctx = ProcessContext::create(config, cancel)?;
        let runtime = build_runtime()?;

        info!(
            shm_key = format_args!("{:#010x}", ctx.queue.key()),
            segment_bytes = ctx.queue.layout().total_bytes().unwrap_or(0),
            workers = ctx.config.workers,
            queue_len = ctx.config.queue_len,
            fps = ctx.config.fps,
            pattern = ?ctx.config.pattern,
            "Starting pipeline"
        );

        let result = if ctx.config.workers == 0 {
            run_inline(&ctx, &runtime, backend, on_frame)
        } else {
            run_supervised(&ctx, &runtime, backend, on_frame, command, observer)
        };
        // Every producer is gone; leave no half-published slot behind.
        ctx.queue.quiesce();
        let (consumed, worker_reports) = result?;

        let mut outcome = consumed.outcome;
        if outcome == RunOutcome::Completed && worker_reports.iter().any(|r| r.failed()) {
            outcome = RunOutcome::WorkerFailed;
        }

        let elapsed = started.elapsed();
        let presented = consumed.stats.frames_presented;
        let report = RunReport {
            outcome,
            backend: backend.name(),
            shm_key: ctx.config.shm_key,
            workers: ctx.config.workers,
            queue_len: ctx.queue.queue_len(),
            frames_requested: ctx.config.frames,
            frames_presented: presented,
            numfr: backend.numfr(),
            target_fps: ctx.config.fps,
            achieved_fps: achieved_fps(presented, elapsed),
            elapsed,
            consumer: consumed.stats,
            output: backend.perf_stats(),
            worker_reports,
        };
        info!(
            outcome = %report.outcome,
            frames = report.frames_presented,
            numfr = report.numfr,
            overdue = report.overdue_total(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Pipeline finished"
        );

        if let Err(e) = ctx.queue.detach() {
            warn!(error = %e, "Failed to remove shared segment");
        }
        Ok(report)
    }
}

/// Master renders the whole frame itself, interleaved with the consumer on
/// one thread.
fn run_inline(
    ctx: &ProcessContext,
    runtime: &Runtime,
    backend: &mut dyn OutputBackend,
    on_frame: Option<&(dyn Fn(u32) + '_)>,
) -> Result<(ConsumerResult, Vec<WorkerReport>)> {
    let partition = partition(ctx.config.universes, 0, 0)?;
    let mut report = WorkerReport::new(&partition);

    let mut consumer = Consumer::new(ctx, backend);
    if let Some(f) = on_frame {
        consumer = consumer.on_frame(f);
    }
    let worker = WorkerLoop::new(ctx, partition, ctx.config.pattern.build());
    let worker = async {
        let result = worker.run().await;
        if result.is_err() {
            ctx.cancel.fail_worker();
        }
        result
    };

    let (consumed, rendered) = runtime.block_on(async { tokio::join!(consumer.run(), worker) });
    match rendered {
        Ok(mut stats) => {
            stats.peak_rss_kib = peak_rss_kib();
            report.stats = Some(stats);
        }
        Err(e) => {
            warn!(error = %e, "Inline worker failed");
            report.errors.push(e.to_string());
        }
    }
    Ok((consumed?, vec![report]))
}

fn run_supervised(
    ctx: &ProcessContext,
    runtime: &Runtime,
    backend: &mut dyn OutputBackend,
    on_frame: Option<&(dyn Fn(u32) + '_)>,
    command: Option<WorkerCommand>,
    observer: Arc<dyn WorkerObserver>,
) -> Result<(ConsumerResult, Vec<WorkerReport>)> {
    let command = match command {
        Some(command) => command,
        None => WorkerCommand::current_exe()?,
    };
    let timeout = unwind_timeout(ctx.config.frame_interval());
    let mut supervisor = Supervisor::new(&ctx.config, command, observer, ctx.cancel.clone())?;
    if let Err(e) = supervisor.spawn_all() {
        ctx.queue.set_output_state(OutputState::Closed);
        supervisor.join(timeout);
        return Err(e);
    }

    let mut consumer = Consumer::new(ctx, backend);
    if let Some(f) = on_frame {
        consumer = consumer.on_frame(f);
    }
    let consumed = runtime.block_on(consumer.run());
    let reports = supervisor.join(timeout);
    Ok((consumed?, reports))
}
