//! Entry point of a worker process (`pixelpipe worker`).

use super::ipc::{LineWriter, PipeFd};
use super::protocol::WorkerMessage;
use super::signals::ignore_worker_signals;
use crate::config::{CONFIG_ENV, PipelineConfig, WORKER_ID_ENV};
use crate::error::{PipelineError, Result};
use crate::partition::partition;
use crate::pipeline::stats::{WorkerStats, peak_rss_kib};
use crate::pipeline::{ProcessContext, WorkerLoop, build_runtime};
use tracing::{debug, error, info_span, warn};

/// Run one worker to completion and exit the process.
///
/// Exit code 0 after a clean run, 1 after a reported failure, 2 when the
/// process was started without a usable identity.
pub fn run_worker_main() -> ! {
    ignore_worker_signals();

    let mut writer = match PipeFd::stdout() {
        Ok(fd) => LineWriter::new(fd),
        Err(e) => {
            error!(error = %e, "Worker cannot reach the master");
            std::process::exit(2);
        }
    };
    let worker_id = match worker_id_from_env() {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "Worker started without an identity");
            std::process::exit(2);
        }
    };
    let _span = info_span!("worker", id = worker_id).entered();

    match run_worker(worker_id, &mut writer) {
        Ok(stats) => {
            debug!(
                worker_id,
                frames = stats.frames_rendered,
                overdue = stats.overdue,
                "Worker exiting"
            );
            std::process::exit(0);
        }
        Err(e) => {
            error!(worker_id, error = %e, "Worker failed");
            let _ = writer.send(&WorkerMessage::error(worker_id, e.to_string()));
            std::process::exit(1);
        }
    }
}

fn worker_id_from_env() -> Result<u32> {
    let value = std::env::var(WORKER_ID_ENV)
        .map_err(|e| PipelineError::Worker(format!("{}: {}", WORKER_ID_ENV, e)))?;
    value
        .parse()
        .map_err(|e| PipelineError::Worker(format!("{}={:?}: {}", WORKER_ID_ENV, value, e)))
}

/// Progress reports go out about once per second of output.
fn progress_every(fps: f64) -> u32 {
    (fps.round() as u32).max(1)
}

fn run_worker(worker_id: u32, writer: &mut LineWriter<PipeFd>) -> Result<WorkerStats> {
    let value = std::env::var(CONFIG_ENV)
        .map_err(|e| PipelineError::Worker(format!("{}: {}", CONFIG_ENV, e)))?;
    let config = PipelineConfig::from_env_value(&value)?;
    let partition = partition(config.universes, config.workers, worker_id)?;
    let ctx = ProcessContext::attach(config)?;

    writer.send(&WorkerMessage::Online {
        worker_id,
        pid: std::process::id(),
        universe_begin: partition.universe_begin,
        universe_end: partition.universe_end,
    })?;

    let runtime = build_runtime()?;
    let every = progress_every(ctx.config.fps);
    let pattern = ctx.config.pattern.build();
    let mut stats = {
        let writer = &mut *writer;
        let worker = WorkerLoop::new(&ctx, partition, pattern).on_progress(every, |stats| {
            if let Err(e) = writer.send(&WorkerMessage::progress(stats)) {
                warn!(worker_id, error = %e, "Failed to send progress");
            }
        });
        runtime.block_on(worker.run())?
    };

    stats.peak_rss_kib = peak_rss_kib();
    writer.send(&WorkerMessage::Stats {
        stats: stats.clone(),
    })?;
    Ok(stats)
}
