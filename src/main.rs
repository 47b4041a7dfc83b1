//! pixelpipe - multi-process shared-memory frame pipeline

mod backend;
mod cli;
mod config;
mod error;
mod logging;
mod output;
mod partition;
mod pipeline;
mod render;
mod shm;
mod supervisor;
mod theme;
mod waiter;

use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::{OwoColorize, Stream::Stderr};

use backend::Backend;
use cli::{Cli, Commands, LayoutArgs, RunArgs};
use logging::LogConfig;
use output::LayoutSummary;
use pipeline::{CancelFlags, Pipeline};
use supervisor::{LogObserver, TerminationReason, WorkerCommand, WorkerObserver};
use theme::Themed;

/// Parse arguments, set up colors and logging, dispatch the subcommand and
/// print the error chain on failure (exit code 1).
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }

    let mut log_config = match cli.command {
        Commands::Worker => LogConfig::for_worker(),
        _ => LogConfig::new(),
    };
    if let Some(filter) = cli.log_filter() {
        log_config = log_config.with_filter(filter);
    }
    if cli.verbose >= 3 {
        log_config = log_config.with_span_events(true).with_thread_ids(true);
    }
    let log_config = log_config.with_env_overrides();
    logging::init(log_config.clone());

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args, &log_config),
        Commands::Layout(args) => cmd_layout(args),
        Commands::Worker => supervisor::run_worker_main(),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn progress_bar(frames: u32) -> Result<ProgressBar> {
    let pb = ProgressBar::new(frames as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} frames ({per_sec}, {eta}) {msg}")?
            .progress_chars("█▓▒░  "),
    );
    pb.set_prefix("Streaming");
    Ok(pb)
}

/// Keeps the progress bar informed about workers, on top of the usual logging.
struct BarObserver {
    bar: ProgressBar,
    workers: u32,
    online: AtomicU32,
}

impl WorkerObserver for BarObserver {
    fn on_online(&self, worker_id: u32, pid: u32) {
        LogObserver.on_online(worker_id, pid);
        let online = self.online.fetch_add(1, Ordering::Relaxed) + 1;
        self.bar
            .set_message(format!("{}/{} workers online", online, self.workers));
    }

    fn on_progress(&self, worker_id: u32, frames_rendered: u32, overdue: u32) {
        LogObserver.on_progress(worker_id, frames_rendered, overdue);
    }

    fn on_error(&self, worker_id: u32, message: &str) {
        LogObserver.on_error(worker_id, message);
        self.bar
            .println(format!("worker {}: {}", worker_id, message.error_style()));
    }

    fn on_exit(&self, worker_id: u32, reason: &TerminationReason) {
        LogObserver.on_exit(worker_id, reason);
        if !reason.is_success() {
            self.bar
                .println(format!("worker {} {}", worker_id, reason.to_string().warning()));
        }
    }
}

/// Stream a sequence and print its report. A run that ended early because
/// the output closed or a worker failed is an error.
fn cmd_run(cli: &Cli, args: &RunArgs, log_config: &LogConfig) -> Result<()> {
    let config = args.to_config();
    config.validate()?;

    let cancel = CancelFlags::default();
    let handler_flags = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, closing output...");
        handler_flags.interrupt();
    })
    .context("Failed to set Ctrl+C handler")?;

    let progress = if !cli.quiet && std::io::stderr().is_terminal() {
        Some(progress_bar(config.frames)?)
    } else {
        None
    };
    let on_frame = |frame: u32| {
        if let Some(pb) = &progress {
            pb.set_position(frame as u64 + 1);
        }
    };

    let workers = config.workers;
    let command =
        WorkerCommand::current_exe()?.env(logging::LOG_ENV, log_config.effective_filter());
    let mut pipeline = Pipeline::new(config)
        .with_cancel(cancel)
        .with_worker_command(command)
        .on_frame(&on_frame);
    if let Some(bar) = &progress {
        pipeline = pipeline.with_observer(Arc::new(BarObserver {
            bar: bar.clone(),
            workers,
            online: AtomicU32::new(0),
        }));
    }

    let mut backend = Backend::new(&args.backend_choice(), args.close_after);
    let report = pipeline
        .run(&mut backend)
        .context("Pipeline run failed")?;

    if let Some(pb) = &progress {
        pb.finish_and_clear();
    }
    output::print_report(&report, args.layout.format, args.layout.table_options());

    if report.outcome.is_failure() {
        anyhow::bail!(
            "run ended early ({}) after {} of {} frames",
            report.outcome,
            report.frames_presented,
            report.frames_requested
        );
    }
    Ok(())
}

fn cmd_layout(args: &LayoutArgs) -> Result<()> {
    let summary = LayoutSummary::new(&args.to_config())?;
    output::print_layout(&summary, args.layout.format, args.layout.table_options());
    Ok(())
}
