//! Colored tables for reports and layouts.

use super::{LayoutSummary, TableOptions};
use crate::pipeline::{RunOutcome, RunReport};
use crate::supervisor::WorkerReport;
use crate::theme::{Semantic, Themed, ThemedCell};
use comfy_table::{
    Cell, CellAlignment, ContentArrangement, Table,
    presets::{ASCII_FULL, UTF8_FULL},
};
use std::time::Duration;

fn new_table(options: TableOptions) -> Table {
    let mut table = Table::new();
    if options.ascii {
        table.load_preset(ASCII_FULL);
    } else {
        table.load_preset(UTF8_FULL);
    }
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn ms(d: Duration) -> String {
    format!("{:.2}", d.as_secs_f64() * 1000.0)
}

fn num(value: impl ToString) -> Cell {
    Cell::new(value.to_string()).set_alignment(CellAlignment::Right)
}

/// Count cell, highlighted as a warning when non-zero.
fn trouble(count: u32) -> Cell {
    let cell = num(count);
    if count > 0 { cell.themed(Semantic::Warn) } else { cell }
}

fn outcome_text(outcome: RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed => outcome.as_str().success(),
        RunOutcome::Interrupted => outcome.as_str().warning(),
        RunOutcome::BackendClosed | RunOutcome::WorkerFailed => outcome.as_str().error_style(),
    }
}

pub fn report_table(report: &RunReport, options: TableOptions) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "{} {}  {} {}/{} frames in {:.2}s ({:.1} fps, target {:.1})\n",
        "Outcome:".label(),
        outcome_text(report.outcome),
        "Presented:".label(),
        report.frames_presented.count(),
        report.frames_requested,
        report.elapsed.as_secs_f64(),
        report.achieved_fps,
        report.target_fps,
    ));
    out.push_str(&format!(
        "{} {} {}  {} late {}, stalled polls {}, avg wait {} ms\n\n{}\n",
        "Output:".label(),
        report.backend,
        format!("(numfr {})", report.numfr).muted(),
        "Consumer:".label(),
        report.consumer.late_frames,
        report.consumer.stalled_polls,
        ms(report.consumer.avg_wait()),
        "Workers".section_header(),
    ));

    let mut table = new_table(options);
    table.set_header(vec![
        "Worker", "PID", "Universes", "Frames", "Overdue", "Avg render ms", "Max render ms",
        "Peak RSS KiB", "Exit",
    ]);
    for worker in &report.worker_reports {
        table.add_row(worker_row(worker));
    }
    out.push_str(&table.to_string());
    out
}

fn worker_row(worker: &WorkerReport) -> Vec<Cell> {
    let pid = worker
        .pid
        .map(|p| p.to_string())
        .unwrap_or_else(|| "inline".to_string());
    let universes = if worker.universe_begin == worker.universe_end {
        Cell::new("-").themed(Semantic::Muted)
    } else {
        Cell::new(format!("{}..{}", worker.universe_begin, worker.universe_end))
    };
    let exit = match (&worker.exit, worker.errors.first()) {
        (_, Some(message)) => Cell::new(message).themed(Semantic::Bad),
        (Some(reason), None) if !reason.is_success() => Cell::new(reason).themed(Semantic::Bad),
        (Some(reason), None) => Cell::new(reason).themed(Semantic::Good),
        (None, None) => Cell::new("-").themed(Semantic::Muted),
    };

    match &worker.stats {
        Some(stats) => vec![
            num(worker.worker_id),
            Cell::new(pid),
            universes,
            num(stats.frames_rendered),
            trouble(stats.overdue),
            num(ms(stats.avg_render())),
            num(ms(stats.max_render)),
            num(stats.peak_rss_kib.map(|k| k.to_string()).unwrap_or_else(|| "-".into())),
            exit,
        ],
        None => vec![
            num(worker.worker_id),
            Cell::new(pid),
            universes,
            num("-"),
            num("-"),
            num("-"),
            num("-"),
            num("-"),
            exit,
        ],
    }
}

pub fn layout_table(summary: &LayoutSummary, options: TableOptions) -> String {
    let mut segment = new_table(options);
    segment.set_header(vec!["Region", "Offset", "Bytes"]);
    segment.add_row(vec![
        Cell::new("header"),
        num(0).themed(Semantic::Number),
        num(summary.header_bytes),
    ]);
    segment.add_row(vec![
        Cell::new(format!("slot control x{}", summary.queue_len)),
        num(summary.control_offset).themed(Semantic::Number),
        num(summary.control_bytes),
    ]);
    segment.add_row(vec![
        Cell::new(format!("pixels x{}", summary.queue_len)),
        num(summary.pixel_offset).themed(Semantic::Number),
        num(summary.slot_bytes * summary.queue_len as usize),
    ]);

    let mut workers = new_table(options);
    workers.set_header(vec!["Worker", "Universes", "Count", "Ready bit"]);
    for p in &summary.partitions {
        workers.add_row(vec![
            num(p.worker_id),
            Cell::new(format!("{}..{}", p.universe_begin, p.universe_end)),
            num(p.len()),
            num(format!("{:#x}", p.ready_bit)).themed(Semantic::Number),
        ]);
    }

    format!(
        "{} {} (key {:#010x}, {} bytes)\n{} {:#x}  {} {} x {} nodes\n\n{}\n{}\n\n{}\n{}",
        "Segment:".label(),
        summary.segment,
        summary.shm_key,
        summary.total_bytes.count(),
        "ALL_READY:".label(),
        summary.all_ready,
        "Universes:".label(),
        summary.universes,
        summary.nodes_per_universe,
        "Regions".section_header(),
        segment,
        "Partitions".section_header(),
        workers
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::output::fixtures;

    #[test]
    fn test_report_table_lists_workers() {
        let report = fixtures::report(RunOutcome::WorkerFailed);
        let text = report_table(&report, TableOptions { ascii: true });
        assert!(text.contains("worker-failed"));
        assert!(text.contains("/30 frames"));
        assert!(text.contains("0..12"));
        assert!(text.contains("segment missing"));
        assert!(text.contains("exited cleanly"));
    }

    #[test]
    fn test_layout_table() {
        let config = PipelineConfig {
            universes: 24,
            nodes_per_universe: 8,
            workers: 3,
            shm_key: 0x1234,
            ..PipelineConfig::default()
        };
        let summary = LayoutSummary::new(&config).unwrap();
        let text = layout_table(&summary, TableOptions::default());
        assert!(text.contains("/pixelpipe-00001234"));
        assert!(text.contains("0x7"));
        assert!(text.contains("16..24"));
        assert!(text.contains("0x4"));
    }
}
