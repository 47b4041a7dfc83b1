//! Plain text output (tab-separated, no colors).

use super::LayoutSummary;
use crate::pipeline::RunReport;

pub fn report_plain(report: &RunReport) -> String {
    let mut lines = vec![
        format!("outcome\t{}", report.outcome),
        format!("frames\t{}/{}", report.frames_presented, report.frames_requested),
        format!("numfr\t{}", report.numfr),
        format!("elapsed_ms\t{}", report.elapsed.as_millis()),
        format!("fps\t{:.2}", report.achieved_fps),
        format!("late\t{}", report.consumer.late_frames),
        format!("overdue\t{}", report.overdue_total()),
        format!("failed_workers\t{}", report.failed_workers()),
        format!("digest\t{:016x}", report.output.digest),
        "WORKER\tPID\tUNIVERSES\tFRAMES\tOVERDUE\tEXIT".to_string(),
    ];
    for w in &report.worker_reports {
        let pid = w.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let (frames, overdue) = match &w.stats {
            Some(s) => (s.frames_rendered.to_string(), s.overdue.to_string()),
            None => ("-".into(), "-".into()),
        };
        let exit = match (&w.exit, w.errors.first()) {
            (_, Some(message)) => message.clone(),
            (Some(reason), None) => reason.to_string(),
            (None, None) => "-".into(),
        };
        lines.push(format!(
            "{}\t{}\t{}..{}\t{}\t{}\t{}",
            w.worker_id, pid, w.universe_begin, w.universe_end, frames, overdue, exit
        ));
    }
    lines.join("\n")
}

pub fn layout_plain(summary: &LayoutSummary) -> String {
    let mut lines = vec![
        format!("segment\t{}", summary.segment),
        format!("total_bytes\t{}", summary.total_bytes),
        format!("control_offset\t{}", summary.control_offset),
        format!("pixel_offset\t{}", summary.pixel_offset),
        format!("slot_bytes\t{}", summary.slot_bytes),
        format!("all_ready\t{:#x}", summary.all_ready),
        "WORKER\tBEGIN\tEND\tBIT".to_string(),
    ];
    for p in &summary.partitions {
        lines.push(format!(
            "{}\t{}\t{}\t{:#x}",
            p.worker_id, p.universe_begin, p.universe_end, p.ready_bit
        ));
    }
    lines.join("\n")
}
