//! Summary of one run.

use super::stats::{ConsumerStats, duration_ms};
use crate::backend::PerfStats;
use crate::supervisor::WorkerReport;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// How streaming ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    /// Every requested frame was presented.
    Completed,
    /// The output closed before the sequence ended.
    BackendClosed,
    /// Ctrl+C.
    Interrupted,
    /// A worker process exited with a failure.
    WorkerFailed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::BackendClosed => "backend-closed",
            Self::Interrupted => "interrupted",
            Self::WorkerFailed => "worker-failed",
        }
    }

    /// Outcomes the CLI reports as a failed run.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::BackendClosed | Self::WorkerFailed)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub backend: &'static str,
    pub shm_key: u32,
    pub workers: u32,
    pub queue_len: u32,
    pub frames_requested: u32,
    pub frames_presented: u32,
    /// Frames the output itself reports as consumed.
    pub numfr: u32,
    pub target_fps: f64,
    pub achieved_fps: f64,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub consumer: ConsumerStats,
    pub output: PerfStats,
    pub worker_reports: Vec<WorkerReport>,
}

impl RunReport {
    pub fn overdue_total(&self) -> u32 {
        self.worker_reports
            .iter()
            .filter_map(|r| r.stats.as_ref())
            .map(|s| s.overdue)
            .sum()
    }

    pub fn failed_workers(&self) -> usize {
        self.worker_reports.iter().filter(|r| r.failed()).count()
    }
}

/// Frames per second over `elapsed`, zero for an empty run.
pub fn achieved_fps(frames: u32, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if frames == 0 || secs <= 0.0 {
        0.0
    } else {
        frames as f64 / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_names_match_serde() {
        for outcome in [
            RunOutcome::Completed,
            RunOutcome::BackendClosed,
            RunOutcome::Interrupted,
            RunOutcome::WorkerFailed,
        ] {
            let json = serde_json::to_string(&outcome).unwrap();
            assert_eq!(json, format!("\"{}\"", outcome));
        }
    }

    #[test]
    fn test_failure_outcomes() {
        assert!(!RunOutcome::Completed.is_failure());
        assert!(!RunOutcome::Interrupted.is_failure());
        assert!(RunOutcome::BackendClosed.is_failure());
        assert!(RunOutcome::WorkerFailed.is_failure());
    }

    #[test]
    fn test_achieved_fps() {
        assert_eq!(achieved_fps(0, Duration::from_secs(1)), 0.0);
        assert_eq!(achieved_fps(10, Duration::ZERO), 0.0);
        assert_eq!(achieved_fps(60, Duration::from_secs(2)), 30.0);
    }
}
