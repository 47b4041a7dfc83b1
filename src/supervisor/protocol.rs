//! Messages a worker sends to the master on its stdout.

use crate::pipeline::stats::WorkerStats;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Attached to the segment and about to render.
    Online {
        worker_id: u32,
        pid: u32,
        universe_begin: u32,
        universe_end: u32,
    },
    /// Periodic liveness report.
    Progress {
        worker_id: u32,
        frames_rendered: u32,
        overdue: u32,
    },
    /// Final counters, sent once before a clean exit.
    Stats { stats: WorkerStats },
    /// Fatal error; the worker exits non-zero right after.
    Error { worker_id: u32, message: String },
}

impl WorkerMessage {
    pub fn progress(stats: &WorkerStats) -> Self {
        Self::Progress {
            worker_id: stats.worker_id,
            frames_rendered: stats.frames_rendered,
            overdue: stats.overdue,
        }
    }

    pub fn error(worker_id: u32, message: impl Into<String>) -> Self {
        Self::Error {
            worker_id,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Online { .. } => "online",
            Self::Progress { .. } => "progress",
            Self::Stats { .. } => "stats",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_wire_format() {
        let msg = WorkerMessage::Online {
            worker_id: 1,
            pid: 4242,
            universe_begin: 8,
            universe_end: 16,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "online");
        assert_eq!(json["universe_end"], 16);
        let back: WorkerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_stats_message_carries_counters() {
        let mut stats = WorkerStats::new(3);
        stats.frames_rendered = 10;
        stats.overdue = 1;
        let line = serde_json::to_string(&WorkerMessage::Stats {
            stats: stats.clone(),
        })
        .unwrap();
        assert!(line.contains("\"type\":\"stats\""));
        match serde_json::from_str(&line).unwrap() {
            WorkerMessage::Stats { stats: back } => assert_eq!(back, stats),
            other => panic!("Expected Stats, got {:?}", other),
        }
    }

    #[test]
    fn test_progress_from_stats() {
        let mut stats = WorkerStats::new(2);
        stats.frames_rendered = 30;
        let msg = WorkerMessage::progress(&stats);
        assert_eq!(msg.kind(), "progress");
        assert_eq!(
            msg,
            WorkerMessage::Progress {
                worker_id: 2,
                frames_rendered: 30,
                overdue: 0,
            }
        );
    }

    #[test]
    fn test_error_message() {
        let msg = WorkerMessage::error(0, "boom");
        let line = serde_json::to_string(&msg).unwrap();
        assert_eq!(line, r#"{"type":"error","worker_id":0,"message":"boom"}"#);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<WorkerMessage>(r#"{"type":"restart"}"#).is_err());
    }
}
