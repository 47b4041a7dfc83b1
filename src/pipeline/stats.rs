//! Per-process counters for workers and the consumer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Durations as fractional milliseconds (microsecond precision) on the wire
/// and in reports.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_micros() as f64 / 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(d)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(serde::de::Error::custom(format!("invalid duration {}ms", ms)));
        }
        Ok(Duration::from_micros((ms * 1000.0).round() as u64))
    }
}

/// Counters kept by one worker. Liveness problems land here; none of them
/// stop the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: u32,
    pub frames_rendered: u32,
    /// Frames whose render took longer than the frame interval.
    pub overdue: u32,
    #[serde(with = "duration_ms")]
    pub wait_time: Duration,
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
    #[serde(with = "duration_ms")]
    pub render_time: Duration,
    #[serde(with = "duration_ms")]
    pub max_render: Duration,
    /// Peak resident set size in KiB, if known.
    pub peak_rss_kib: Option<u64>,
}

impl WorkerStats {
    pub fn new(worker_id: u32) -> Self {
        Self {
            worker_id,
            ..Self::default()
        }
    }

    pub fn record_wait(&mut self, waited: Duration) {
        self.wait_time += waited;
        self.max_wait = self.max_wait.max(waited);
    }

    /// Record a render and report whether it overran `budget`.
    pub fn record_render(&mut self, took: Duration, budget: Duration) -> bool {
        self.render_time += took;
        self.max_render = self.max_render.max(took);
        let overdue = took > budget;
        if overdue {
            self.overdue += 1;
        }
        overdue
    }

    pub fn avg_render(&self) -> Duration {
        average(self.render_time, self.frames_rendered)
    }

    pub fn avg_wait(&self) -> Duration {
        average(self.wait_time, self.frames_rendered)
    }
}

/// Counters kept by the consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerStats {
    pub frames_presented: u32,
    /// Frames handed to the output after their display interval had passed.
    pub late_frames: u32,
    /// Readiness polls that found the slot incomplete.
    pub stalled_polls: u64,
    #[serde(with = "duration_ms")]
    pub wait_time: Duration,
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
    #[serde(with = "duration_ms")]
    pub write_time: Duration,
}

impl ConsumerStats {
    pub fn record_wait(&mut self, waited: Duration, polls: u32) {
        self.wait_time += waited;
        self.max_wait = self.max_wait.max(waited);
        self.stalled_polls += polls as u64;
    }

    pub fn avg_wait(&self) -> Duration {
        average(self.wait_time, self.frames_presented)
    }
}

fn average(total: Duration, count: u32) -> Duration {
    if count == 0 {
        Duration::ZERO
    } else {
        total / count
    }
}

/// Peak RSS of the calling process in KiB.
pub fn peak_rss_kib() -> Option<u64> {
    use nix::sys::resource::{UsageWho, getrusage};

    let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
    let max_rss = usage.max_rss() as u64;

    #[cfg(target_os = "macos")]
    {
        // bytes on macOS
        Some(max_rss / 1024)
    }

    #[cfg(not(target_os = "macos"))]
    {
        Some(max_rss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_render_counts_overruns() {
        let budget = Duration::from_millis(10);
        let mut stats = WorkerStats::new(1);
        assert!(!stats.record_render(Duration::from_millis(3), budget));
        assert!(stats.record_render(Duration::from_millis(50), budget));
        assert!(!stats.record_render(Duration::from_millis(10), budget));
        assert_eq!(stats.overdue, 1);
        assert_eq!(stats.max_render, Duration::from_millis(50));
        assert_eq!(stats.render_time, Duration::from_millis(63));
    }

    #[test]
    fn test_averages_handle_zero_frames() {
        let stats = WorkerStats::new(0);
        assert_eq!(stats.avg_render(), Duration::ZERO);
        assert_eq!(ConsumerStats::default().avg_wait(), Duration::ZERO);
    }

    #[test]
    fn test_worker_stats_wire_format() {
        let mut stats = WorkerStats::new(2);
        stats.frames_rendered = 4;
        stats.record_wait(Duration::from_micros(1500));
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["worker_id"], 2);
        assert_eq!(json["wait_time"], 1.5);

        let back: WorkerStats = serde_json::from_value(json).unwrap();
        assert_eq!(back.wait_time, Duration::from_micros(1500));
        assert_eq!(back.frames_rendered, 4);
    }

    #[test]
    fn test_negative_duration_rejected() {
        let json = serde_json::json!({
            "worker_id": 0,
            "frames_rendered": 0,
            "overdue": 0,
            "wait_time": -1.0,
            "max_wait": 0.0,
            "render_time": 0.0,
            "max_render": 0.0,
            "peak_rss_kib": null
        });
        assert!(serde_json::from_value::<WorkerStats>(json).is_err());
    }

    #[test]
    fn test_peak_rss_is_reported() {
        let rss = peak_rss_kib().unwrap();
        assert!(rss > 0);
    }
}
