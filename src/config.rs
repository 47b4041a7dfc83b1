//! Pipeline configuration.
//!
//! Every recognized option lives on [`PipelineConfig`]. The master builds it
//! from CLI flags and environment, validates it once, and hands the resolved
//! value to each worker process as JSON in [`CONFIG_ENV`].

use crate::error::{PipelineError, Result};
use crate::render::PatternKind;
use crate::shm::layout::{Layout, MAX_WORKERS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable carrying the serialized config to workers.
pub const CONFIG_ENV: &str = "PIXELPIPE_CONFIG";

/// Environment variable carrying a worker's ordinal identity.
pub const WORKER_ID_ENV: &str = "PIXELPIPE_WORKER_ID";

pub const DEFAULT_UNIVERSES: u32 = 24;
pub const DEFAULT_NODES_PER_UNIVERSE: u32 = 1136;
pub const DEFAULT_QUEUE_LEN: u32 = 4;
pub const DEFAULT_FPS: f64 = 30.0;
pub const DEFAULT_FRAMES: u32 = 300;

const MAX_QUEUE_LEN: u32 = 256;
const MIN_FPS: f64 = 0.001;
const MAX_FPS: f64 = 1000.0;
/// Upper bound on the whole segment; keeps a typo from reserving gigabytes.
const MAX_SEGMENT_BYTES: usize = 1 << 30;

/// Default worker count: one per core, leaving a core for the consumer.
pub fn default_worker_count() -> u32 {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cpus.saturating_sub(1).clamp(1, MAX_WORKERS as usize) as u32
}

/// Default segment key: fixed prefix with the universe length in the low word,
/// so `ipcs`/`/dev/shm` listings group related segments together.
pub fn default_shm_key(nodes_per_universe: u32) -> u32 {
    0xfeed_0000 | (nodes_per_universe & 0xffff)
}

/// Resolved configuration shared by the master and all workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of output universes.
    pub universes: u32,
    /// Maximum nodes per universe.
    pub nodes_per_universe: u32,
    /// Number of frame slots in the ring (QUELEN).
    pub queue_len: u32,
    /// Target frames per second.
    pub fps: f64,
    /// Worker process count; 0 renders inline on the master.
    pub workers: u32,
    /// Sequence length in frames.
    pub frames: u32,
    /// Shared segment key.
    pub shm_key: u32,
    /// Content generator run by every worker.
    pub pattern: PatternKind,
    /// Polls allowed for the backend to report open.
    pub open_retries: u32,
    /// Polls allowed for the backend to report closed.
    pub close_retries: u32,
    /// Poll interval while waiting on backend state changes.
    pub backend_poll_ms: u64,
    /// Poll interval of the consumer's readiness wait.
    pub consumer_poll_ms: u64,
    /// Polls before a waiter starts emitting progress diagnostics.
    pub progress_after: u32,
    /// Optional consumer retry ceiling; exceeding it is fatal.
    pub stall_limit: Option<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            universes: DEFAULT_UNIVERSES,
            nodes_per_universe: DEFAULT_NODES_PER_UNIVERSE,
            queue_len: DEFAULT_QUEUE_LEN,
            fps: DEFAULT_FPS,
            workers: default_worker_count(),
            frames: DEFAULT_FRAMES,
            shm_key: default_shm_key(DEFAULT_NODES_PER_UNIVERSE),
            pattern: PatternKind::default(),
            open_retries: 100,
            close_retries: 100,
            backend_poll_ms: 10,
            consumer_poll_ms: 2,
            progress_after: 25,
            stall_limit: None,
        }
    }
}

impl PipelineConfig {
    /// Check every option once; anything returned from here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));

        if self.universes == 0 {
            return invalid("universes must be at least 1".into());
        }
        if self.nodes_per_universe == 0 {
            return invalid("nodes per universe must be at least 1".into());
        }
        if !(2..=MAX_QUEUE_LEN).contains(&self.queue_len) {
            return invalid(format!(
                "queue length {} out of range 2..={}",
                self.queue_len, MAX_QUEUE_LEN
            ));
        }
        if !(MIN_FPS..=MAX_FPS).contains(&self.fps) {
            return invalid(format!(
                "fps {} out of range {}..={}",
                self.fps, MIN_FPS, MAX_FPS
            ));
        }
        if self.workers > MAX_WORKERS {
            return invalid(format!(
                "{} workers requested, at most {} ready bits are available",
                self.workers, MAX_WORKERS
            ));
        }
        if self.frames == 0 {
            return invalid("sequence length must be at least 1 frame".into());
        }
        if self.backend_poll_ms == 0 {
            return invalid("backend poll interval must be non-zero".into());
        }

        let total = self.layout().total_bytes().ok_or_else(|| {
            PipelineError::InvalidConfig("segment size overflows the address space".into())
        })?;
        if total > MAX_SEGMENT_BYTES {
            return invalid(format!(
                "segment would be {} bytes, limit is {}",
                total, MAX_SEGMENT_BYTES
            ));
        }
        Ok(())
    }

    /// Shared-memory layout implied by this config.
    pub fn layout(&self) -> Layout {
        Layout::new(
            self.queue_len,
            self.universes,
            self.nodes_per_universe,
            self.workers,
        )
    }

    /// Target interval between frames.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }

    pub fn consumer_poll(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_ms)
    }

    pub fn backend_poll(&self) -> Duration {
        Duration::from_millis(self.backend_poll_ms)
    }

    /// Serialize for a worker's environment.
    pub fn to_env_value(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate a config received through the environment.
    pub fn from_env_value(value: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(value)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> PipelineConfig {
        PipelineConfig {
            universes: 4,
            nodes_per_universe: 8,
            workers: 2,
            frames: 10,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.universes, 24);
        assert_eq!(config.queue_len, 4);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_default_worker_count_reserves_a_core() {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2) as u32;
        let expected = cpus.saturating_sub(1).clamp(1, MAX_WORKERS);
        assert_eq!(default_worker_count(), expected);
    }

    #[test]
    fn test_default_shm_key_embeds_universe_length() {
        assert_eq!(default_shm_key(1136), 0xfeed_0470);
        assert_eq!(default_shm_key(0x1_0005), 0xfeed_0005);
    }

    #[test]
    fn test_frame_interval_from_fps() {
        let config = PipelineConfig {
            fps: 30.0,
            ..small()
        };
        let interval = config.frame_interval();
        assert!(interval > Duration::from_millis(33));
        assert!(interval < Duration::from_millis(34));
    }

    #[test]
    fn test_zero_workers_is_valid() {
        let config = PipelineConfig {
            workers: 0,
            ..small()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_too_many_workers() {
        let config = PipelineConfig {
            workers: MAX_WORKERS + 1,
            ..small()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ready bits"));
    }

    #[test]
    fn test_rejects_bad_values() {
        for bad in [
            PipelineConfig {
                universes: 0,
                ..small()
            },
            PipelineConfig {
                nodes_per_universe: 0,
                ..small()
            },
            PipelineConfig {
                queue_len: 1,
                ..small()
            },
            PipelineConfig {
                fps: 0.0,
                ..small()
            },
            PipelineConfig {
                fps: f64::NAN,
                ..small()
            },
            PipelineConfig {
                fps: f64::INFINITY,
                ..small()
            },
            PipelineConfig {
                frames: 0,
                ..small()
            },
        ] {
            assert!(
                matches!(bad.validate(), Err(PipelineError::InvalidConfig(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_slowest_accepted_fps_has_an_interval() {
        let slowest = PipelineConfig {
            fps: MIN_FPS,
            ..small()
        };
        slowest.validate().unwrap();
        assert!((slowest.frame_interval().as_secs_f64() - 1000.0).abs() < 1e-6);

        let too_slow = PipelineConfig {
            fps: 1e-20,
            ..small()
        };
        let err = too_slow.validate().unwrap_err();
        assert!(err.to_string().contains("fps"));
    }

    #[test]
    fn test_rejects_oversized_segment() {
        let config = PipelineConfig {
            universes: 64,
            nodes_per_universe: 1 << 20,
            ..small()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("segment would be"));
    }

    #[test]
    fn test_env_value_roundtrip_preserves_layout() {
        let config = PipelineConfig {
            stall_limit: Some(500),
            ..small()
        };
        let value = config.to_env_value().unwrap();
        let parsed = PipelineConfig::from_env_value(&value).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.layout(), config.layout());
    }

    #[test]
    fn test_env_value_is_validated() {
        let config = PipelineConfig {
            queue_len: 0,
            ..small()
        };
        let value = serde_json::to_string(&config).unwrap();
        assert!(PipelineConfig::from_env_value(&value).is_err());
    }
}
