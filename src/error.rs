//! Error types for pixelpipe.

use thiserror::Error;

/// Main error type for the frame pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Shared segment {key:#010x} size mismatch: expected {expected} bytes, found {actual}. \
         All processes must run with identical layout options."
    )]
    SegmentSizeMismatch {
        key: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Shared segment {key:#010x} schema mismatch: {field} is {actual}, expected {expected}")]
    SchemaMismatch {
        key: u32,
        field: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error(
        "Desynchronized: worker {worker_id} cannot publish frame {frame} (mask {mask:#x}); \
         its ready bit is already set or outside ALL_READY"
    )]
    Desync { worker_id: u32, frame: u32, mask: u64 },

    #[error("Gave up waiting for {what} after {polls} polls")]
    WaitTimeout { what: &'static str, polls: u32 },

    #[error("Output backend failed to open")]
    BackendOpen,

    #[error("Output backend did not close")]
    BackendClose,

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
