//! Assignment of universes to workers.

use crate::error::{PipelineError, Result};
use crate::shm::layout::{Layout, MAX_WORKERS};
use serde::Serialize;
use std::ops::Range;

/// The contiguous universe range one worker renders, and the bit it publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerPartition {
    pub worker_id: u32,
    pub universe_begin: u32,
    pub universe_end: u32,
    pub ready_bit: u64,
}

impl WorkerPartition {
    pub fn universes(&self) -> Range<u32> {
        self.universe_begin..self.universe_end
    }

    pub fn is_empty(&self) -> bool {
        self.universe_begin == self.universe_end
    }

    pub fn len(&self) -> u32 {
        self.universe_end - self.universe_begin
    }
}

/// Universe range for `worker_id` out of `worker_count`.
///
/// Chunks are `ceil(total / count)` wide and clamped at `total`, so trailing
/// workers may get an empty range when there are more workers than universes.
/// A `worker_count` of 0 means inline rendering: worker 0 covers everything
/// with a single synthetic ready bit.
pub fn partition(
    total_universes: u32,
    worker_count: u32,
    worker_id: u32,
) -> Result<WorkerPartition> {
    if worker_count > MAX_WORKERS {
        return Err(PipelineError::InvalidConfig(format!(
            "{} workers exceed the {}-bit ready mask",
            worker_count, MAX_WORKERS
        )));
    }
    let slots = worker_count.max(1);
    if worker_id >= slots {
        return Err(PipelineError::InvalidConfig(format!(
            "worker id {} out of range for {} workers",
            worker_id, worker_count
        )));
    }

    let chunk = total_universes.div_ceil(slots);
    let begin = worker_id.saturating_mul(chunk).min(total_universes);
    let end = begin.saturating_add(chunk).min(total_universes);

    Ok(WorkerPartition {
        worker_id,
        universe_begin: begin,
        universe_end: end,
        ready_bit: Layout::ready_bit(worker_id),
    })
}

/// Every worker's partition, in worker order.
pub fn partition_table(total_universes: u32, worker_count: u32) -> Result<Vec<WorkerPartition>> {
    (0..worker_count.max(1))
        .map(|id| partition(total_universes, worker_count, id))
        .collect()
}
