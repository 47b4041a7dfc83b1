//! Worker render loop.
//!
//! ```text
//! WAIT_SLOT --slot armed--> RENDER --> PUBLISH --> WAIT_SLOT
//!     |                        |
//!     +------closed------------+-----------------> DONE
//! ```
//!
//! The worker walks frames in order. Frame `f` lives in slot `f % queue_len`,
//! so each slot's target advances by `queue_len` per cycle and a worker can be
//! at most `queue_len` frames ahead of the consumer.

use super::ProcessContext;
use super::stats::WorkerStats;
use crate::error::Result;
use crate::partition::WorkerPartition;
use crate::render::{Pattern, RenderTarget};
use crate::shm::FrameQueue;
use crate::shm::layout::OutputState;
use crate::waiter::{Readiness, WaitPolicy, wait_until};
use std::ops::Range;
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    WaitSlot,
    Render,
    Publish,
    Done,
}

/// State reported while a worker waits for its slot.
#[derive(Debug)]
#[allow(dead_code)] // read through Debug in diagnostics
struct SlotWait {
    output: OutputState,
    want_frame: u32,
    slot_frame: u32,
    ready_mask: u64,
}

fn slot_readiness(queue: &FrameQueue, slot: usize, frame: u32) -> Readiness<SlotWait> {
    if queue.is_closed() {
        return Readiness::Closed;
    }
    let slot_frame = queue.slot_frame(slot);
    if slot_frame == frame {
        Readiness::Ready
    } else {
        Readiness::Pending(SlotWait {
            output: queue.output_state(),
            want_frame: frame,
            slot_frame,
            ready_mask: queue.ready_mask(slot),
        })
    }
}

type ProgressFn<'a> = Box<dyn FnMut(&WorkerStats) + 'a>;

pub struct WorkerLoop<'a> {
    ctx: &'a ProcessContext,
    partition: WorkerPartition,
    pattern: Box<dyn Pattern>,
    stats: WorkerStats,
    progress: Option<(u32, ProgressFn<'a>)>,
}

impl<'a> WorkerLoop<'a> {
    pub fn new(
        ctx: &'a ProcessContext,
        partition: WorkerPartition,
        pattern: Box<dyn Pattern>,
    ) -> Self {
        let stats = WorkerStats::new(partition.worker_id);
        Self {
            ctx,
            partition,
            pattern,
            stats,
            progress: None,
        }
    }

    /// Call `f` after every `every` published frames.
    pub fn on_progress(mut self, every: u32, f: impl FnMut(&WorkerStats) + 'a) -> Self {
        self.progress = Some((every.max(1), Box::new(f)));
        self
    }

    /// Render frames until the sequence ends or the output closes.
    ///
    /// Returns an error only for a synchronization violation.
    pub async fn run(mut self) -> Result<WorkerStats> {
        let ctx = self.ctx;
        let queue = &ctx.queue;
        let config = &ctx.config;
        let budget = config.frame_interval();
        let policy = WaitPolicy::new(budget, config.progress_after);
        let span = queue.layout().universe_span(&self.partition.universes());
        let worker_id = self.partition.worker_id;

        debug!(
            worker_id,
            universes = ?self.partition.universes(),
            pattern = self.pattern.name(),
            frames = config.frames,
            "Worker starting"
        );

        if self.partition.is_empty() {
            debug!(worker_id, "No universes assigned, publishing empty partitions");
        }

        let mut frame = 0u32;
        let mut state = if config.frames == 0 {
            WorkerState::Done
        } else {
            WorkerState::WaitSlot
        };

        loop {
            state = match state {
                WorkerState::WaitSlot => {
                    let slot = queue.slot_of(frame);
                    let waited =
                        wait_until("slot", &policy, || slot_readiness(queue, slot, frame)).await?;
                    self.stats.record_wait(waited.elapsed);
                    if waited.is_ready() {
                        WorkerState::Render
                    } else {
                        debug!(worker_id, frame, "Output closed while waiting for slot");
                        WorkerState::Done
                    }
                }
                WorkerState::Render => {
                    let started = Instant::now();
                    self.render(frame, span.clone());
                    let took = started.elapsed();
                    if self.stats.record_render(took, budget) {
                        debug!(
                            worker_id,
                            frame,
                            render_ms = took.as_millis() as u64,
                            budget_ms = budget.as_millis() as u64,
                            "Render overdue"
                        );
                    }
                    if queue.is_closed() {
                        WorkerState::Done
                    } else {
                        WorkerState::Publish
                    }
                }
                WorkerState::Publish => {
                    let slot = queue.slot_of(frame);
                    queue.publish(slot, worker_id, self.partition.ready_bit, frame)?;
                    self.stats.frames_rendered += 1;
                    trace!(worker_id, frame, slot, "Frame published");

                    if let Some((every, f)) = self.progress.as_mut() {
                        if self.stats.frames_rendered % *every == 0 {
                            f(&self.stats);
                        }
                    }

                    frame += 1;
                    if frame >= config.frames {
                        WorkerState::Done
                    } else {
                        WorkerState::WaitSlot
                    }
                }
                WorkerState::Done => break,
            };
        }

        debug!(
            worker_id,
            frames = self.stats.frames_rendered,
            overdue = self.stats.overdue,
            "Worker done"
        );
        Ok(self.stats)
    }

    fn render(&mut self, frame: u32, span: Range<usize>) {
        let queue = &self.ctx.queue;
        let slot = queue.slot_of(frame);
        // Safety: the slot is armed for `frame` and our bit is not yet
        // published, so nobody else reads or writes this span of it.
        let pixels = unsafe { queue.partition_pixels_mut(slot, span.clone()) };
        // Safety: only this worker writes this span of any slot, and it will
        // not revisit the previous frame's slot until after this frame.
        let previous = match frame.checked_sub(1) {
            Some(prev) => Some(unsafe { queue.partition_pixels(queue.slot_of(prev), span) }),
            None => None,
        };

        let mut target = RenderTarget {
            frame,
            universes: self.partition.universes(),
            nodes: queue.layout().nodes_per_universe,
            pixels,
            previous,
        };
        self.pattern.render(&mut target);
    }
}
