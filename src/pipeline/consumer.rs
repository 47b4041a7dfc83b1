//! Consumer/output loop run by the master.
//!
//! `OPENING -> STREAMING -> CLOSING -> CLOSED`. The consumer owns the output
//! clock: it presents frame `f` no earlier than `start + f * frtime`, and it
//! is the only writer of slot frame numbers.

use super::ProcessContext;
use super::report::RunOutcome;
use super::stats::ConsumerStats;
use crate::backend::{FrameRef, OutputBackend, OutputOptions};
use crate::error::{PipelineError, Result};
use crate::shm::SlotSnapshot;
use crate::shm::layout::OutputState;
use crate::waiter::{Readiness, WaitPolicy, wait_until};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumerState {
    Opening,
    Streaming,
    Closing,
    Closed,
}

/// State reported while the consumer waits for a slot to fill.
#[derive(Debug)]
#[allow(dead_code)] // read through Debug in diagnostics
struct FrameWait {
    frame: u32,
    slot: SlotSnapshot,
    all_ready: u64,
    output: OutputState,
    backend_open: bool,
}

/// What the consumer did.
#[derive(Debug, Clone)]
pub struct ConsumerResult {
    pub outcome: RunOutcome,
    pub stats: ConsumerStats,
}

pub struct Consumer<'a> {
    ctx: &'a ProcessContext,
    backend: &'a mut dyn OutputBackend,
    on_frame: Option<&'a (dyn Fn(u32) + 'a)>,
    stats: ConsumerStats,
}

impl<'a> Consumer<'a> {
    pub fn new(ctx: &'a ProcessContext, backend: &'a mut dyn OutputBackend) -> Self {
        Self {
            ctx,
            backend,
            on_frame: None,
            stats: ConsumerStats::default(),
        }
    }

    /// Called with each frame number after it has been presented.
    pub fn on_frame(mut self, f: &'a (dyn Fn(u32) + 'a)) -> Self {
        self.on_frame = Some(f);
        self
    }

    /// Drive the output through all states.
    ///
    /// Whatever happens, the shared output state ends as `Closed` so every
    /// worker unwinds.
    pub async fn run(mut self) -> Result<ConsumerResult> {
        let result = self.drive().await;
        self.ctx.queue.set_output_state(OutputState::Closed);
        if result.is_err() && self.backend.is_open() {
            self.backend.close();
        }
        Ok(ConsumerResult {
            outcome: result?,
            stats: self.stats,
        })
    }

    async fn drive(&mut self) -> Result<RunOutcome> {
        let mut outcome = RunOutcome::Completed;
        let mut state = ConsumerState::Opening;
        loop {
            debug!(?state, "Consumer state");
            state = match state {
                ConsumerState::Opening => {
                    if self.open().await? {
                        ConsumerState::Streaming
                    } else {
                        outcome = self.halt_reason().unwrap_or(RunOutcome::Interrupted);
                        ConsumerState::Closing
                    }
                }
                ConsumerState::Streaming => {
                    outcome = self.stream().await?;
                    // Release workers before the possibly slow close.
                    self.ctx.queue.set_output_state(OutputState::Closed);
                    ConsumerState::Closing
                }
                ConsumerState::Closing => {
                    self.close().await?;
                    ConsumerState::Closed
                }
                ConsumerState::Closed => return Ok(outcome),
            };
        }
    }

    /// Why streaming must stop, if it must.
    fn halt_reason(&self) -> Option<RunOutcome> {
        let cancel = &self.ctx.cancel;
        if cancel.is_interrupted() {
            Some(RunOutcome::Interrupted)
        } else if cancel.worker_failed() {
            Some(RunOutcome::WorkerFailed)
        } else if !self.backend.is_open() {
            Some(RunOutcome::BackendClosed)
        } else {
            None
        }
    }

    /// Open the backend and wait for it to report open. Returns false if the
    /// run was cancelled first.
    async fn open(&mut self) -> Result<bool> {
        let config = &self.ctx.config;
        let opts = OutputOptions {
            fps: config.fps,
            universes: config.universes,
            nodes_per_universe: config.nodes_per_universe,
        };
        if !self.backend.open(&opts) {
            return Err(PipelineError::BackendOpen);
        }

        let policy = WaitPolicy::new(config.backend_poll(), config.progress_after)
            .with_max_polls(Some(config.open_retries));
        let backend = &*self.backend;
        let cancel = &self.ctx.cancel;
        let waited = wait_until("backend open", &policy, || {
            if cancel.is_cancelled() {
                Readiness::Closed
            } else if backend.is_open() {
                Readiness::Ready
            } else {
                Readiness::Pending(OutputState::Opening)
            }
        })
        .await?;

        if waited.is_ready() {
            self.ctx.queue.set_output_state(OutputState::Open);
            info!(
                backend = self.backend.name(),
                frtime_us = self.backend.frtime().as_micros() as u64,
                "Output open"
            );
        }
        Ok(waited.is_ready())
    }

    async fn stream(&mut self) -> Result<RunOutcome> {
        let ctx = self.ctx;
        let queue = &ctx.queue;
        let config = &ctx.config;
        let all_ready = queue.all_ready();
        let frtime = match self.backend.frtime() {
            d if d.is_zero() => config.frame_interval(),
            d => d,
        };
        let policy = WaitPolicy::new(config.consumer_poll(), config.progress_after)
            .with_max_polls(config.stall_limit);
        let start = Instant::now();

        for frame in 0..config.frames {
            if let Some(outcome) = self.halt_reason() {
                return Ok(self.halted(outcome, frame));
            }

            let slot = queue.slot_of(frame);
            let backend = &*self.backend;
            let cancel = &ctx.cancel;
            let waited = wait_until("frame ready", &policy, || {
                let backend_open = backend.is_open();
                if !backend_open || cancel.is_cancelled() {
                    return Readiness::Closed;
                }
                let snapshot = queue.snapshot(slot);
                if snapshot.ready_mask == all_ready {
                    Readiness::Ready
                } else {
                    Readiness::Pending(FrameWait {
                        frame,
                        slot: snapshot,
                        all_ready,
                        output: queue.output_state(),
                        backend_open,
                    })
                }
            })
            .await?;
            self.stats.record_wait(waited.elapsed, waited.polls);
            if waited.diagnostics > 0 {
                debug!(
                    frame,
                    polls = waited.polls,
                    waited_ms = waited.elapsed.as_millis() as u64,
                    "Frame was slow to fill"
                );
            }
            if !waited.is_ready() {
                let outcome = self.halt_reason().unwrap_or(RunOutcome::BackendClosed);
                return Ok(self.halted(outcome, frame));
            }

            let due = start + frtime * frame;
            let now = Instant::now();
            if now < due {
                tokio::time::sleep_until(due).await;
            } else if now > due + frtime {
                self.stats.late_frames += 1;
                debug!(
                    frame,
                    behind_ms = (now - due).as_millis() as u64,
                    "Frame late"
                );
            }

            // Safety: the mask reads ALL_READY, so no worker touches this slot
            // until it is recycled below.
            let pixels = unsafe { queue.slot_pixels(slot) };
            let frame_ref = FrameRef {
                frame,
                universes: config.universes,
                nodes_per_universe: config.nodes_per_universe,
                pixels,
            };
            let write_started = std::time::Instant::now();
            let delivered = self.backend.write(&frame_ref);
            self.stats.write_time += write_started.elapsed();
            if !delivered {
                warn!(frame, "Output rejected frame");
                return Ok(self.halted(RunOutcome::BackendClosed, frame));
            }

            queue.recycle(slot);
            self.stats.frames_presented += 1;
            if let Some(f) = self.on_frame {
                f(frame);
            }
        }

        info!(
            frames = self.stats.frames_presented,
            late = self.stats.late_frames,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sequence complete"
        );
        Ok(RunOutcome::Completed)
    }

    fn halted(&self, outcome: RunOutcome, frame: u32) -> RunOutcome {
        warn!(%outcome, frame, presented = self.stats.frames_presented, "Streaming halted");
        outcome
    }

    /// Close the backend and wait for it to report closed.
    async fn close(&mut self) -> Result<()> {
        let config = &self.ctx.config;
        self.backend.close();
        let policy = WaitPolicy::new(config.backend_poll(), config.progress_after)
            .with_max_polls(Some(config.close_retries));
        let backend = &*self.backend;
        wait_until("backend close", &policy, || {
            if backend.is_open() {
                Readiness::Pending(OutputState::Open)
            } else {
                Readiness::Ready
            }
        })
        .await?;
        debug!(numfr = self.backend.numfr(), "Output closed");
        Ok(())
    }
}

/// How long the consumer may wait for workers to notice a closed output.
pub fn unwind_timeout(frame_interval: Duration) -> Duration {
    (frame_interval * 2).max(Duration::from_secs(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_diagnostic_shows_output_state() {
        let wait = FrameWait {
            frame: 9,
            slot: SlotSnapshot {
                slot: 1,
                frame_number: 9,
                ready_mask: 0b01,
            },
            all_ready: 0b11,
            output: OutputState::Open,
            backend_open: true,
        };
        let text = format!("{:?}", wait);
        assert!(text.contains("output: Open"));
        assert!(text.contains("backend_open: true"));
        assert!(text.contains("ready_mask: 1"));
    }

    #[test]
    fn test_unwind_timeout_has_a_floor() {
        assert_eq!(unwind_timeout(Duration::from_millis(33)), Duration::from_secs(2));
        assert_eq!(unwind_timeout(Duration::from_secs(5)), Duration::from_secs(10));
    }
}
