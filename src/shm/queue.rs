//! Circular frame queue over a [`SharedSegment`].
//!
//! Ownership rules for the mapped memory:
//! - `frame_number` of each slot is written only by the consumer.
//! - `ready_mask` is OR-ed by workers and cleared only by the consumer.
//! - A worker's universe span in a slot is written only by that worker, and
//!   only while the slot's `frame_number` equals the frame it produces.
//! - The consumer reads a slot's pixels only after observing `ALL_READY`.

use super::SharedSegment;
use super::layout::{
    Layout, OutputState, PIXEL_BYTES, SCHEMA_VERSION, SEGMENT_MAGIC, SegmentHeader, SlotControl,
};
use crate::error::{PipelineError, Result};
use serde::Serialize;
use std::ops::Range;
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

/// Point-in-time view of one slot's control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub slot: usize,
    pub frame_number: u32,
    pub ready_mask: u64,
}

pub struct FrameQueue {
    segment: SharedSegment,
    layout: Layout,
}

impl FrameQueue {
    /// Create the segment for `layout` and initialize its header and slots.
    ///
    /// Slot `i` starts armed for frame `i` with an empty ready mask, and the
    /// output state starts as `Opening`.
    pub fn create(key: u32, layout: Layout, frames: u32) -> Result<Self> {
        let size = Self::segment_size(&layout)?;
        let segment = SharedSegment::create_or_attach(key, size, true)?;
        let queue = Self { segment, layout };

        let header = queue.header();
        header.version.store(SCHEMA_VERSION, Ordering::Relaxed);
        header.queue_len.store(layout.queue_len, Ordering::Relaxed);
        header.universes.store(layout.universes, Ordering::Relaxed);
        header
            .nodes_per_universe
            .store(layout.nodes_per_universe, Ordering::Relaxed);
        header
            .worker_count
            .store(layout.worker_count, Ordering::Relaxed);
        header.frames.store(frames, Ordering::Relaxed);
        header
            .output_state
            .store(OutputState::Opening as u32, Ordering::Relaxed);
        header.all_ready.store(layout.all_ready(), Ordering::Relaxed);
        header.total_bytes.store(size as u64, Ordering::Relaxed);

        for slot in 0..layout.queue_len as usize {
            let control = queue.control(slot);
            control.ready_mask.store(0, Ordering::Relaxed);
            control.frame_number.store(slot as u32, Ordering::Relaxed);
        }

        // Magic last: attachers that see it see a fully initialized header.
        header.magic.store(SEGMENT_MAGIC, Ordering::Release);

        debug!(
            segment = queue.segment.name(),
            bytes = queue.segment.len(),
            queue_len = layout.queue_len,
            all_ready = format_args!("{:#x}", layout.all_ready()),
            "Created frame queue"
        );
        Ok(queue)
    }

    /// Attach to a queue created by the master and verify its schema matches
    /// the layout this process derived from its own config.
    pub fn attach(key: u32, layout: Layout) -> Result<Self> {
        let size = Self::segment_size(&layout)?;
        let segment = SharedSegment::create_or_attach(key, size, false)?;
        let queue = Self { segment, layout };
        queue.verify_header(size)?;
        debug!(
            segment = queue.segment.name(),
            bytes = queue.segment.len(),
            frames = queue.frames(),
            "Attached frame queue"
        );
        Ok(queue)
    }

    fn segment_size(layout: &Layout) -> Result<usize> {
        layout.total_bytes().ok_or_else(|| {
            PipelineError::InvalidConfig("segment size overflows the address space".into())
        })
    }

    fn verify_header(&self, size: usize) -> Result<()> {
        let header = self.header();
        let key = self.segment.key();
        let check = |field: &'static str, expected: u64, actual: u64| {
            if expected == actual {
                Ok(())
            } else {
                Err(PipelineError::SchemaMismatch {
                    key,
                    field,
                    expected,
                    actual,
                })
            }
        };

        check(
            "magic",
            SEGMENT_MAGIC as u64,
            header.magic.load(Ordering::Acquire) as u64,
        )?;
        check(
            "version",
            SCHEMA_VERSION as u64,
            header.version.load(Ordering::Relaxed) as u64,
        )?;
        check(
            "queue_len",
            self.layout.queue_len as u64,
            header.queue_len.load(Ordering::Relaxed) as u64,
        )?;
        check(
            "universes",
            self.layout.universes as u64,
            header.universes.load(Ordering::Relaxed) as u64,
        )?;
        check(
            "nodes_per_universe",
            self.layout.nodes_per_universe as u64,
            header.nodes_per_universe.load(Ordering::Relaxed) as u64,
        )?;
        check(
            "worker_count",
            self.layout.worker_count as u64,
            header.worker_count.load(Ordering::Relaxed) as u64,
        )?;
        check(
            "all_ready",
            self.layout.all_ready(),
            header.all_ready.load(Ordering::Relaxed),
        )?;
        check(
            "total_bytes",
            size as u64,
            header.total_bytes.load(Ordering::Relaxed),
        )
    }

    pub fn key(&self) -> u32 {
        self.segment.key()
    }

    /// Unmap (and, for the creator, remove) the segment, reporting failures.
    pub fn detach(self) -> Result<()> {
        self.segment.detach()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn queue_len(&self) -> u32 {
        self.layout.queue_len
    }

    pub fn all_ready(&self) -> u64 {
        self.layout.all_ready()
    }

    /// Sequence length recorded by the creator.
    pub fn frames(&self) -> u32 {
        self.header().frames.load(Ordering::Relaxed)
    }

    fn header(&self) -> &SegmentHeader {
        // Safety: the mapping is page aligned, at least `HEADER_BYTES` long and
        // lives as long as `self`. Every field is atomic.
        unsafe { &*(self.segment.as_ptr() as *const SegmentHeader) }
    }

    fn control(&self, slot: usize) -> &SlotControl {
        assert!(slot < self.layout.queue_len as usize, "slot {} out of range", slot);
        // Safety: bounds checked above; control records are 64-byte aligned
        // and entirely atomic.
        unsafe {
            let base = self.segment.as_ptr().add(self.layout.control_offset());
            &*(base as *const SlotControl).add(slot)
        }
    }

    fn pixel_base(&self, slot: usize) -> *mut u32 {
        assert!(slot < self.layout.queue_len as usize, "slot {} out of range", slot);
        let offset = self.layout.pixel_offset() + slot * self.layout.slot_pixels() * PIXEL_BYTES;
        // Safety: in bounds of the mapping because total_bytes covers every slot.
        unsafe { self.segment.as_ptr().add(offset) as *mut u32 }
    }

    pub fn output_state(&self) -> OutputState {
        OutputState::from_raw(self.header().output_state.load(Ordering::Acquire))
    }

    pub fn set_output_state(&self, state: OutputState) {
        trace!(?state, "Output state changed");
        self.header()
            .output_state
            .store(state as u32, Ordering::Release);
    }

    /// True once the consumer has declared the output closed.
    pub fn is_closed(&self) -> bool {
        self.output_state() == OutputState::Closed
    }

    /// Slot addressed by a frame number.
    pub fn slot_of(&self, frame: u32) -> usize {
        self.layout.slot_of(frame)
    }

    pub fn slot_frame(&self, slot: usize) -> u32 {
        self.control(slot).frame_number.load(Ordering::Acquire)
    }

    pub fn ready_mask(&self, slot: usize) -> u64 {
        self.control(slot).ready_mask.load(Ordering::Acquire)
    }

    pub fn snapshot(&self, slot: usize) -> SlotSnapshot {
        SlotSnapshot {
            slot,
            frame_number: self.slot_frame(slot),
            ready_mask: self.ready_mask(slot),
        }
    }

    /// Mark `worker_id`'s part of `frame` as rendered.
    ///
    /// Returns the mask after publishing. A bit outside `ALL_READY` is
    /// rejected without touching the slot. A bit that was already set means
    /// the slot was not recycled between two production cycles. Both are
    /// reported as [`PipelineError::Desync`].
    pub fn publish(&self, slot: usize, worker_id: u32, bit: u64, frame: u32) -> Result<u64> {
        let control = self.control(slot);
        if bit == 0 || bit & !self.all_ready() != 0 {
            return Err(PipelineError::Desync {
                worker_id,
                frame,
                mask: control.ready_mask.load(Ordering::Acquire),
            });
        }
        let previous = control.ready_mask.fetch_or(bit, Ordering::AcqRel);
        if previous & bit != 0 {
            return Err(PipelineError::Desync {
                worker_id,
                frame,
                mask: previous,
            });
        }
        let mask = previous | bit;
        trace!(worker_id, frame, slot, mask = format_args!("{:#x}", mask), "Published");
        Ok(mask)
    }

    /// Re-arm a consumed slot for the frame `queue_len` ahead.
    ///
    /// The mask is cleared before the frame number advances, so a worker that
    /// observes its new target also observes the empty mask.
    pub fn recycle(&self, slot: usize) -> u32 {
        let control = self.control(slot);
        control.ready_mask.store(0, Ordering::Release);
        let next = control
            .frame_number
            .load(Ordering::Relaxed)
            .wrapping_add(self.layout.queue_len);
        control.frame_number.store(next, Ordering::Release);
        next
    }

    /// Clear every ready mask. Only valid once no producer is running.
    pub fn quiesce(&self) {
        for slot in 0..self.layout.queue_len as usize {
            self.control(slot).ready_mask.store(0, Ordering::Release);
        }
    }

    /// Writable view of a universe span of one slot.
    ///
    /// # Safety
    ///
    /// The caller must be the only writer of `span` in `slot` and nobody may
    /// read it concurrently: the slot's `frame_number` equals the caller's
    /// target frame and its ready bit is not yet published.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn partition_pixels_mut(&self, slot: usize, span: Range<usize>) -> &mut [u32] {
        assert!(span.start <= span.end && span.end <= self.layout.slot_pixels());
        unsafe {
            std::slice::from_raw_parts_mut(self.pixel_base(slot).add(span.start), span.len())
        }
    }

    /// Read-only view of a universe span of one slot.
    ///
    /// # Safety
    ///
    /// No process may write `span` of `slot` while the returned slice lives.
    pub unsafe fn partition_pixels(&self, slot: usize, span: Range<usize>) -> &[u32] {
        assert!(span.start <= span.end && span.end <= self.layout.slot_pixels());
        unsafe { std::slice::from_raw_parts(self.pixel_base(slot).add(span.start), span.len()) }
    }

    /// Read-only view of a whole slot.
    ///
    /// # Safety
    ///
    /// The slot's mask must read `ALL_READY` and stay so while the slice
    /// lives, which holds for the consumer until it recycles the slot.
    pub unsafe fn slot_pixels(&self, slot: usize) -> &[u32] {
        unsafe { std::slice::from_raw_parts(self.pixel_base(slot), self.layout.slot_pixels()) }
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("segment", &self.segment)
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_keys::unique_key;
    use super::*;

    fn layout(workers: u32) -> Layout {
        Layout::new(4, 6, 5, workers)
    }

    #[test]
    fn test_create_arms_each_slot_for_its_index() {
        let queue = FrameQueue::create(unique_key(), layout(3), 10).unwrap();
        for slot in 0..4 {
            let snap = queue.snapshot(slot);
            assert_eq!(snap.frame_number, slot as u32);
            assert_eq!(snap.ready_mask, 0);
        }
        assert_eq!(queue.output_state(), OutputState::Opening);
        assert_eq!(queue.frames(), 10);
        assert_eq!(queue.all_ready(), 0b111);
    }

    #[test]
    fn test_attach_sees_owner_state() {
        let key = unique_key();
        let owner = FrameQueue::create(key, layout(2), 10).unwrap();
        let worker = FrameQueue::attach(key, layout(2)).unwrap();

        owner.set_output_state(OutputState::Open);
        assert_eq!(worker.output_state(), OutputState::Open);

        worker.publish(1, 0, 0b01, 1).unwrap();
        assert_eq!(owner.ready_mask(1), 0b01);

        owner.set_output_state(OutputState::Closed);
        assert!(worker.is_closed());
    }

    #[test]
    fn test_attach_rejects_different_worker_count() {
        let key = unique_key();
        let _owner = FrameQueue::create(key, layout(2), 10).unwrap();
        // Same byte length, different schema.
        let err = FrameQueue::attach(key, layout(3)).unwrap_err();
        match err {
            PipelineError::SchemaMismatch {
                field,
                expected,
                actual,
                ..
            } => {
                assert_eq!(field, "worker_count");
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
            }
            other => panic!("expected schema mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_attach_rejects_different_geometry() {
        let key = unique_key();
        let _owner = FrameQueue::create(key, layout(2), 10).unwrap();
        let err = FrameQueue::attach(key, Layout::new(4, 7, 5, 2)).unwrap_err();
        assert!(matches!(err, PipelineError::SegmentSizeMismatch { .. }));
    }

    #[test]
    fn test_publish_accumulates_until_all_ready() {
        let queue = FrameQueue::create(unique_key(), layout(3), 10).unwrap();
        assert_eq!(queue.publish(0, 1, 0b010, 0).unwrap(), 0b010);
        assert_eq!(queue.publish(0, 0, 0b001, 0).unwrap(), 0b011);
        assert_eq!(queue.publish(0, 2, 0b100, 0).unwrap(), queue.all_ready());
    }

    #[test]
    fn test_double_publish_is_desync() {
        let queue = FrameQueue::create(unique_key(), layout(3), 10).unwrap();
        queue.publish(2, 1, 0b010, 2).unwrap();
        let err = queue.publish(2, 1, 0b010, 6).unwrap_err();
        match err {
            PipelineError::Desync {
                worker_id,
                frame,
                mask,
            } => {
                assert_eq!(worker_id, 1);
                assert_eq!(frame, 6);
                assert_eq!(mask, 0b010);
            }
            other => panic!("expected desync, got {:?}", other),
        }
    }

    #[test]
    fn test_publish_outside_all_ready_is_desync() {
        let queue = FrameQueue::create(unique_key(), layout(2), 10).unwrap();
        queue.publish(0, 0, 0b01, 0).unwrap();
        let err = queue.publish(0, 5, 1 << 5, 0).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Desync {
                worker_id: 5,
                mask: 0b01,
                ..
            }
        ));
        // The rejected bit never reaches the shared mask.
        assert_eq!(queue.ready_mask(0), 0b01);
        assert_eq!(queue.publish(0, 1, 0b10, 0).unwrap(), queue.all_ready());
    }

    #[test]
    fn test_recycle_clears_mask_and_advances_by_queue_len() {
        let queue = FrameQueue::create(unique_key(), layout(2), 10).unwrap();
        queue.publish(3, 0, 0b01, 3).unwrap();
        queue.publish(3, 1, 0b10, 3).unwrap();

        assert_eq!(queue.recycle(3), 7);
        assert_eq!(queue.snapshot(3), SlotSnapshot {
            slot: 3,
            frame_number: 7,
            ready_mask: 0,
        });
        // Other slots untouched.
        assert_eq!(queue.slot_frame(2), 2);
        // The same worker may publish again for the new cycle.
        queue.publish(3, 0, 0b01, 7).unwrap();
    }

    #[test]
    fn test_quiesce_clears_partial_masks() {
        let queue = FrameQueue::create(unique_key(), layout(3), 10).unwrap();
        queue.publish(0, 0, 0b001, 0).unwrap();
        queue.publish(1, 2, 0b100, 1).unwrap();
        queue.quiesce();
        for slot in 0..4 {
            assert_eq!(queue.ready_mask(slot), 0);
        }
    }

    #[test]
    fn test_partition_views_are_disjoint_and_shared() {
        let key = unique_key();
        let owner = FrameQueue::create(key, layout(2), 10).unwrap();
        let worker = FrameQueue::attach(key, layout(2)).unwrap();
        let span_a = owner.layout().universe_span(&(0..3));
        let span_b = owner.layout().universe_span(&(3..6));

        unsafe {
            owner.partition_pixels_mut(1, span_a.clone()).fill(0xff00_0000);
            worker.partition_pixels_mut(1, span_b.clone()).fill(0xffff_ffff);

            let slot = owner.slot_pixels(1);
            assert!(slot[span_a].iter().all(|&p| p == 0xff00_0000));
            assert!(slot[span_b].iter().all(|&p| p == 0xffff_ffff));
            // Neighboring slots untouched.
            assert!(owner.slot_pixels(0).iter().all(|&p| p == 0));
            assert!(owner.slot_pixels(2).iter().all(|&p| p == 0));
        }
    }
}
