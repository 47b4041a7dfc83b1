//! Typed, versioned schema of the shared frame segment.
//!
//! ```text
//! offset 0            SegmentHeader                    (64 bytes)
//! offset 64           SlotControl[queue_len]           (64 bytes each)
//! pixel_offset        u32 pixels[queue_len][universes][nodes_per_universe]
//! ```
//!
//! Pixels are slot-major and universe-major within a slot, so the universes
//! owned by one worker form a single contiguous run inside each slot.

use serde::Serialize;
use std::mem::size_of;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Identifies a pixelpipe segment ("PXPQ").
pub const SEGMENT_MAGIC: u32 = 0x5058_5051;

/// Bumped whenever the header or slot records change shape.
pub const SCHEMA_VERSION: u32 = 1;

/// One ready bit per worker in a `u64` mask.
pub const MAX_WORKERS: u32 = 64;

/// Bytes per ARGB32 pixel.
pub const PIXEL_BYTES: usize = 4;

/// Control block at the start of the segment. Written by the owner before any
/// worker is started; only `output_state` changes afterwards.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct SegmentHeader {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub queue_len: AtomicU32,
    pub universes: AtomicU32,
    pub nodes_per_universe: AtomicU32,
    pub worker_count: AtomicU32,
    pub frames: AtomicU32,
    pub output_state: AtomicU32,
    pub all_ready: AtomicU64,
    pub total_bytes: AtomicU64,
}

/// Per-slot control record.
///
/// `frame_number` has a single writer (the consumer). `ready_mask` is only
/// ever OR-ed by workers and reset to zero by the consumer.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct SlotControl {
    pub frame_number: AtomicU32,
    _reserved: u32,
    pub ready_mask: AtomicU64,
}

const _: () = assert!(size_of::<SegmentHeader>() == 64);
const _: () = assert!(size_of::<SlotControl>() == 64);

/// Backend status as seen by every process attached to the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum OutputState {
    Opening = 0,
    Open = 1,
    Closed = 2,
}

impl OutputState {
    /// Decode the raw header value; anything unknown is treated as closed.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Opening,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// Geometry of one segment. Every attaching process derives the same value
/// from its config and the attach path checks it against the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Layout {
    pub queue_len: u32,
    pub universes: u32,
    pub nodes_per_universe: u32,
    pub worker_count: u32,
}

impl Layout {
    pub const HEADER_BYTES: usize = size_of::<SegmentHeader>();
    pub const CONTROL_BYTES: usize = size_of::<SlotControl>();

    pub fn new(queue_len: u32, universes: u32, nodes_per_universe: u32, worker_count: u32) -> Self {
        Self {
            queue_len,
            universes,
            nodes_per_universe,
            worker_count,
        }
    }

    /// Mask with every worker's bit set. Inline rendering (no workers) uses a
    /// single synthetic bit.
    pub fn all_ready(&self) -> u64 {
        match self.worker_count {
            0 => 1,
            n if n >= 64 => u64::MAX,
            n => (1u64 << n) - 1,
        }
    }

    /// Ready bit for a worker ordinal.
    pub fn ready_bit(worker_id: u32) -> u64 {
        1u64 << worker_id
    }

    /// Slot addressed by a frame number.
    pub fn slot_of(&self, frame: u32) -> usize {
        (frame % self.queue_len) as usize
    }

    pub fn control_offset(&self) -> usize {
        Self::HEADER_BYTES
    }

    pub fn control_bytes(&self) -> usize {
        self.queue_len as usize * Self::CONTROL_BYTES
    }

    /// Start of the pixel area; a multiple of 64 by construction.
    pub fn pixel_offset(&self) -> usize {
        self.control_offset() + self.control_bytes()
    }

    /// Pixels (not bytes) in one slot.
    pub fn slot_pixels(&self) -> usize {
        self.universes as usize * self.nodes_per_universe as usize
    }

    pub fn slot_bytes(&self) -> Option<usize> {
        self.slot_pixels().checked_mul(PIXEL_BYTES)
    }

    pub fn pixel_bytes(&self) -> Option<usize> {
        self.slot_bytes()?.checked_mul(self.queue_len as usize)
    }

    /// Total segment length, or `None` if it does not fit in `usize`.
    pub fn total_bytes(&self) -> Option<usize> {
        self.pixel_offset().checked_add(self.pixel_bytes()?)
    }

    /// Element range within a slot covered by a universe range.
    pub fn universe_span(&self, universes: &Range<u32>) -> Range<usize> {
        let nodes = self.nodes_per_universe as usize;
        universes.start as usize * nodes..universes.end as usize * nodes
    }
}
