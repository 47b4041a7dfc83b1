//! Output stage consumed by the master.
//!
//! The pipeline depends only on the narrow [`OutputBackend`] contract: open,
//! an `is_open` flag, frame writes, close, a consumed-frame counter, the
//! target frame interval and timing counters. Any failure inside a backend
//! surfaces as `is_open() == false`.

mod dump;
mod headless;

pub use dump::DumpBackend;
pub use headless::HeadlessBackend;

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Parameters handed to [`OutputBackend::open`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutputOptions {
    pub fps: f64,
    pub universes: u32,
    pub nodes_per_universe: u32,
}

impl OutputOptions {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

/// One complete frame, borrowed from a ready slot.
#[derive(Debug, Clone, Copy)]
pub struct FrameRef<'a> {
    pub frame: u32,
    pub universes: u32,
    pub nodes_per_universe: u32,
    /// Universe-major ARGB32 pixels.
    pub pixels: &'a [u32],
}

impl<'a> FrameRef<'a> {
    pub fn universe(&self, universe: u32) -> &'a [u32] {
        let nodes = self.nodes_per_universe as usize;
        let start = universe as usize * nodes;
        &self.pixels[start..start + nodes]
    }
}

/// Timing counters kept by a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerfStats {
    /// Frames accepted.
    pub frames: u32,
    /// Time spent inside `write`.
    #[serde(with = "crate::pipeline::stats::duration_ms")]
    pub write_time: Duration,
    #[serde(with = "crate::pipeline::stats::duration_ms")]
    pub max_write_time: Duration,
    pub bytes: u64,
    /// Rolling FNV-1a digest of every accepted frame's pixels.
    pub digest: u64,
}

impl PerfStats {
    pub fn record(&mut self, frame: &FrameRef<'_>, took: Duration) {
        self.frames += 1;
        self.write_time += took;
        self.max_write_time = self.max_write_time.max(took);
        self.bytes += (frame.pixels.len() * 4) as u64;
    }
}

/// Contract of an external output stage.
pub trait OutputBackend {
    fn name(&self) -> &'static str;

    /// Start the output. Returns false if the device could not be opened.
    fn open(&mut self, opts: &OutputOptions) -> bool;

    fn is_open(&self) -> bool;

    /// Present one frame. Returns false, and reports closed from then on, if
    /// the frame could not be delivered.
    fn write(&mut self, frame: &FrameRef<'_>) -> bool;

    fn close(&mut self);

    /// Frames consumed so far.
    fn numfr(&self) -> u32;

    /// Target inter-frame interval.
    fn frtime(&self) -> Duration;

    fn perf_stats(&self) -> PerfStats;
}

/// Which output the master drives, chosen from the command line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BackendChoice {
    #[default]
    Headless,
    Dump(PathBuf),
}

/// Built-in backends.
pub enum Backend {
    Headless(HeadlessBackend),
    Dump(DumpBackend),
}

impl Backend {
    /// Build a backend. `close_after` makes it close on its own after that
    /// many frames, like a device disappearing mid-stream.
    pub fn new(choice: &BackendChoice, close_after: Option<u32>) -> Self {
        match choice {
            BackendChoice::Headless => Backend::Headless(HeadlessBackend::new(close_after)),
            BackendChoice::Dump(path) => Backend::Dump(DumpBackend::new(path.clone(), close_after)),
        }
    }

    fn inner(&self) -> &dyn OutputBackend {
        match self {
            Backend::Headless(b) => b,
            Backend::Dump(b) => b,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn OutputBackend {
        match self {
            Backend::Headless(b) => b,
            Backend::Dump(b) => b,
        }
    }
}

impl OutputBackend for Backend {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn open(&mut self, opts: &OutputOptions) -> bool {
        self.inner_mut().open(opts)
    }

    fn is_open(&self) -> bool {
        self.inner().is_open()
    }

    fn write(&mut self, frame: &FrameRef<'_>) -> bool {
        self.inner_mut().write(frame)
    }

    fn close(&mut self) {
        self.inner_mut().close()
    }

    fn numfr(&self) -> u32 {
        self.inner().numfr()
    }

    fn frtime(&self) -> Duration {
        self.inner().frtime()
    }

    fn perf_stats(&self) -> PerfStats {
        self.inner().perf_stats()
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Incremental 64-bit FNV-1a over pixel bytes.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Self(FNV_OFFSET)
    }
}

impl Fnv1a {
    pub fn write_u32(&mut self, value: u32) {
        for byte in value.to_le_bytes() {
            self.0 ^= byte as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    pub fn write_pixels(&mut self, pixels: &[u32]) {
        for &px in pixels {
            self.write_u32(px);
        }
    }

    pub fn finish(&self) -> u64 {
        self.0
    }
}

/// Digest of one pixel run.
pub fn fnv1a(pixels: &[u32]) -> u64 {
    let mut h = Fnv1a::default();
    h.write_pixels(pixels);
    h.finish()
}
