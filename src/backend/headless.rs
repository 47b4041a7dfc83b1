use super::{Fnv1a, FrameRef, OutputBackend, OutputOptions, PerfStats};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Output stage without a device: accepts frames and digests their contents.
#[derive(Debug)]
pub struct HeadlessBackend {
    open: bool,
    frtime: Duration,
    close_after: Option<u32>,
    digest: Fnv1a,
    perf: PerfStats,
}

impl HeadlessBackend {
    pub fn new(close_after: Option<u32>) -> Self {
        Self {
            open: false,
            frtime: Duration::ZERO,
            close_after,
            digest: Fnv1a::default(),
            perf: PerfStats::default(),
        }
    }
}

impl OutputBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn open(&mut self, opts: &OutputOptions) -> bool {
        self.frtime = opts.frame_interval();
        self.open = true;
        debug!(
            universes = opts.universes,
            nodes = opts.nodes_per_universe,
            frtime_us = self.frtime.as_micros() as u64,
            "Headless output opened"
        );
        true
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn write(&mut self, frame: &FrameRef<'_>) -> bool {
        if !self.open {
            return false;
        }
        let started = Instant::now();
        self.digest.write_u32(frame.frame);
        self.digest.write_pixels(frame.pixels);
        self.perf.record(frame, started.elapsed());
        self.perf.digest = self.digest.finish();

        if self.close_after == Some(self.perf.frames) {
            warn!(frame = frame.frame, "Headless output closing on its own");
            self.open = false;
        }
        true
    }

    fn close(&mut self) {
        if self.open {
            debug!(frames = self.perf.frames, "Headless output closed");
        }
        self.open = false;
    }

    fn numfr(&self) -> u32 {
        self.perf.frames
    }

    fn frtime(&self) -> Duration {
        self.frtime
    }

    fn perf_stats(&self) -> PerfStats {
        self.perf.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> OutputOptions {
        OutputOptions {
            fps: 30.0,
            universes: 2,
            nodes_per_universe: 2,
        }
    }

    fn frame(n: u32, pixels: &[u32]) -> FrameRef<'_> {
        FrameRef {
            frame: n,
            universes: 2,
            nodes_per_universe: 2,
            pixels,
        }
    }

    #[test]
    fn test_write_requires_open() {
        let mut backend = HeadlessBackend::new(None);
        assert!(!backend.write(&frame(0, &[0; 4])));
        assert!(backend.open(&opts()));
        assert!(backend.write(&frame(0, &[0; 4])));
        assert_eq!(backend.numfr(), 1);
        assert_eq!(backend.perf_stats().bytes, 16);
    }

    #[test]
    fn test_close_after_closes_following_the_nth_frame() {
        let mut backend = HeadlessBackend::new(Some(2));
        backend.open(&opts());
        assert!(backend.write(&frame(0, &[1; 4])));
        assert!(backend.is_open());
        assert!(backend.write(&frame(1, &[1; 4])));
        assert!(!backend.is_open());
        assert!(!backend.write(&frame(2, &[1; 4])));
        assert_eq!(backend.numfr(), 2);
    }

    #[test]
    fn test_digest_depends_on_content_and_order() {
        let run = |frames: &[(u32, [u32; 4])]| {
            let mut backend = HeadlessBackend::new(None);
            backend.open(&opts());
            for (n, px) in frames {
                backend.write(&frame(*n, px));
            }
            backend.perf_stats().digest
        };
        let a = run(&[(0, [1, 2, 3, 4]), (1, [5, 6, 7, 8])]);
        let b = run(&[(0, [1, 2, 3, 4]), (1, [5, 6, 7, 8])]);
        let c = run(&[(0, [5, 6, 7, 8]), (1, [1, 2, 3, 4])]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
