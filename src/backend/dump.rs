use super::{Fnv1a, FrameRef, OutputBackend, OutputOptions, PerfStats, fnv1a};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// One line of the dump file.
#[derive(Debug, Serialize)]
struct DumpRecord {
    frame: u32,
    /// FNV-1a of each universe, as 16 hex digits.
    universes: Vec<String>,
}

/// Writes a JSON line per frame with per-universe digests.
#[derive(Debug)]
pub struct DumpBackend {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    frtime: Duration,
    close_after: Option<u32>,
    digest: Fnv1a,
    perf: PerfStats,
}

impl DumpBackend {
    pub fn new(path: PathBuf, close_after: Option<u32>) -> Self {
        Self {
            path,
            writer: None,
            frtime: Duration::ZERO,
            close_after,
            digest: Fnv1a::default(),
            perf: PerfStats::default(),
        }
    }

    fn write_record(writer: &mut BufWriter<File>, frame: &FrameRef<'_>) -> std::io::Result<()> {
        let record = DumpRecord {
            frame: frame.frame,
            universes: (0..frame.universes)
                .map(|u| format!("{:016x}", fnv1a(frame.universe(u))))
                .collect(),
        };
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")
    }

    fn shutdown(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                error!(path = %self.path.display(), error = %e, "Failed to flush dump file");
            }
        }
    }
}

impl OutputBackend for DumpBackend {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn open(&mut self, opts: &OutputOptions) -> bool {
        self.frtime = opts.frame_interval();
        match File::create(&self.path) {
            Ok(file) => {
                debug!(path = %self.path.display(), "Dump output opened");
                self.writer = Some(BufWriter::new(file));
                true
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to create dump file");
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn write(&mut self, frame: &FrameRef<'_>) -> bool {
        let Some(writer) = self.writer.as_mut() else {
            return false;
        };
        let started = Instant::now();
        if let Err(e) = Self::write_record(writer, frame) {
            error!(
                path = %self.path.display(),
                frame = frame.frame,
                error = %e,
                "Dump write failed"
            );
            self.writer = None;
            return false;
        }
        self.digest.write_u32(frame.frame);
        self.digest.write_pixels(frame.pixels);
        self.perf.record(frame, started.elapsed());
        self.perf.digest = self.digest.finish();

        if self.close_after == Some(self.perf.frames) {
            warn!(frame = frame.frame, "Dump output closing on its own");
            self.shutdown();
        }
        true
    }

    fn close(&mut self) {
        self.shutdown();
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
    use tempfile::tempdir;

    fn opts() -> OutputOptions {
        OutputOptions {
            fps: 60.0,
            universes: 2,
            nodes_per_universe: 3,
        }
    }

    #[test]
    fn test_dump_writes_one_line_per_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frames.jsonl");
        let mut backend = DumpBackend::new(path.clone(), None);
        assert!(backend.open(&opts()));

        let pixels = [1, 2, 3, 4, 5, 6];
        for n in 0..3 {
            assert!(backend.write(&FrameRef {
                frame: n,
                universes: 2,
                nodes_per_universe: 3,
                pixels: &pixels,
            }));
        }
        backend.close();
        assert!(!backend.is_open());

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2]["frame"], 2);
        let universes = lines[0]["universes"].as_array().unwrap();
        assert_eq!(universes.len(), 2);
        assert_eq!(universes[0], format!("{:016x}", fnv1a(&[1, 2, 3])));
        assert_eq!(universes[1], format!("{:016x}", fnv1a(&[4, 5, 6])));
    }

    #[test]
    fn test_open_fails_for_missing_directory() {
        let dir = tempdir().unwrap();
        let mut backend = DumpBackend::new(dir.path().join("nope/frames.jsonl"), None);
        assert!(!backend.open(&opts()));
        assert!(!backend.is_open());
    }

    #[test]
    fn test_close_after_flushes_and_closes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frames.jsonl");
        let mut backend = DumpBackend::new(path.clone(), Some(1));
        backend.open(&opts());
        let pixels = [0; 6];
        let frame = FrameRef {
            frame: 0,
            universes: 2,
            nodes_per_universe: 3,
            pixels: &pixels,
        };
        assert!(backend.write(&frame));
        assert!(!backend.is_open());
        assert!(!backend.write(&frame));
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }
}
