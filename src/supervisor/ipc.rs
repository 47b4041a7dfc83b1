//! Line-delimited JSON over pipes.
//!
//! Workers report to the master on their stdout; the master reads each
//! worker's pipe from a collector thread.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

const BUFFER_SIZE: usize = 16 * 1024;

/// A pipe end with EINTR-safe reads and writes.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// A private duplicate of this process's stdout, so dropping it leaves
    /// fd 1 open.
    pub fn stdout() -> io::Result<Self> {
        let fd = nix::unistd::dup(io::stdout()).map_err(io::Error::from)?;
        Ok(Self { fd })
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads one JSON message per line.
pub struct LineReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(BUFFER_SIZE, inner),
            line: String::with_capacity(256),
        }
    }

    /// Next non-empty line without its terminator, or `None` at EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim_end_matches(['\n', '\r']);
            if !trimmed.is_empty() {
                let len = trimmed.len();
                self.line.truncate(len);
                return Ok(Some(self.line.as_str()));
            }
        }
    }

    /// Next message. The outer error is the pipe, the inner one the payload,
    /// so a caller can skip a garbled line and keep reading.
    pub fn read_message<T: DeserializeOwned>(
        &mut self,
    ) -> io::Result<Option<Result<T, serde_json::Error>>> {
        Ok(self.read_line()?.map(serde_json::from_str))
    }
}

/// Writes one JSON message per line, flushing after each.
pub struct LineWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(BUFFER_SIZE, inner),
        }
    }

    pub fn send<T: Serialize>(&mut self, message: &T) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, message)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}
