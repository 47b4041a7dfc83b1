//! Handle to one worker process.

use super::ipc::{LineReader, PipeFd};
use super::protocol::WorkerMessage;
use crate::error::{PipelineError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::io::OwnedFd;
use std::process::Child;
use std::time::Duration;

pub struct WorkerProc {
    worker_id: u32,
    pid: Pid,
    reader: LineReader<PipeFd>,
    reaped: bool,
}

impl WorkerProc {
    /// Take over a spawned child. Its stdout must be piped; reaping is done
    /// here with `waitpid`, not through `Child`.
    pub fn from_child(worker_id: u32, mut child: Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| {
                PipelineError::Worker(format!("worker {} stdout not captured", worker_id))
            })?;

        Ok(Self {
            worker_id,
            pid,
            reader: LineReader::new(PipeFd::new(OwnedFd::from(stdout))),
            reaped: false,
        })
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Next message, or `None` once the worker closed its stdout.
    ///
    /// A line that is not a valid message yields `PipelineError::Json`; the
    /// stream stays usable.
    pub fn recv(&mut self) -> Result<Option<WorkerMessage>> {
        match self.reader.read_message::<WorkerMessage>()? {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if self.reaped {
            return Err(PipelineError::Worker(format!(
                "worker {} already reaped",
                self.worker_id
            )));
        }
        let status = waitpid(self.pid, None)?;
        self.reaped = true;
        Ok(status)
    }

    /// Reap the process if it has exited.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Ok(None);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::StillAlive => Ok(None),
            status => {
                self.reaped = true;
                Ok(Some(status))
            }
        }
    }

    pub fn terminate(&self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)?;
        Ok(())
    }
}

impl Drop for WorkerProc {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        let _ = self.terminate();
        std::thread::sleep(Duration::from_millis(10));
        if let Ok(Some(_)) = self.try_wait() {
            return;
        }
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
        self.reaped = true;
    }
}
