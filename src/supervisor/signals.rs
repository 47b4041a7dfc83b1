//! Worker exit analysis and signal disposition.

use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::WaitStatus;
use serde::{Serialize, Serializer};
use std::fmt;

/// Why a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Exited(i32),
    Signaled(Signal),
    StillAlive,
    Unknown,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(0) => "exited cleanly".to_string(),
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(Signal::SIGKILL) => {
                "killed by SIGKILL (supervisor or OOM killer)".to_string()
            }
            Self::Signaled(sig) => format!("killed by {}", sig.as_str()),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

impl Serialize for TerminationReason {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, sig, _) => TerminationReason::Signaled(sig),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// Signal setup for a worker process.
///
/// Ctrl+C reaches the whole process group; workers ignore it and unwind when
/// the master closes the output. SIGPIPE is ignored so a vanished master
/// shows up as a write error.
pub fn ignore_worker_signals() {
    for sig in [Signal::SIGINT, Signal::SIGPIPE] {
        // Safety: installs SIG_IGN, which runs no handler code.
        if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigIgn) } {
            tracing::warn!(signal = sig.as_str(), error = %e, "Failed to ignore signal");
        }
    }
}
