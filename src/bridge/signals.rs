//! Describing how a worker process ended.

use std::fmt;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Reaped elsewhere or stopped; no exit status available.
    Unknown,
}

impl TerminationReason {
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(Signal::SIGKILL) => "killed by SIGKILL".to_string(),
            Self::Signaled(Signal::SIGSEGV) => "crashed with a segmentation fault".to_string(),
            Self::Signaled(Signal::SIGBUS) => "crashed with a bus error".to_string(),
            Self::Signaled(Signal::SIGABRT) => "aborted".to_string(),
            Self::Signaled(sig) => format!("killed by signal {}", sig.as_str()),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "ended for an unknown reason".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}
