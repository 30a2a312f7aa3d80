//! Exit analysis for worker subprocesses.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

use crate::watchdog::ExitInfo;

/// Why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Stopped, continued or otherwise not a termination.
    Unknown,
}

impl TerminationReason {
    /// Human-readable description for logs.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            // SIGKILL out of nowhere is usually the OOM killer.
            Self::Signaled(Signal::SIGKILL) => "killed by SIGKILL (possibly out of memory)".to_string(),
            Self::Signaled(sig) => format!("killed by signal {}", sig.as_str()),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }

    /// Exit record for the watchdog.
    pub fn to_exit_info(&self) -> ExitInfo {
        match self {
            Self::Exited(code) => ExitInfo::code(*code),
            Self::Signaled(sig) => ExitInfo::signal(sig.as_str()),
            Self::StillAlive => ExitInfo::clean(),
            Self::Unknown => ExitInfo::code(-1),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
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
