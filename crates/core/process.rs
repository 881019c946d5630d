//! OS process liveness checks and signalling.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::sync::Arc;

use crate::error::{DroverError, Result};

/// Liveness and termination of processes on this host.
pub trait ProcessControl: Send + Sync + std::fmt::Debug {
    /// Whether a process with this PID currently exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Send a hard termination signal (SIGKILL) to `pid`.
    fn kill(&self, pid: u32) -> Result<()>;

    /// Send a polite termination signal (SIGTERM) to `pid`.
    fn terminate(&self, pid: u32) -> Result<()>;

    /// PID of the calling process.
    fn current_pid(&self) -> u32 {
        std::process::id()
    }
}

/// Shared handle to a [`ProcessControl`] implementation.
pub type SharedProcessControl = Arc<dyn ProcessControl>;

/// [`ProcessControl`] backed by POSIX signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl SystemProcesses {
    fn send(pid: u32, sig: Option<Signal>) -> nix::Result<()> {
        let raw = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
        signal::kill(Pid::from_raw(raw), sig)
    }
}

impl ProcessControl for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        // Signal 0 probes for existence; EPERM means it exists but is not ours.
        match Self::send(pid, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn kill(&self, pid: u32) -> Result<()> {
        match Self::send(pid, Some(Signal::SIGKILL)) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(DroverError::Process(format!("kill({}): {}", pid, e))),
        }
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        match Self::send(pid, Some(Signal::SIGTERM)) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(DroverError::Process(format!("terminate({}): {}", pid, e))),
        }
    }
}
