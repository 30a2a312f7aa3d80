//! Process handle for worker subprocesses.

use std::os::fd::OwnedFd;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::broker::ipc::PipeFd;
use crate::error::{GenError, Result};

/// A spawned worker process. Reaped exactly once; killed on drop if still running.
pub struct Proc {
    pid: Pid,
    reaped: bool,
}

/// The pipe ends the master keeps for one worker.
pub struct ProcPipes {
    /// Write end of the worker's stdin.
    pub stdin: PipeFd,
    /// Read end of the worker's stdout.
    pub stdout: PipeFd,
}

impl Proc {
    /// Take over a spawned child, splitting off its stdin/stdout pipes.
    pub fn from_child(mut child: std::process::Child) -> Result<(Self, ProcPipes)> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GenError::Spawn("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GenError::Spawn("Child stdout not captured".into()))?;

        let pipes = ProcPipes {
            stdin: PipeFd::from(OwnedFd::from(stdin)),
            stdout: PipeFd::from(OwnedFd::from(stdout)),
        };
        Ok((Self { pid, reaped: false }, pipes))
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if self.reaped {
            return Err(GenError::Worker("Process already reaped".into()));
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Stopped(..)) | Ok(WaitStatus::Continued(_)) => continue,
                Ok(status) => {
                    self.reaped = true;
                    return Ok(status);
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    self.reaped = true;
                    return Err(GenError::Worker(format!("waitpid failed: {}", e)));
                }
            }
        }
    }

    /// Try to wait for the process (non-blocking). `None` while it runs.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Err(GenError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(status))
            }
            Err(e) => {
                self.reaped = true;
                Err(GenError::Worker(format!("waitpid failed: {}", e)))
            }
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| GenError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and reap it.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| GenError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()?;
        Ok(())
    }
}

impl Drop for Proc {
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
