/// Worker spawning: one contract, a process and a thread implementation
///
/// A worker runs a workload closure to completion and reports an [`ExitStatus`].
/// Process workers are forked; the child leaves through `_exit` straight after
/// the closure returns and never unwinds back into the parent's control flow.
/// Thread workers block every asynchronous signal so delivery stays with the
/// controlling thread. std threads already run with their own alternate signal
/// stack on Linux, so no extra stack setup happens here.
use crate::config::types::{Result, StressError};
use crate::core::run_control::RunControl;
use crate::core::types::ExitStatus;
use crate::kernel::signal::{self, SignalBlockGuard};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, getppid, ForkResult, Pid};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

pub trait Worker {
    /// Force the worker to stop as soon as it can
    fn terminate(&mut self);

    /// Wait for the worker to finish and return its terminal status
    fn join(self) -> Result<ExitStatus>;
}

/// Forked child process running a workload
#[derive(Debug)]
pub struct ProcessWorker {
    pid: Pid,
    reaped: bool,
    terminated: bool,
}

/// Fork a child that runs `workload` and exits with its status.
pub fn spawn_process<F>(workload: F) -> Result<ProcessWorker>
where
    F: FnOnce() -> ExitStatus,
{
    // SAFETY: the child runs the workload and leaves via _exit without
    // returning into the caller.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(ProcessWorker {
            pid: child,
            reaped: false,
            terminated: false,
        }),
        Ok(ForkResult::Child) => {
            let status = catch_unwind(AssertUnwindSafe(workload)).unwrap_or(ExitStatus::Failure);
            // SAFETY: _exit skips atexit handlers and stdio flushing inherited from the parent.
            unsafe { libc::_exit(status.code()) }
        }
        Err(e) => Err(StressError::Spawn {
            message: format!("fork: {}", e),
            transient: e == Errno::EAGAIN,
        }),
    }
}

/// Fork a child like [`spawn_process`] that is also SIGKILLed when the forking
/// thread exits, so it cannot outlive a parent that was killed before reaping it.
#[cfg(target_os = "linux")]
pub fn spawn_tethered_process<F>(workload: F) -> Result<ProcessWorker>
where
    F: FnOnce() -> ExitStatus,
{
    let parent = getpid();
    spawn_process(move || {
        if let Err(e) = signal::kill_on_parent_exit() {
            log::error!("prctl(PR_SET_PDEATHSIG): {}", e);
            return ExitStatus::Failure;
        }
        // The parent may have died between fork and prctl.
        if getppid() != parent {
            return ExitStatus::Failure;
        }
        workload()
    })
}

fn status_from_wait(status: WaitStatus, terminated: bool) -> ExitStatus {
    match status {
        WaitStatus::Exited(_, code) => ExitStatus::from_code(code),
        WaitStatus::Signaled(_, _, _) if terminated => ExitStatus::Success,
        _ => ExitStatus::Failure,
    }
}

impl ProcessWorker {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Deliver `sig` to the child; a child that already exited is not an error.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        match kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reap without blocking; `None` while the child is still running.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.reaped {
            return Ok(None);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::StillAlive => Ok(None),
            status => {
                self.reaped = true;
                Ok(Some(status_from_wait(status, self.terminated)))
            }
        }
    }

    fn wait_blocking(&mut self) -> Result<ExitStatus> {
        loop {
            match waitpid(self.pid, None) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    self.reaped = true;
                    return Ok(status_from_wait(status, self.terminated));
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.reaped = true;
                    return Err(e.into());
                }
            }
        }
    }
}

impl Worker for ProcessWorker {
    fn terminate(&mut self) {
        self.terminated = true;
        if let Err(e) = self.signal(Signal::SIGKILL) {
            log::debug!("kill({}) failed: {}", self.pid, e);
        }
    }

    fn join(mut self) -> Result<ExitStatus> {
        self.wait_blocking()
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if !self.reaped {
            self.terminate();
            let _ = self.wait_blocking();
        }
    }
}

/// Thread running a workload in the caller's address space
pub struct ThreadWorker {
    handle: JoinHandle<ExitStatus>,
    stop: RunControl,
}

/// Spawn a named thread that runs `workload` with all signals blocked.
/// `stop` is the token `terminate()` flips; the workload is expected to poll it.
pub fn spawn_thread<F>(name: String, stop: RunControl, workload: F) -> Result<ThreadWorker>
where
    F: FnOnce() -> ExitStatus + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let _mask = match SignalBlockGuard::block_all() {
                Ok(guard) => guard,
                Err(e) => {
                    log::warn!("{}", e);
                    return ExitStatus::Failure;
                }
            };
            workload()
        })
        .map_err(|e| StressError::Spawn {
            transient: e.raw_os_error() == Some(libc::EAGAIN),
            message: format!("thread spawn: {}", e),
        })?;

    Ok(ThreadWorker { handle, stop })
}

impl ThreadWorker {
    /// True once the workload has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Worker for ThreadWorker {
    fn terminate(&mut self) {
        self.stop.request_stop();
    }

    fn join(self) -> Result<ExitStatus> {
        self.handle.join().map_err(|_| StressError::Spawn {
            message: "worker thread panicked".to_string(),
            transient: false,
        })
    }
}
