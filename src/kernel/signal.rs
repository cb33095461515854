//! Process-wide shutdown signalling
//!
//! Only a static is reachable from a signal handler, so the "stop the run"
//! state lives here. Engines never poll it directly; they hold a
//! [`crate::core::run_control::RunControl`] token bound to it.

use log::debug;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Number of the last shutdown signal delivered (0 = none)
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Signals that end a run: interactive interrupt, termination, hangup and the
/// deadline alarm sent by the run supervisor.
pub const SHUTDOWN_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGALRM,
];

/// Installed shutdown dispositions
pub struct ShutdownHandlers;

impl ShutdownHandlers {
    /// Install the handler for every signal in [`SHUTDOWN_SIGNALS`].
    /// Call before forking instances so they inherit the disposition.
    pub fn install() -> Result<Self, String> {
        let action = SigAction::new(
            SigHandler::Handler(on_shutdown_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in SHUTDOWN_SIGNALS {
            // SAFETY: the handler only stores to atomics.
            unsafe { signal::sigaction(sig, &action) }
                .map_err(|e| format!("Failed to install {} handler: {}", sig, e))?;
        }

        debug!("shutdown handlers installed for {:?}", SHUTDOWN_SIGNALS);
        Ok(Self)
    }
}

extern "C" fn on_shutdown_signal(signo: libc::c_int) {
    LAST_SIGNAL.store(signo, Ordering::SeqCst);
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// True once a shutdown signal arrived or a process-wide stop was requested
pub fn shutdown_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

/// Flip the process-wide flag without a signal
pub fn request_shutdown() {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// The shutdown signal that stopped the run, if one did
pub fn last_signal() -> Option<Signal> {
    match LAST_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        signo => Signal::try_from(signo).ok(),
    }
}

/// Re-arm the process-wide flag so a stop from an earlier run does not leak
/// into the next one.
pub fn reset_shutdown() {
    STOP_REQUESTED.store(false, Ordering::SeqCst);
    LAST_SIGNAL.store(0, Ordering::SeqCst);
}

/// Have the kernel SIGKILL the calling process once the thread that forked it
/// exits. Survives `execve`, not `fork`.
#[cfg(target_os = "linux")]
pub fn kill_on_parent_exit() -> std::io::Result<()> {
    // SAFETY: PR_SET_PDEATHSIG takes a signal number and no pointers.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Every asynchronous signal blocked on the calling thread.
/// The previous mask comes back when the guard drops.
pub struct SignalBlockGuard {
    previous: SigSet,
}

impl SignalBlockGuard {
    /// Worker threads call this so signals land on the instance's main thread
    pub fn block_all() -> Result<Self, String> {
        let mut previous = SigSet::empty();
        signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut previous))
            .map_err(|e| format!("Failed to block signals: {}", e))?;

        Ok(Self { previous })
    }
}

impl Drop for SignalBlockGuard {
    fn drop(&mut self) {
        let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn handlers_install() {
        assert!(ShutdownHandlers::install().is_ok());
    }

    #[test]
    #[serial]
    fn stop_request_without_signal() {
        let _handlers = ShutdownHandlers::install().unwrap();
        reset_shutdown();
        assert!(!shutdown_requested());

        request_shutdown();
        assert!(shutdown_requested());
        assert_eq!(last_signal(), None);

        reset_shutdown();
        assert!(!shutdown_requested());
    }

    #[test]
    #[serial]
    fn alarm_stops_the_run() {
        let _handlers = ShutdownHandlers::install().unwrap();
        reset_shutdown();

        signal::raise(Signal::SIGALRM).unwrap();
        assert!(shutdown_requested());
        assert_eq!(last_signal(), Some(Signal::SIGALRM));

        reset_shutdown();
        assert_eq!(last_signal(), None);
    }

    #[test]
    fn block_guard_restores_mask() {
        let before = SigSet::thread_get_mask().unwrap();
        {
            let _guard = SignalBlockGuard::block_all().unwrap();
            let blocked = SigSet::thread_get_mask().unwrap();
            assert!(blocked.contains(Signal::SIGINT));
            assert!(blocked.contains(Signal::SIGALRM));
        }
        let after = SigSet::thread_get_mask().unwrap();
        assert_eq!(before.contains(Signal::SIGINT), after.contains(Signal::SIGINT));
    }
}
