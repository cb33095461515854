//! Per-attempt alarm for blocking connects.
//!
//! A POSIX timer delivers `SIGRTMIN` to the thread that armed it. The handler is
//! installed without `SA_RESTART`, so a connect still blocked when the timer
//! fires fails with `EINTR` and the caller counts a timeout. Once shutdown has
//! been requested the handler disarms the timer instead of letting it re-fire.

use crate::config::types::{Result, StressError};
use crate::kernel::signal::shutdown_requested;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;
use std::time::Duration;

/// Raw id of the currently armed timer (0 when none), read by the handler.
static ARMED_TIMER: AtomicUsize = AtomicUsize::new(0);

static HANDLER_INSTALLED: Once = Once::new();

/// Default connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

extern "C" fn on_expiry(_sig: libc::c_int) {
    if !shutdown_requested() {
        return;
    }
    let id = ARMED_TIMER.load(Ordering::SeqCst);
    if id == 0 {
        return;
    }
    let disarm = libc::itimerspec {
        it_interval: timespec(Duration::ZERO),
        it_value: timespec(Duration::ZERO),
    };
    // SAFETY: timer_settime is async-signal-safe; the id is cleared before deletion.
    unsafe {
        libc::timer_settime(id as libc::timer_t, 0, &disarm, std::ptr::null_mut());
    }
}

/// Install the expiry handler once per process.
fn install_expiry_handler() -> Result<()> {
    let mut result = Ok(());
    HANDLER_INSTALLED.call_once(|| {
        // SAFETY: zeroed sigaction is a valid starting point; every used field is set.
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_expiry as usize;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGRTMIN(), &action, std::ptr::null_mut())
        };
        if rc < 0 {
            result = Err(StressError::setup(
                "sigaction(SIGRTMIN)",
                std::io::Error::last_os_error(),
            ));
        }
    });
    result
}

/// Owned POSIX timer, deleted exactly once when dropped
#[derive(Debug)]
pub struct PosixTimer {
    id: libc::timer_t,
}

impl PosixTimer {
    fn create(clock: libc::clockid_t, sev: &mut libc::sigevent) -> std::io::Result<Self> {
        let mut id: libc::timer_t = std::ptr::null_mut();
        // SAFETY: sev and id are valid for the duration of the call.
        if unsafe { libc::timer_create(clock, sev, &mut id) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { id })
    }

    /// Timer on `clock` that only records expiry, raising no signal
    pub fn silent(clock: libc::clockid_t) -> std::io::Result<Self> {
        // SAFETY: sigevent has private padding, so it is zero-initialised and filled in.
        let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_NONE;
        Self::create(clock, &mut sev)
    }

    /// Arm to fire after `value`, then every `interval` (zero for one-shot)
    pub fn set(&self, value: Duration, interval: Duration) -> std::io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: timespec(interval),
            it_value: timespec(value),
        };
        // SAFETY: id is live until drop.
        if unsafe { libc::timer_settime(self.id, 0, &spec, std::ptr::null_mut()) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Remaining time before the next expiry; zero once disarmed or expired
    pub fn remaining(&self) -> std::io::Result<Duration> {
        // SAFETY: zeroed itimerspec is a valid out-parameter.
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        // SAFETY: id is live until drop.
        if unsafe { libc::timer_gettime(self.id, &mut spec) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Duration::new(
            spec.it_value.tv_sec as u64,
            spec.it_value.tv_nsec as u32,
        ))
    }

    /// Expirations missed since the last delivered one
    pub fn overrun(&self) -> std::io::Result<u32> {
        // SAFETY: id is live until drop.
        let n = unsafe { libc::timer_getoverrun(self.id) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(n as u32)
    }

    fn raw(&self) -> usize {
        self.id as usize
    }
}

impl Drop for PosixTimer {
    fn drop(&mut self) {
        // SAFETY: id was created by timer_create and is deleted exactly once here.
        if unsafe { libc::timer_delete(self.id) } < 0 {
            log::debug!(
                "timer_delete failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// One armed connect timer. Deleted when dropped, on every exit path.
pub struct ConnectTimer {
    timer: PosixTimer,
}

impl ConnectTimer {
    /// Create and arm a periodic timer firing every `period` at the calling thread.
    pub fn arm(period: Duration) -> Result<Self> {
        install_expiry_handler()?;

        // SAFETY: sigevent has private padding, so it is zero-initialised and filled in.
        let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = libc::SIGRTMIN();
        // SAFETY: gettid has no preconditions.
        sev.sigev_notify_thread_id = unsafe { libc::syscall(libc::SYS_gettid) } as libc::c_int;

        let timer = Self {
            timer: PosixTimer::create(libc::CLOCK_MONOTONIC, &mut sev)
                .map_err(|e| StressError::setup("timer_create", e))?,
        };
        ARMED_TIMER.store(timer.timer.raw(), Ordering::SeqCst);
        timer
            .timer
            .set(period, period)
            .map_err(|e| StressError::setup("timer_settime", e))?;

        Ok(timer)
    }

    /// Remaining time before the next expiry; zero once disarmed.
    pub fn remaining(&self) -> Result<Duration> {
        Ok(self.timer.remaining()?)
    }
}

impl Drop for ConnectTimer {
    fn drop(&mut self) {
        // Cleared before the PosixTimer field deletes the id.
        let _ = ARMED_TIMER.compare_exchange(
            self.timer.raw(),
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}
