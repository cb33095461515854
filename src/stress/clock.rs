//! Clock stressor
//!
//! Rapid clock and POSIX timer system calls. Each iteration walks every clock
//! id the host knows, sleeps on absolute deadlines that are already in the
//! past, and churns a short-lived one-shot timer per timer-capable clock.
//! Individual call failures are expected on some kernels and only logged.

use crate::core::types::{ExitStatus, WorkloadContext};
use crate::kernel::timer::PosixTimer;
use log::debug;
use nix::time::{clock_getres, clock_gettime, ClockId};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Clocks queried for resolution and time
pub const CLOCKS: &[(libc::clockid_t, &str)] = &[
    (libc::CLOCK_REALTIME, "CLOCK_REALTIME"),
    (libc::CLOCK_REALTIME_COARSE, "CLOCK_REALTIME_COARSE"),
    (libc::CLOCK_MONOTONIC, "CLOCK_MONOTONIC"),
    (libc::CLOCK_MONOTONIC_RAW, "CLOCK_MONOTONIC_RAW"),
    (libc::CLOCK_MONOTONIC_COARSE, "CLOCK_MONOTONIC_COARSE"),
    (libc::CLOCK_BOOTTIME, "CLOCK_BOOTTIME"),
    (libc::CLOCK_PROCESS_CPUTIME_ID, "CLOCK_PROCESS_CPUTIME_ID"),
    (libc::CLOCK_THREAD_CPUTIME_ID, "CLOCK_THREAD_CPUTIME_ID"),
];

/// Clocks exercised with clock_nanosleep and timer_create
const SLEEP_AND_TIMER_CLOCKS: &[libc::clockid_t] = &[
    libc::CLOCK_REALTIME,
    libc::CLOCK_MONOTONIC,
    libc::CLOCK_THREAD_CPUTIME_ID,
];

/// One-shot expiry of each probe timer
const TIMER_ONE_SHOT: Duration = Duration::from_micros(5);

const PTP_DEVICE: &str = "/dev/ptp0";

pub fn clock_name(id: libc::clockid_t) -> &'static str {
    CLOCKS
        .iter()
        .find(|(clock, _)| *clock == id)
        .map_or("(unknown clock)", |(_, name)| name)
}

/// Dynamic clock id of an open posix clock device
fn fd_to_clockid(fd: libc::c_int) -> libc::clockid_t {
    ((!fd) << 3) | 3
}

/// Counts of calls that failed during one iteration
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClockPass {
    pub failures: u32,
    pub timers: u32,
}

pub struct ClockEngine {
    probe_ptp: bool,
}

impl Default for ClockEngine {
    fn default() -> Self {
        Self { probe_ptp: true }
    }
}

impl ClockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the PTP device probe
    pub fn without_ptp(mut self) -> Self {
        self.probe_ptp = false;
        self
    }

    fn thread_cputime(&self, name: &str, pass: &mut ClockPass) {
        match clock_gettime(ClockId::CLOCK_THREAD_CPUTIME_ID) {
            Ok(now) => {
                // Setting the thread CPU clock is not supported on Linux;
                // the call is made for its kernel path and the result ignored.
                let _ = nix::time::clock_settime(ClockId::CLOCK_THREAD_CPUTIME_ID, now);
            }
            Err(e) => {
                debug!("{}: clock_gettime CLOCK_THREAD_CPUTIME_ID: {}", name, e);
                pass.failures += 1;
            }
        }
    }

    fn query_clocks(&self, name: &str, pass: &mut ClockPass) {
        for &(id, clock) in CLOCKS {
            let id = ClockId::from_raw(id);
            if let Err(e) = clock_getres(id) {
                debug!("{}: clock_getres {}: {}", name, clock, e);
                pass.failures += 1;
            }
            if let Err(e) = clock_gettime(id) {
                debug!("{}: clock_gettime {}: {}", name, clock, e);
                pass.failures += 1;
            }
        }
    }

    fn sleep_in_past(&self, name: &str, pass: &mut ClockPass) {
        // An absolute deadline 2.5 µs after the epoch has long passed.
        let deadline = libc::timespec {
            tv_sec: 0,
            tv_nsec: 2500,
        };
        for &id in SLEEP_AND_TIMER_CLOCKS {
            // SAFETY: valid request pointer, no remainder requested.
            let rc = unsafe {
                libc::clock_nanosleep(id, libc::TIMER_ABSTIME, &deadline, std::ptr::null_mut())
            };
            if rc != 0 {
                debug!(
                    "{}: clock_nanosleep {}: {}",
                    name,
                    clock_name(id),
                    std::io::Error::from_raw_os_error(rc)
                );
                pass.failures += 1;
            }
        }
    }

    fn churn_timers(&self, name: &str, pass: &mut ClockPass) {
        let timers: Vec<(libc::clockid_t, PosixTimer)> = SLEEP_AND_TIMER_CLOCKS
            .iter()
            .filter_map(|&id| match PosixTimer::silent(id) {
                Ok(timer) => {
                    if let Err(e) = timer.set(TIMER_ONE_SHOT, Duration::ZERO) {
                        debug!("{}: timer_settime {}: {}", name, clock_name(id), e);
                        pass.failures += 1;
                    }
                    Some((id, timer))
                }
                Err(e) => {
                    debug!("{}: timer_create {}: {}", name, clock_name(id), e);
                    pass.failures += 1;
                    None
                }
            })
            .collect();

        for (id, timer) in &timers {
            if let Err(e) = timer.remaining() {
                debug!("{}: timer_gettime {}: {}", name, clock_name(*id), e);
                pass.failures += 1;
                break;
            }
            let _ = timer.overrun();
        }
        pass.timers += timers.len() as u32;
    }

    fn probe_ptp(&self, name: &str, pass: &mut ClockPass) {
        let Ok(device) = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(PTP_DEVICE)
        else {
            return;
        };
        let id = ClockId::from_raw(fd_to_clockid(device.as_raw_fd()));
        if let Err(e) = clock_gettime(id) {
            debug!("{}: clock_gettime {}: {}", name, PTP_DEVICE, e);
            pass.failures += 1;
        }
        if let Err(e) = clock_getres(id) {
            debug!("{}: clock_getres {}: {}", name, PTP_DEVICE, e);
            pass.failures += 1;
        }
    }

    /// One full pass over every clock call
    pub fn pass(&self, name: &str) -> ClockPass {
        let mut pass = ClockPass::default();
        self.thread_cputime(name, &mut pass);
        self.query_clocks(name, &mut pass);
        self.sleep_in_past(name, &mut pass);
        self.churn_timers(name, &mut pass);
        if self.probe_ptp {
            self.probe_ptp(name, &mut pass);
        }
        pass
    }

    /// Run one engine instance: a pass per counted operation
    pub fn run(&self, ctx: &WorkloadContext) -> ExitStatus {
        let mut failures = 0u64;
        loop {
            failures += self.pass(&ctx.name).failures as u64;
            ctx.inc_counter();
            if !ctx.keep_stressing() {
                break;
            }
        }
        if failures > 0 {
            debug!("{}: {} clock calls failed", ctx.name, failures);
        }
        ExitStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_clock_has_a_name() {
        for &(id, name) in CLOCKS {
            assert_eq!(clock_name(id), name);
        }
        assert_eq!(clock_name(-1), "(unknown clock)");
    }

    #[test]
    fn standard_clocks_answer() {
        let pass = ClockEngine::new().without_ptp().pass("clock");
        assert_eq!(pass.timers, SLEEP_AND_TIMER_CLOCKS.len() as u32);
    }

    #[test]
    fn dynamic_clock_ids_are_negative() {
        assert!(fd_to_clockid(3) < 0);
        assert_eq!(fd_to_clockid(3) & 7, 3);
    }

    #[test]
    fn run_counts_one_op_per_pass() {
        let ctx = WorkloadContext::new("clock", 0, 7).unwrap();
        assert_eq!(ClockEngine::new().without_ptp().run(&ctx), ExitStatus::Success);
        assert_eq!(ctx.bogo_ops(), 7);
    }
}
