//! Host processor topology and clocks

use nix::time::{clock_gettime, ClockId};
use std::time::Duration;

/// Processors configured on the host, online or not.
/// Falls back to the scheduler's view when sysconf cannot answer.
pub fn processors_configured() -> usize {
    // SAFETY: sysconf has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n > 0 {
        n as usize
    } else {
        num_cpus::get().max(1)
    }
}

/// Monotonic time since an arbitrary fixed point
pub fn monotonic_now() -> Duration {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_least_one_processor() {
        assert!(processors_configured() >= 1);
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(monotonic_now() > a);
    }
}
