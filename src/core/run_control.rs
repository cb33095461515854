/// Cooperative cancellation token
///
/// Every worker gets a clone at spawn time and polls `keep_running()` at a
/// bounded interval. A token created with [`RunControl::process`] also honours
/// the process-wide shutdown flag flipped by signal handlers; tokens from
/// [`RunControl::new`] are isolated, which is what tests and in-process
/// harnesses want.
use crate::kernel::signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct RunControl {
    running: Arc<AtomicBool>,
    follows_signals: bool,
}

impl RunControl {
    /// Isolated token, running until `request_stop()`
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            follows_signals: false,
        }
    }

    /// Token that also stops on SIGINT/SIGTERM/SIGHUP/SIGALRM
    pub fn process() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            follows_signals: true,
        }
    }

    pub fn keep_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && !(self.follows_signals && signal::shutdown_requested())
    }

    /// Stop every holder of this token
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if self.follows_signals {
            signal::request_shutdown();
        }
    }

    pub fn follows_signals(&self) -> bool {
        self.follows_signals
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}
