use crate::config::types::Result;
use crate::core::run_control::RunControl;
use crate::kernel::mman::SharedMapping;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use crate::config::types::ExitStatus;

/// Bogo-op counter living in a shared anonymous page.
///
/// Clones share the page, and so do forked children, so increments made in a
/// server process or a worker thread are visible to whoever holds the original.
/// Increments are relaxed; cross-process readers may see slightly stale values.
#[derive(Clone, Debug)]
pub struct SharedCounter {
    page: Arc<SharedMapping>,
}

impl SharedCounter {
    pub fn new() -> Result<Self> {
        let page = SharedMapping::new(std::mem::size_of::<AtomicU64>())?;
        Ok(Self {
            page: Arc::new(page),
        })
    }

    fn cell(&self) -> &AtomicU64 {
        // SAFETY: the mapping is page-aligned, zero-initialised and at least 8 bytes,
        // and lives as long as self.
        unsafe { &*(self.page.as_ptr() as *const AtomicU64) }
    }

    pub fn get(&self) -> u64 {
        self.cell().load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.cell().fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.cell().fetch_add(delta, Ordering::Relaxed);
    }

    /// Increment unless `cap` (non-zero) has been reached.
    /// Returns false when the cap stopped the increment.
    pub fn inc_below(&self, cap: u64) -> bool {
        if cap == 0 {
            self.inc();
            return true;
        }
        self.cell()
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                (v < cap).then_some(v + 1)
            })
            .is_ok()
    }
}

/// Everything a workload function needs about the instance it runs in
#[derive(Clone, Debug)]
pub struct WorkloadContext {
    /// Diagnostic name used as log prefix
    pub name: String,
    /// Shared bogo-op counter
    pub counter: SharedCounter,
    /// Index of this engine instance
    pub instance: u32,
    /// Total number of instances running concurrently
    pub instances: u32,
    /// Soft operation cap (0 = unbounded)
    pub max_ops: u64,
    /// Pid of the process that launched the instances
    pub ppid: u32,
    /// Cooperative cancellation token
    pub run: RunControl,
}

impl WorkloadContext {
    /// Fresh context with its own counter and an isolated run token
    pub fn new(name: impl Into<String>, instance: u32, max_ops: u64) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            counter: SharedCounter::new()?,
            instance,
            instances: 1,
            max_ops,
            ppid: nix::unistd::getppid().as_raw() as u32,
            run: RunControl::new(),
        })
    }

    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_parent(mut self, ppid: u32) -> Self {
        self.ppid = ppid;
        self
    }

    pub fn with_run_control(mut self, run: RunControl) -> Self {
        self.run = run;
        self
    }

    pub fn with_counter(mut self, counter: SharedCounter) -> Self {
        self.counter = counter;
        self
    }

    /// True while not cancelled and the cap has not been reached
    pub fn keep_stressing(&self) -> bool {
        self.run.keep_running() && !self.cap_reached()
    }

    pub fn cap_reached(&self) -> bool {
        self.max_ops != 0 && self.counter.get() >= self.max_ops
    }

    pub fn inc_counter(&self) {
        self.counter.inc();
    }

    pub fn bogo_ops(&self) -> u64 {
        self.counter.get()
    }
}
