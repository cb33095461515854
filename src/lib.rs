//! stressbox: workload generators that overload the network stack and the
//! memory hierarchy to check a host survives sustained adversarial access
//!
//! # Architecture
//!
//! The crate is organized by concern:
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: Process-wide shutdown flag, handlers and signal masks
//! - [`kernel::timer`]: POSIX timers, including the per-attempt connect alarm
//! - [`kernel::mman`]: Anonymous shared mappings that survive `fork()`
//! - [`kernel::socket`]: Stream socket calls returning owned descriptors
//! - [`kernel::epoll`]: Edge-triggered event notifier
//!
//! ## Core ([`core`])
//! - [`core::types`]: Workload context and the shared bogo-op counter
//! - [`core::run_control`]: Cooperative cancellation token
//! - [`core::spawner`]: Process and thread workers behind one contract
//! - [`core::runner`]: Multi-instance supervisor and run summary
//!
//! ## Stressors ([`stress`])
//! - [`stress::epoll`]: Multi-port connect/accept/read cycle (ipv4, ipv6, unix)
//! - [`stress::memthrash`]: Multi-threaded, multi-scale cache thrashing
//! - [`stress::clock`]: Clock and POSIX timer system calls
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: Run configuration, exit statuses and errors
//! - [`config::validator`]: Startup validation
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::artifact`]: Idempotent removal of socket files
//!
//! ## Utilities ([`utils`])
//! - [`utils::rng`]: Per-worker random number tiers
//! - [`utils::cpu`]: Processor counts and the monotonic clock
//!
//! # Design Principles
//!
//! 1. **Every loop has a poll point** - Nothing blocks without a bounded wait
//! 2. **Resources are owned** - Descriptors, timers and mappings release on drop
//! 3. **Types prevent errors** - Server setup order is a type-state chain
//! 4. **Minimal unsafe** - Thin wrappers with explicit preconditions
//! 5. **Counts are advisory** - The operation cap is a soft limit

// Kernel Primitives
pub mod kernel;

// Workload context, spawning and supervision
pub mod core;

// Stressor engines and registry
pub mod stress;

// Configuration
pub mod config;

// Safety & Cleanup
pub mod safety;

// Utilities
pub mod utils;

// CLI interface
pub mod cli;

pub use config::types::{ExitStatus, Result, StressConfig, StressError};
pub use core::runner::{run, RunSummary};
pub use stress::Stressor;
