//! Engine-agnostic core.
//!
//! Core owns the workload context handed to every engine instance, the
//! cancellation token, worker spawning, and the multi-instance supervisor.
//! Stressor-specific behaviour lives in `stress`.

pub mod run_control;
pub mod runner;
pub mod spawner;
pub mod types;
