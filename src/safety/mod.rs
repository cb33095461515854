//! Safety & cleanup
//!
//! Idempotent release of resources that outlive a single syscall.

pub mod artifact;
