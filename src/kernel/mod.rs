//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: signal -> timer -> mman -> socket -> epoll

#[cfg(target_os = "linux")]
pub mod epoll;
pub mod mman;
pub mod signal;
#[cfg(target_os = "linux")]
pub mod socket;
#[cfg(target_os = "linux")]
pub mod timer;
