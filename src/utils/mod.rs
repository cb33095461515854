//! Utilities
//!
//! Cross-cutting helpers for random access patterns and host topology.

pub mod cpu;
pub mod rng;
