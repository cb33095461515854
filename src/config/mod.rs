//! Configuration
//!
//! Run settings, per-engine options, and startup validation.

pub mod types;
pub mod validator;
