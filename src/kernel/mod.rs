//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: signal -> rlimit -> capabilities -> credentials

pub mod capabilities;
pub mod credentials;
pub mod rlimit;
pub mod signal;
