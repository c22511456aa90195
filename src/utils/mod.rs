//! Utilities
//!
//! Process hygiene at startup and directory/environment plumbing.

pub mod fd_closure;
pub mod paths;
