//! Configuration
//!
//! Settings types, error taxonomy, and layered loading (defaults, JSON file,
//! environment, command line).

pub mod loader;
pub mod types;
