//! Singleton and lock management
//!
//! Filesystem-keyed exclusion between daemon instances. The kernel releases
//! every lock here when its holder dies.

pub mod autospawn;
pub mod pid_file;
pub mod shm;
