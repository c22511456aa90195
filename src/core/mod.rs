//! Daemon core: privilege negotiation, detaching, signal control.
//!
//! Everything OS-facing sits behind a trait (`PrivilegeOps`, `Detach`) so the
//! sequencer can be driven by fakes in tests.

pub mod daemonize;
pub mod handshake;
pub mod privilege;
pub mod signals;
pub mod types;
pub mod watchdog;
