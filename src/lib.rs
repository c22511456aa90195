//! audiod: privilege lifecycle and bootstrap controller for a sound server daemon
//!
//! Takes a process from exec to a running event loop: narrows credentials,
//! negotiates scheduling, optionally detaches with a readiness handshake,
//! enforces a single instance and wires OS signals into the loop.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::capabilities`]: capget/capset, restricting to CAP_SYS_NICE
//! - [`kernel::credentials`]: uid/gid transitions and system user lookup
//! - [`kernel::rlimit`]: resource limit kinds and application
//! - [`kernel::signal`]: mask guards, signalfd source, disposition resets
//!
//! ## Daemon Core ([`core`])
//! - [`core::privilege`]: credential classification and scheduling grants
//! - [`core::daemonize`]: fork/detach and stdio ownership
//! - [`core::handshake`]: one-shot status word from child to parent
//! - [`core::signals`]: signal to control action dispatch on the loop thread
//! - [`core::watchdog`]: CPU load watchdog
//!
//! ## Startup Sequencer ([`startup`])
//! - [`startup::Startup`]: type-state ordered startup
//! - [`startup::resources`]: reverse-order release of acquired resources
//!
//! ## Collaborators ([`runtime`])
//! - [`runtime::EventLoop`], [`runtime::ModuleLoader`], [`runtime::PolicyCheck`]
//!
//! ## Singleton & Locks ([`safety`])
//! - [`safety::pid_file`]: PID file lock with stale reclaim
//! - [`safety::autospawn`]: autospawn lock for start-if-not-running
//! - [`safety::shm`]: stale shared memory cleanup
//!
//! ## Observability ([`observability`])
//! - [`observability::logging`]: env_logger with a retargetable sink
//! - [`observability::status`]: status dump
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: settings, commands, errors
//! - [`config::loader`]: file, environment and validation
//!
//! ## Utilities ([`utils`])
//! - [`utils::fd_closure`]: inherited FD closure
//! - [`utils::paths`]: runtime/state directories and helper environment
//!
//! ## Testing Infrastructure ([`testing`])
//! - In-process fakes for every OS seam

// Kernel Primitives
pub mod kernel;

// Privilege, daemonization and signal control
pub mod core;

// Type-state startup sequence
pub mod startup;

// Event loop, module loader and policy seams
pub mod runtime;

// Singleton & Locks
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint for the audiod binary
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
