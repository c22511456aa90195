//! Observability
//!
//! Logging setup and the status dump served on the status signal.

pub mod logging;
pub mod status;
