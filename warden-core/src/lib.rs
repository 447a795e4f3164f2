//! Ambient support library for the warden proxy supervisor: the pieces that are useful
//! regardless of which network protocol the hosted data plane speaks. Everything here is
//! the init barrier, watchdog/guard dog, and drain primitive the orchestrator composes,
//! plus the logging/version plumbing a real binary needs around them.

pub mod drain;
pub mod graceful;
pub mod init_manager;
pub mod prelude;
pub mod signal;
pub mod telemetry;
pub mod version;
pub mod watchdog;
