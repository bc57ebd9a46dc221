//! mach_ipc - Mach-style IPC core
//!
//! This crate provides the inter-process communication core of a Mach
//! kernel: per-task capability spaces, ports with bounded message queues,
//! port sets, blocking send and receive with direct handoff, kernel ports
//! serviced in place, and teardown of a task's rights when it exits.
//!
//! The crate is `no_std` + `alloc`. With the `std` feature (default) it
//! parks blocked threads on host OS threads; a kernel supplies its own
//! [`kern::sched_prim::Parker`] otherwise.

#![cfg_attr(not(any(feature = "std", test)), no_std)]
// Kernel objects are handed out as Arc from their constructors
#![allow(clippy::new_without_default)]
// Send failures hand the undelivered message back to the caller
#![allow(clippy::result_large_err)]

extern crate alloc;

pub mod config;
pub mod ipc;
pub mod kern;

pub use config::IpcConfig;
pub use ipc::{IpcError, IpcResult};
pub use kern::task::Task;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "mach_ipc";

/// Initialize the IPC subsystem with a process-wide configuration
pub fn init(config: IpcConfig) -> IpcResult<()> {
    let active = config::init(config)?;
    log::info!(
        "{} {}: qlimit {} (max {}), table {}..{}",
        NAME,
        VERSION,
        active.default_qlimit,
        active.max_qlimit,
        active.table_initial_size,
        active.table_max_size
    );
    Ok(())
}
