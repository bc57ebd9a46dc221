//! Kernel services used by the IPC core
//!
//! Scheduling primitives, event counters, kernel object dispatch and the
//! task lifecycle hooks.

pub mod counters;
pub mod ipc_kobject;
pub mod sched_prim;
pub mod task;

/// Kernel return code
pub type KernReturn = i32;

pub const KERN_SUCCESS: KernReturn = 0;
pub const KERN_INVALID_ARGUMENT: KernReturn = 4;
pub const KERN_RESOURCE_SHORTAGE: KernReturn = 6;
pub const KERN_NAME_EXISTS: KernReturn = 13;
pub const KERN_INVALID_NAME: KernReturn = 15;
pub const KERN_INVALID_TASK: KernReturn = 16;
pub const KERN_INVALID_RIGHT: KernReturn = 17;
pub const KERN_INVALID_VALUE: KernReturn = 18;
