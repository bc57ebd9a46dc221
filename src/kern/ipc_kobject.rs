//! IPC Kernel Objects
//!
//! Based on Mach4 kern/ipc_kobject.h by Rich Draves (1989)
//!
//! This module allows IPC ports to represent kernel objects. When a message
//! is sent to such a port, the kernel handles it directly rather than
//! queuing it for a user-space receiver.

use alloc::boxed::Box;
use core::fmt;

use crate::counter;
use crate::ipc::kmsg::IpcKmsg;
use crate::kern::counters::C_IPC_KOBJECT;

// ============================================================================
// Kernel Object Types
// ============================================================================

/// Kernel object type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum KobjectType {
    /// No kernel object (user port)
    #[default]
    None = 0,
    Thread = 1,
    Task = 2,
    /// Host (normal)
    Host = 3,
    /// Host (privileged)
    HostPriv = 4,
    Processor = 5,
    ProcessorSet = 6,
    /// Memory object (pager)
    Pager = 8,
    Device = 10,
    Semaphore = 23,
    Clock = 25,
    /// Unknown (catchall)
    Unknown = 27,
}

impl KobjectType {
    /// Convert from u32
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0 => Some(Self::None),
            1 => Some(Self::Thread),
            2 => Some(Self::Task),
            3 => Some(Self::Host),
            4 => Some(Self::HostPriv),
            5 => Some(Self::Processor),
            6 => Some(Self::ProcessorSet),
            8 => Some(Self::Pager),
            10 => Some(Self::Device),
            23 => Some(Self::Semaphore),
            25 => Some(Self::Clock),
            27 => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Get type name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Thread => "thread",
            Self::Task => "task",
            Self::Host => "host",
            Self::HostPriv => "host_priv",
            Self::Processor => "processor",
            Self::ProcessorSet => "processor_set",
            Self::Pager => "pager",
            Self::Device => "device",
            Self::Semaphore => "semaphore",
            Self::Clock => "clock",
            Self::Unknown => "unknown",
        }
    }

    /// Check if this is a valid kernel object type
    pub fn is_kobject(&self) -> bool {
        *self != Self::None
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// A kernel object reachable through a port.
///
/// `invoke` runs on the sending thread while no IPC lock is held. It owns
/// the request and may return a reply, which is left on the sending thread
/// for the receive half of the same `mach_msg` call.
pub trait KobjectHandler: Send + Sync {
    fn kobject_type(&self) -> KobjectType;

    fn invoke(&self, request: Box<IpcKmsg>) -> Option<Box<IpcKmsg>>;
}

/// Handler backed by a closure
pub struct FnKobject<F> {
    kotype: KobjectType,
    func: F,
}

impl<F> FnKobject<F>
where
    F: Fn(Box<IpcKmsg>) -> Option<Box<IpcKmsg>> + Send + Sync,
{
    pub fn new(kotype: KobjectType, func: F) -> Self {
        Self { kotype, func }
    }
}

impl<F> KobjectHandler for FnKobject<F>
where
    F: Fn(Box<IpcKmsg>) -> Option<Box<IpcKmsg>> + Send + Sync,
{
    fn kobject_type(&self) -> KobjectType {
        self.kotype
    }

    fn invoke(&self, request: Box<IpcKmsg>) -> Option<Box<IpcKmsg>> {
        (self.func)(request)
    }
}

impl<F> fmt::Debug for FnKobject<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnKobject").field("kotype", &self.kotype).finish()
    }
}

// ============================================================================
// Server Dispatch
// ============================================================================

/// Dispatch a request to a kernel object
pub fn ipc_kobject_server(
    handler: &dyn KobjectHandler,
    kmsg: Box<IpcKmsg>,
) -> Option<Box<IpcKmsg>> {
    counter!(C_IPC_KOBJECT);
    log::trace!(
        "kobject: {} request id {} ({} bytes)",
        handler.kobject_type().name(),
        kmsg.id(),
        kmsg.size()
    );
    handler.invoke(kmsg)
}
