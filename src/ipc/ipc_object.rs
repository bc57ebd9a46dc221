//! IPC Object Abstraction
//!
//! Based on Mach4 ipc/ipc_object.h/c by CMU (1991)
//!
//! Ports and port sets are both IPC objects; an entry names one or the
//! other. The object itself carries no reference count here: lifetime is
//! anchored by the [`Handle`](super::handle::Handle) that backs each entry.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use super::port::Port;
use super::pset::PortSet;

// ============================================================================
// Object ID
// ============================================================================

/// Unique identifier for IPC objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct IpcObjectId(u64);

impl IpcObjectId {
    /// Generate a new unique object ID
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn value(self) -> u64 {
        self.0
    }
}

// ============================================================================
// Object
// ============================================================================

/// The object an entry refers to
#[derive(Debug, Clone)]
pub enum IpcObject {
    Port(Arc<Port>),
    PortSet(Arc<PortSet>),
}

impl IpcObject {
    pub fn id(&self) -> IpcObjectId {
        match self {
            IpcObject::Port(port) => port.id(),
            IpcObject::PortSet(pset) => pset.id(),
        }
    }

    /// False once the port or set has been destroyed
    pub fn is_active(&self) -> bool {
        match self {
            IpcObject::Port(port) => port.is_active(),
            IpcObject::PortSet(pset) => pset.is_active(),
        }
    }

    pub fn as_port(&self) -> Option<&Arc<Port>> {
        match self {
            IpcObject::Port(port) => Some(port),
            IpcObject::PortSet(_) => None,
        }
    }

    pub fn as_port_set(&self) -> Option<&Arc<PortSet>> {
        match self {
            IpcObject::PortSet(pset) => Some(pset),
            IpcObject::Port(_) => None,
        }
    }

    /// Same underlying object
    pub fn same_object(&self, other: &IpcObject) -> bool {
        match (self, other) {
            (IpcObject::Port(a), IpcObject::Port(b)) => Arc::ptr_eq(a, b),
            (IpcObject::PortSet(a), IpcObject::PortSet(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Get type name for debugging
    pub fn type_name(&self) -> &'static str {
        match self {
            IpcObject::Port(_) => "port",
            IpcObject::PortSet(_) => "port-set",
        }
    }
}
