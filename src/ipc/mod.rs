//! Mach-style Inter-Process Communication
//!
//! Capability spaces name ports and port sets; the message queue engine moves
//! messages between them. Everything a task can do with IPC goes through a
//! name in its [`space::IpcSpace`].

use thiserror::Error;

use crate::kern::{
    KernReturn, KERN_INVALID_ARGUMENT, KERN_INVALID_NAME, KERN_INVALID_RIGHT, KERN_INVALID_TASK,
    KERN_INVALID_VALUE, KERN_NAME_EXISTS, KERN_RESOURCE_SHORTAGE,
};

pub mod entry;
pub mod handle;
pub mod ipc_hash;
pub mod ipc_object;
pub mod kmsg;
pub mod mach_msg;
pub mod mqueue;
pub mod port;
pub mod port_ops;
pub mod pset;
pub mod space;

pub use entry::{MachPortName, MachPortRight, MACH_PORT_DEAD, MACH_PORT_NULL};
pub use kmsg::{IpcKmsg, MachPortSeqno};
pub use mqueue::{ipc_mqueue_receive, ipc_mqueue_send, ReceiveTarget, SendError};
pub use port::{Port, PortKind, PortStatus};
pub use pset::PortSet;
pub use space::IpcSpace;

// ============================================================================
// Errors
// ============================================================================

/// IPC error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpcError {
    /// Name is unbound, or bound to a right of the wrong kind
    #[error("invalid name")]
    InvalidName,
    /// Table slot or object allocation failed
    #[error("resource shortage")]
    ResourceShortage,
    /// The space is no longer active
    #[error("invalid task")]
    InvalidTask,
    /// The port or port set was destroyed while the caller waited
    #[error("port died")]
    PortDied,
    /// The port moved into or out of a port set while the caller waited
    #[error("port changed")]
    PortChanged,
    /// Receive buffer too small
    #[error("message too large, {required} bytes required")]
    TooLarge { required: usize },
    #[error("timed out")]
    TimedOut,
    #[error("interrupted")]
    Interrupted,
    /// The requested name is bound to a different object
    #[error("name exists")]
    NameExists,
    /// The right cannot be used for this operation
    #[error("invalid right")]
    InvalidRight,
    #[error("invalid value")]
    InvalidValue,
}

impl IpcError {
    /// True if the caller may retry with the same name.
    ///
    /// `PortDied`, `PortChanged` and the name errors mean the caller has to
    /// resolve the name again first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IpcError::TimedOut | IpcError::Interrupted | IpcError::TooLarge { .. }
        )
    }

    /// KERN_* code for the mach_port_* calls
    pub fn kern_return(&self) -> KernReturn {
        match self {
            IpcError::InvalidName => KERN_INVALID_NAME,
            IpcError::ResourceShortage => KERN_RESOURCE_SHORTAGE,
            IpcError::InvalidTask => KERN_INVALID_TASK,
            IpcError::NameExists => KERN_NAME_EXISTS,
            IpcError::InvalidRight => KERN_INVALID_RIGHT,
            IpcError::InvalidValue => KERN_INVALID_VALUE,
            IpcError::PortDied
            | IpcError::PortChanged
            | IpcError::TooLarge { .. }
            | IpcError::TimedOut
            | IpcError::Interrupted => KERN_INVALID_ARGUMENT,
        }
    }

    /// MACH_SEND_* code for a failed send
    pub fn send_return(&self) -> KernReturn {
        use mach_msg::*;
        match self {
            IpcError::TimedOut => MACH_SEND_TIMED_OUT,
            IpcError::Interrupted => MACH_SEND_INTERRUPTED,
            IpcError::ResourceShortage => MACH_SEND_NO_BUFFER,
            IpcError::InvalidRight => MACH_SEND_INVALID_RIGHT,
            IpcError::TooLarge { .. } => MACH_SEND_MSG_TOO_SMALL,
            IpcError::InvalidName
            | IpcError::InvalidTask
            | IpcError::PortDied
            | IpcError::PortChanged
            | IpcError::NameExists
            | IpcError::InvalidValue => MACH_SEND_INVALID_DEST,
        }
    }

    /// MACH_RCV_* code for a failed receive
    pub fn rcv_return(&self) -> KernReturn {
        use mach_msg::*;
        match self {
            IpcError::TimedOut => MACH_RCV_TIMED_OUT,
            IpcError::Interrupted => MACH_RCV_INTERRUPTED,
            IpcError::TooLarge { .. } => MACH_RCV_TOO_LARGE,
            IpcError::PortDied => MACH_RCV_PORT_DIED,
            IpcError::PortChanged => MACH_RCV_PORT_CHANGED,
            IpcError::ResourceShortage => MACH_RCV_HEADER_ERROR,
            IpcError::InvalidName
            | IpcError::InvalidTask
            | IpcError::NameExists
            | IpcError::InvalidRight
            | IpcError::InvalidValue => MACH_RCV_INVALID_NAME,
        }
    }
}

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;
